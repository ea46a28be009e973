use seqsched::limits::{JOB_ERROR_MAX, SEQS_PER_JOB};
use seqsched::{
    Database, Job, JobOutcome, JobState, NewProduct, Product, SchedConfig, SchedError, Scheduler, Sequence,
};
use std::collections::HashSet;
use std::path::PathBuf;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> Scheduler {
    let config = SchedConfig::new(dir.path().join("sched.sqlite3")).with_output_dir(dir.path().join("prods"));
    Scheduler::open(&config).await.unwrap()
}

fn db_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn product(job_id: i64, seq_id: i64, profile: &str) -> NewProduct {
    NewProduct {
        job_id,
        seq_id,
        profile_name: profile.to_string(),
        abc_name: "protein".to_string(),
        alt_loglik: -10.5,
        null_loglik: -20.25,
        profile_typeid: "standard".to_string(),
        version: "0.1.0".to_string(),
        match_data: "A,B,C".to_string(),
    }
}

async fn sequences(sched: &Scheduler, job_id: i64) -> Vec<Sequence> {
    let mut seqs = vec![];
    sched.jobs().get_sequences(job_id, |seq| seqs.push(seq)).await.unwrap();
    seqs
}

async fn products(sched: &Scheduler, job_id: i64) -> Vec<Product> {
    let mut prods = vec![];
    sched.jobs().get_products(job_id, |prod| prods.push(prod)).await.unwrap();
    prods
}

async fn all_jobs(sched: &Scheduler) -> Vec<Job> {
    let mut jobs = vec![];
    sched.jobs().get_all(|job| jobs.push(job)).await.unwrap();
    jobs
}

async fn setup_db(dir: &TempDir, sched: &Scheduler) -> Database {
    let path = db_file(dir, "db.bin", "HMMER3/f profiles");
    sched.register_database(&path).await.unwrap()
}

#[tokio::test]
async fn test_register_same_content_twice() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;

    let first = sched.register_database(db_file(&dir, "a.dcp", "PFAM 1")).await.unwrap();
    let again = sched.register_database(db_file(&dir, "copy.dcp", "PFAM 1")).await.unwrap();
    let other = sched.register_database(db_file(&dir, "b.dcp", "PFAM 2")).await.unwrap();

    assert_eq!(first, again);
    assert!(first.filename.ends_with("a.dcp"));
    assert_ne!(first.id, other.id);
    assert_ne!(first.hash64, other.hash64);

    assert_eq!(sched.catalog().get(other.id).await.unwrap(), other);
    assert_eq!(sched.catalog().get_by_hash(first.hash64).await.unwrap(), first);
    assert_eq!(sched.catalog().get_by_filename(&other.filename).await.unwrap(), other);

    let mut listed = vec![];
    sched.catalog().list_all(|db| listed.push(db)).await.unwrap();
    assert_eq!(listed, vec![first, other]);
}

#[tokio::test]
async fn test_register_errors() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;

    let err = sched.register_database(dir.path().join("missing.dcp")).await.unwrap_err();
    assert!(matches!(err, SchedError::Io(_)));

    let long_name = format!("{}.dcp", "x".repeat(130));
    let err = sched.register_database(&long_name).await.unwrap_err();
    assert!(matches!(err, SchedError::LimitExceeded(_)));

    assert!(matches!(sched.catalog().get(42).await, Err(SchedError::NotFound(_))));
}

#[tokio::test]
async fn test_submit_creates_pending_job() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;

    let job = sched
        .submit_job(db.id, true, false, vec![("s1", "ACDE"), ("s2", "FGHI")])
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Pend);
    assert_eq!(job.db_id, db.id);
    assert!(job.multi_hits);
    assert!(!job.hmmer3_compat);
    assert_eq!(job.error, "");
    assert_eq!(job.exec_started, None);

    assert_eq!(sched.jobs().get(job.id).await.unwrap(), job);

    let seqs = sequences(&sched, job.id).await;
    assert_eq!(seqs.len(), 2);
    assert_eq!(seqs[0].name, "s1");
    assert_eq!(seqs[1].data, "FGHI");
    assert!(seqs.iter().all(|s| s.job_id == job.id));
    assert_ne!(seqs[0].id, seqs[1].id);
    assert_eq!(sched.seqs().get(seqs[1].id).await.unwrap(), seqs[1]);
}

#[tokio::test]
async fn test_submit_sequence_count_bounds() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;

    let empty: Vec<(String, String)> = vec![];
    let err = sched.submit_job(db.id, false, false, empty).await.unwrap_err();
    assert!(matches!(err, SchedError::InvalidArgument(_)));

    let full: Vec<(String, String)> = (0..SEQS_PER_JOB).map(|i| (format!("s{}", i), "ACGT".to_string())).collect();
    let job = sched.submit_job(db.id, false, false, full).await.unwrap();
    assert_eq!(sequences(&sched, job.id).await.len(), SEQS_PER_JOB);

    let too_many: Vec<(String, String)> =
        (0..SEQS_PER_JOB + 1).map(|i| (format!("s{}", i), "ACGT".to_string())).collect();
    let err = sched.submit_job(db.id, false, false, too_many).await.unwrap_err();
    assert!(matches!(err, SchedError::LimitExceeded(_)));

    // Only the 64-sequence job made it to the store
    let jobs = all_jobs(&sched).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job.id);
    assert!(matches!(sched.jobs().get(job.id + 1).await, Err(SchedError::NotFound(_))));
}

#[tokio::test]
async fn test_submission_rollback_and_unknown_database() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;

    assert!(matches!(
        sched.begin_submission(db.id + 100, false, false).await,
        Err(SchedError::NotFound(_))
    ));

    let mut submission = sched.begin_submission(db.id, false, false).await.unwrap();
    submission.add_seq("s1", "ACDE").unwrap();
    submission.add_seq("s2", "FGHI").unwrap();
    assert_eq!(submission.len(), 2);
    submission.rollback();
    submission.rollback();
    assert!(submission.is_empty());
    assert!(matches!(submission.commit().await, Err(SchedError::InvalidArgument(_))));

    // Dropped without commit
    let mut abandoned = sched.begin_submission(db.id, false, false).await.unwrap();
    abandoned.add_seq("s1", "ACDE").unwrap();
    drop(abandoned);

    assert!(all_jobs(&sched).await.is_empty());
    assert_eq!(sched.next_job_for_worker().await.unwrap(), None);
}

#[tokio::test]
async fn test_sequence_limits() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;

    let mut submission = sched.begin_submission(db.id, false, false).await.unwrap();
    assert!(matches!(
        submission.add_seq("n".repeat(256), "ACGT"),
        Err(SchedError::LimitExceeded(_))
    ));
    assert!(matches!(
        submission.add_seq("big", "A".repeat(1024 * 1024 + 1)),
        Err(SchedError::LimitExceeded(_))
    ));
    submission.add_seq("n".repeat(255), "A".repeat(1024 * 1024)).unwrap();
    assert_eq!(submission.len(), 1);
}

#[tokio::test]
async fn test_claim_is_fifo() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;

    let first = sched.submit_job(db.id, false, false, vec![("a", "AC")]).await.unwrap();
    let second = sched.submit_job(db.id, false, false, vec![("b", "GT")]).await.unwrap();

    let claimed = sched.next_job_for_worker().await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.state, JobState::Run);
    assert!(claimed.exec_started.is_some());

    let claimed = sched.next_job_for_worker().await.unwrap().unwrap();
    assert_eq!(claimed.id, second.id);

    assert_eq!(sched.next_job_for_worker().await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_distinct() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;

    const JOBS: usize = 12;
    const WORKERS: usize = 8;
    for i in 0..JOBS {
        sched
            .submit_job(db.id, false, false, vec![(format!("s{}", i), "ACGT".to_string())])
            .await
            .unwrap();
    }

    let mut handles = vec![];
    for _ in 0..WORKERS {
        let sched = sched.clone();
        handles.push(tokio::spawn(async move { sched.next_job_for_worker().await }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        let job = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(job.state, JobState::Run);
        assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
    }
    assert_eq!(claimed.len(), WORKERS);

    let running = all_jobs(&sched)
        .await
        .into_iter()
        .filter(|job| job.state == JobState::Run)
        .count();
    assert_eq!(running, WORKERS);
}

#[tokio::test]
async fn test_end_to_end() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;

    let d1 = sched.register_database(db_file(&dir, "db.bin", "H1 content")).await.unwrap();
    let job = sched
        .submit_job(d1.id, false, false, vec![("s1", "ACDE"), ("s2", "FGHI")])
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Pend);
    assert_eq!(sequences(&sched, job.id).await.len(), 2);

    let running = sched.next_job_for_worker().await.unwrap().unwrap();
    assert_eq!(running.id, job.id);
    assert_eq!(running.state, JobState::Run);

    let mut scored = vec![];
    while let Some(seq) = sched.seqs().next_unscored(job.id).await.unwrap() {
        sched.record_product(&product(job.id, seq.id, "PF00001")).await.unwrap();
        scored.push(seq.name);
    }
    assert_eq!(scored, vec!["s1", "s2"]);

    sched.finish_job(job.id, JobOutcome::Success).await.unwrap();
    let done = sched.jobs().get(job.id).await.unwrap();
    assert_eq!(done.state, JobState::Done);
    assert!(done.exec_ended.is_some());
    assert!(done.exec_ended >= done.exec_started);

    let seqs = sequences(&sched, job.id).await;
    let prods = products(&sched, job.id).await;
    assert_eq!(prods.len(), 2);
    assert_eq!(prods[0].seq_id, seqs[0].id);
    assert_eq!(prods[1].seq_id, seqs[1].id);
    assert_eq!(prods[0].alt_loglik, -10.5);
    assert_eq!(sched.prods().get(prods[1].id).await.unwrap(), prods[1]);
}

#[tokio::test]
async fn test_failure_is_terminal() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;
    let job = sched.submit_job(db.id, false, false, vec![("s1", "ACDE")]).await.unwrap();

    // Cannot finish a job nobody claimed
    assert!(matches!(sched.jobs().mark_done(job.id).await, Err(SchedError::InvalidState(_))));

    sched.next_job_for_worker().await.unwrap().unwrap();
    sched
        .finish_job(job.id, JobOutcome::Failure("scoring crashed".into()))
        .await
        .unwrap();

    let failed = sched.jobs().get(job.id).await.unwrap();
    assert_eq!(failed.state, JobState::Fail);
    assert_eq!(failed.error, "scoring crashed");
    assert!(failed.exec_ended.is_some());

    assert!(matches!(sched.jobs().mark_done(job.id).await, Err(SchedError::InvalidState(_))));
    assert!(matches!(
        sched.jobs().mark_fail(job.id, "again").await,
        Err(SchedError::InvalidState(_))
    ));
    assert!(matches!(sched.jobs().mark_done(job.id + 1).await, Err(SchedError::NotFound(_))));
    assert_eq!(sched.jobs().get(job.id).await.unwrap().error, "scoring crashed");
}

#[tokio::test]
async fn test_fail_message_is_clamped() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;
    let job = sched.submit_job(db.id, false, false, vec![("s1", "ACDE")]).await.unwrap();
    sched.next_job_for_worker().await.unwrap().unwrap();

    let msg = "ü".repeat(200);
    sched.jobs().mark_fail(job.id, &msg).await.unwrap();

    let error = sched.jobs().get(job.id).await.unwrap().error;
    assert!(error.len() <= JOB_ERROR_MAX);
    assert_eq!(error.chars().count(), JOB_ERROR_MAX / 2);
    assert!(error.chars().all(|c| c == 'ü'));
}

#[tokio::test]
async fn test_product_must_reference_own_sequence() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;
    let a = sched.submit_job(db.id, false, false, vec![("a", "AC")]).await.unwrap();
    let b = sched.submit_job(db.id, false, false, vec![("b", "GT")]).await.unwrap();
    let seq_b = sequences(&sched, b.id).await.remove(0);

    let err = sched.record_product(&product(a.id, seq_b.id, "PF1")).await.unwrap_err();
    assert!(matches!(err, SchedError::InvalidArgument(_)));

    let mut oversized = product(b.id, seq_b.id, "PF1");
    oversized.match_data = "M".repeat(5 * 1024 * 1024 + 1);
    assert!(matches!(
        sched.record_product(&oversized).await,
        Err(SchedError::LimitExceeded(_))
    ));

    assert!(products(&sched, a.id).await.is_empty());
    assert!(products(&sched, b.id).await.is_empty());
    assert!(matches!(sched.prods().get(1).await, Err(SchedError::NotFound(_))));
}

#[tokio::test]
async fn test_next_after_walks_all_sequences() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;
    let job = sched
        .submit_job(db.id, false, false, vec![("s1", "A"), ("s2", "C"), ("s3", "G")])
        .await
        .unwrap();

    let mut names = vec![];
    let mut cursor = None;
    while let Some(seq) = sched.seqs().next_after(job.id, cursor).await.unwrap() {
        cursor = Some(seq.id);
        names.push(seq.name);
    }
    assert_eq!(names, vec!["s1", "s2", "s3"]);

    assert!(matches!(
        sched.seqs().next_after(job.id + 1, None).await,
        Err(SchedError::NotFound(_))
    ));
    assert!(matches!(
        sched.seqs().next_unscored(job.id + 1).await,
        Err(SchedError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_progress_saturates_while_running() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;
    let job = sched.submit_job(db.id, false, false, vec![("s1", "ACDE")]).await.unwrap();
    assert_eq!(job.progress, 0);

    // Only running jobs make progress
    assert!(matches!(
        sched.jobs().add_progress(job.id, 10).await,
        Err(SchedError::InvalidState(_))
    ));
    sched.next_job_for_worker().await.unwrap().unwrap();

    assert_eq!(sched.jobs().add_progress(job.id, 40).await.unwrap(), 40);
    assert_eq!(sched.jobs().add_progress(job.id, 0).await.unwrap(), 40);
    assert_eq!(sched.jobs().add_progress(job.id, 70).await.unwrap(), 100);
    assert_eq!(sched.jobs().get(job.id).await.unwrap().progress, 100);

    assert!(matches!(
        sched.jobs().add_progress(job.id, 101).await,
        Err(SchedError::InvalidArgument(_))
    ));
    assert!(matches!(
        sched.jobs().add_progress(job.id, -1).await,
        Err(SchedError::InvalidArgument(_))
    ));
    assert!(matches!(
        sched.jobs().add_progress(job.id + 1, 5).await,
        Err(SchedError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_done_job_reports_full_progress() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;
    let job = sched.submit_job(db.id, false, false, vec![("s1", "ACDE")]).await.unwrap();
    sched.next_job_for_worker().await.unwrap().unwrap();
    sched.jobs().add_progress(job.id, 30).await.unwrap();

    sched.finish_job(job.id, JobOutcome::Success).await.unwrap();
    assert_eq!(sched.jobs().get(job.id).await.unwrap().progress, 100);
    assert!(matches!(
        sched.jobs().add_progress(job.id, 1).await,
        Err(SchedError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_remove_database() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let used = sched.register_database(db_file(&dir, "used.dcp", "PFAM 1")).await.unwrap();
    let unused = sched.register_database(db_file(&dir, "unused.dcp", "PFAM 2")).await.unwrap();
    sched.submit_job(used.id, false, false, vec![("s1", "ACDE")]).await.unwrap();

    assert!(matches!(
        sched.catalog().remove(used.id).await,
        Err(SchedError::InvalidState(_))
    ));
    assert_eq!(sched.catalog().get(used.id).await.unwrap(), used);

    sched.catalog().remove(unused.id).await.unwrap();
    assert!(matches!(sched.catalog().get(unused.id).await, Err(SchedError::NotFound(_))));
    assert!(matches!(
        sched.catalog().remove(unused.id).await,
        Err(SchedError::NotFound(_))
    ));

    // Same content can be registered again once removed
    let again = sched.register_database(db_file(&dir, "again.dcp", "PFAM 2")).await.unwrap();
    assert_ne!(again.id, unused.id);
    assert_eq!(again.hash64, unused.hash64);
}

#[tokio::test]
async fn test_product_field_limits() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;
    let job = sched.submit_job(db.id, false, false, vec![("a", "AC")]).await.unwrap();
    let seq = sequences(&sched, job.id).await.remove(0);

    let mut prod = product(job.id, seq.id, &"P".repeat(64));
    assert!(matches!(sched.record_product(&prod).await, Err(SchedError::LimitExceeded(_))));
    prod.profile_name = "P".repeat(63);

    let too_long = "x".repeat(16);
    let mut abc = prod.clone();
    abc.abc_name = too_long.clone();
    let mut typeid = prod.clone();
    typeid.profile_typeid = too_long.clone();
    let mut version = prod.clone();
    version.version = too_long;
    for rejected in [abc, typeid, version] {
        assert!(matches!(
            sched.record_product(&rejected).await,
            Err(SchedError::LimitExceeded(_))
        ));
    }

    let mut split = prod.clone();
    split.match_data = "A,B\nC,D".into();
    assert!(matches!(sched.record_product(&split).await, Err(SchedError::InvalidArgument(_))));

    assert!(products(&sched, job.id).await.is_empty());
    sched.record_product(&prod).await.unwrap();
    assert_eq!(products(&sched, job.id).await.len(), 1);
}

#[tokio::test]
async fn test_one_product_per_sequence_and_profile() {
    let dir = TempDir::new().unwrap();
    let sched = open(&dir).await;
    let db = setup_db(&dir, &sched).await;
    let job = sched.submit_job(db.id, false, false, vec![("a", "AC")]).await.unwrap();
    let seq = sequences(&sched, job.id).await.remove(0);

    sched.record_product(&product(job.id, seq.id, "PF1")).await.unwrap();
    assert!(matches!(
        sched.record_product(&product(job.id, seq.id, "PF1")).await,
        Err(SchedError::InvalidState(_))
    ));
    sched.record_product(&product(job.id, seq.id, "PF2")).await.unwrap();

    let names: Vec<String> = products(&sched, job.id).await.into_iter().map(|p| p.profile_name).collect();
    assert_eq!(names, vec!["PF1", "PF2"]);
}
