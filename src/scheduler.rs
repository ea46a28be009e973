use crate::catalog::DatabaseCatalog;
use crate::db::DbHandle;
use crate::job::JobLifecycle;
use crate::prod::ProductStore;
use crate::seq::SequenceStore;
use crate::submission::Submission;
use crate::writer::ProductWriter;
use crate::{Database, Job, NewProduct, Product, SchedConfig, SchedResult};
use std::path::Path;
use tracing::{debug, instrument};

/// How a worker ended a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure(String),
}

/// Entry point for submitters and workers. Cheap to clone; clones share the
/// same store and slot table.
#[derive(Clone)]
pub struct Scheduler {
    db: DbHandle,
    catalog: DatabaseCatalog,
    seqs: SequenceStore,
    jobs: JobLifecycle,
    prods: ProductStore,
    writer: ProductWriter,
}

impl Scheduler {
    pub async fn open(config: &SchedConfig) -> SchedResult<Self> {
        let db = DbHandle::new(config).await?;
        let writer = ProductWriter::new(&config.output_dir)?;
        Ok(Scheduler {
            catalog: DatabaseCatalog::new(db.clone()),
            seqs: SequenceStore::new(db.clone()),
            jobs: JobLifecycle::new(db.clone()),
            prods: ProductStore::new(db.clone()),
            writer,
            db,
        })
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    pub fn catalog(&self) -> &DatabaseCatalog {
        &self.catalog
    }

    pub fn seqs(&self) -> &SequenceStore {
        &self.seqs
    }

    pub fn jobs(&self) -> &JobLifecycle {
        &self.jobs
    }

    pub fn prods(&self) -> &ProductStore {
        &self.prods
    }

    pub fn writer(&self) -> &ProductWriter {
        &self.writer
    }

    pub async fn register_database(&self, filename: impl AsRef<Path>) -> SchedResult<Database> {
        self.catalog.register(filename).await
    }

    /// Opens a submission for callers that stage sequences themselves.
    pub async fn begin_submission(&self, db_id: i64, multi_hits: bool, hmmer3_compat: bool) -> SchedResult<Submission> {
        Submission::begin(&self.db, db_id, multi_hits, hmmer3_compat).await
    }

    /// Creates a `pend` job holding `seqs`, all or nothing.
    #[instrument(name = "scheduler.submit_job", skip(self, seqs))]
    pub async fn submit_job<I, N, D>(&self, db_id: i64, multi_hits: bool, hmmer3_compat: bool, seqs: I) -> SchedResult<Job>
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: Into<String>,
    {
        let mut submission = self.begin_submission(db_id, multi_hits, hmmer3_compat).await?;
        for (name, data) in seqs {
            if let Err(err) = submission.add_seq(name, data) {
                debug!(error = %err, "Rejecting submission");
                submission.rollback();
                return Err(err);
            }
        }
        submission.commit().await
    }

    pub async fn next_job_for_worker(&self) -> SchedResult<Option<Job>> {
        self.jobs.claim_next_pending().await
    }

    pub async fn record_product(&self, prod: &NewProduct) -> SchedResult<Product> {
        self.prods.add(prod).await
    }

    pub async fn finish_job(&self, job_id: i64, outcome: JobOutcome) -> SchedResult<()> {
        match outcome {
            JobOutcome::Success => self.jobs.mark_done(job_id).await,
            JobOutcome::Failure(msg) => self.jobs.mark_fail(job_id, &msg).await,
        }
    }
}
