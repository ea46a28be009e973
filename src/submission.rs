use crate::db::{now, DbHandle};
use crate::limits::{check_len, SEQS_PER_JOB, SEQ_DATA_MAX, SEQ_NAME_MAX};
use crate::{Job, JobState, SchedError, SchedResult};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
struct StagedSeq {
    name: String,
    data: String,
}

/// Sequences staged in memory for one job. Nothing reaches the store before
/// `commit`, so dropping a submission leaves no trace.
pub struct Submission {
    db: DbHandle,
    db_id: i64,
    multi_hits: bool,
    hmmer3_compat: bool,
    seqs: Vec<StagedSeq>,
}

impl Submission {
    /// Opens a submission against database `db_id`, which must exist.
    pub async fn begin(db: &DbHandle, db_id: i64, multi_hits: bool, hmmer3_compat: bool) -> SchedResult<Self> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM db WHERE id = ?")
            .bind(db_id)
            .fetch_optional(db.pool())
            .await?;
        if found.is_none() {
            return Err(SchedError::not_found(format!("database {}", db_id)));
        }

        debug!(db_id, "Submission opened");
        Ok(Submission {
            db: db.clone(),
            db_id,
            multi_hits,
            hmmer3_compat,
            seqs: Vec::with_capacity(SEQS_PER_JOB),
        })
    }

    pub fn add_seq(&mut self, name: impl Into<String>, data: impl Into<String>) -> SchedResult<()> {
        if self.seqs.len() >= SEQS_PER_JOB {
            return Err(SchedError::LimitExceeded(format!(
                "a job holds at most {} sequences",
                SEQS_PER_JOB
            )));
        }
        let name = name.into();
        let data = data.into();
        check_len("sequence name", &name, SEQ_NAME_MAX)?;
        check_len("sequence data", &data, SEQ_DATA_MAX)?;

        self.seqs.push(StagedSeq { name, data });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    /// Discards everything staged so far. Calling it again is a no-op.
    pub fn rollback(&mut self) {
        if !self.seqs.is_empty() {
            debug!(db_id = self.db_id, staged = self.seqs.len(), "Submission rolled back");
        }
        self.seqs.clear();
    }

    /// Writes the job and its sequences as one unit and returns the new
    /// `pend` job. On any storage failure the transaction is rolled back.
    #[instrument(name = "submission.commit", skip_all, fields(db_id = self.db_id, job_id))]
    pub async fn commit(self) -> SchedResult<Job> {
        if self.seqs.is_empty() {
            return Err(SchedError::invalid("a job needs at least one sequence"));
        }

        let submission = now();
        let mut tx = self.db.pool().begin().await?;

        let job_id = sqlx::query(
            "INSERT INTO job (db_id, multi_hits, hmmer3_compat, state, error, submission) \
            VALUES (?, ?, ?, 'pend', '', ?)",
        )
        .bind(self.db_id)
        .bind(self.multi_hits)
        .bind(self.hmmer3_compat)
        .bind(submission)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for seq in &self.seqs {
            sqlx::query("INSERT INTO seq (job_id, name, data) VALUES (?, ?, ?)")
                .bind(job_id)
                .bind(&seq.name)
                .bind(&seq.data)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::Span::current().record("job_id", job_id);
        info!(nseqs = self.seqs.len(), "Job submitted");

        Ok(Job {
            id: job_id,
            db_id: self.db_id,
            multi_hits: self.multi_hits,
            hmmer3_compat: self.hmmer3_compat,
            state: JobState::Pend,
            error: String::new(),
            progress: 0,
            submission,
            exec_started: None,
            exec_ended: None,
        })
    }
}
