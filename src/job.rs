use crate::db::{now, DbHandle};
use crate::limits::{clamp, JOB_ERROR_MAX, PROGRESS_MAX};
use crate::{Job, JobState, Product, SchedError, SchedResult, Sequence};
use crate::{prod::ProductStore, seq::SequenceStore};
use futures::TryStreamExt;
use tracing::{debug, info, instrument, warn};

const JOB_COLUMNS: &str =
    "id, db_id, multi_hits, hmmer3_compat, state, error, progress, submission, exec_started, exec_ended";

/// `pend -> run -> done | fail`, each step a conditional `UPDATE` on the
/// current state.
#[derive(Clone)]
pub struct JobLifecycle {
    db: DbHandle,
}

impl JobLifecycle {
    pub fn new(db: DbHandle) -> Self {
        JobLifecycle { db }
    }

    pub async fn get(&self, job_id: i64) -> SchedResult<Job> {
        sqlx::query_as::<_, Job>(&format!("SELECT {} FROM job WHERE id = ?", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| SchedError::not_found(format!("job {}", job_id)))
    }

    /// Moves the oldest pending job to `run` and returns it. `None` when the
    /// queue is empty. Selection and update happen in one statement, so a job
    /// is handed to at most one caller.
    #[instrument(name = "job.claim_next_pending", skip_all)]
    pub async fn claim_next_pending(&self) -> SchedResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "UPDATE job SET state = 'run', exec_started = ? \
            WHERE id = (SELECT id FROM job WHERE state = 'pend' ORDER BY submission, id LIMIT 1) \
            AND state = 'pend' \
            RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(now())
        .fetch_optional(self.db.pool())
        .await?;

        match &job {
            Some(job) => info!(job_id = job.id, "Job claimed"),
            None => debug!("No pending job"),
        }
        Ok(job)
    }

    #[instrument(name = "job.mark_done", skip(self))]
    pub async fn mark_done(&self, job_id: i64) -> SchedResult<()> {
        let updated = sqlx::query(
            "UPDATE job SET state = 'done', progress = 100, exec_ended = ? \
            WHERE id = ? AND state = 'run'",
        )
        .bind(now())
        .bind(job_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(job_id, JobState::Done).await);
        }
        info!("Job done");
        Ok(())
    }

    /// Fails a running job. `msg` is clamped to the error column's limit on a
    /// character boundary.
    #[instrument(name = "job.mark_fail", skip(self, msg))]
    pub async fn mark_fail(&self, job_id: i64, msg: &str) -> SchedResult<()> {
        let error = clamp(msg, JOB_ERROR_MAX);
        let updated = sqlx::query(
            "UPDATE job SET state = 'fail', exec_ended = ?, error = ? \
            WHERE id = ? AND state = 'run'",
        )
        .bind(now())
        .bind(error)
        .bind(job_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(job_id, JobState::Fail).await);
        }
        warn!(error, "Job failed");
        Ok(())
    }

    /// Adds `increment` percent to a running job's progress, saturating at
    /// 100, and returns the new value.
    #[instrument(name = "job.add_progress", skip(self))]
    pub async fn add_progress(&self, job_id: i64, increment: i64) -> SchedResult<i64> {
        if !(0..=PROGRESS_MAX).contains(&increment) {
            return Err(SchedError::invalid(format!(
                "progress increment {} is outside 0..={}",
                increment, PROGRESS_MAX
            )));
        }
        let progress: Option<i64> = sqlx::query_scalar(
            "UPDATE job SET progress = MIN(?, progress + ?) \
            WHERE id = ? AND state = 'run' \
            RETURNING progress",
        )
        .bind(PROGRESS_MAX)
        .bind(increment)
        .bind(job_id)
        .fetch_optional(self.db.pool())
        .await?;

        match progress {
            Some(progress) => {
                debug!(progress, "Job progressed");
                Ok(progress)
            }
            None => {
                let job = self.get(job_id).await?;
                Err(SchedError::state(format!(
                    "job {} is {}, only running jobs make progress",
                    job_id, job.state
                )))
            }
        }
    }

    pub async fn get_sequences<F>(&self, job_id: i64, cb: F) -> SchedResult<()>
    where
        F: FnMut(Sequence),
    {
        SequenceStore::new(self.db.clone()).get_all(job_id, cb).await
    }

    pub async fn get_products<F>(&self, job_id: i64, cb: F) -> SchedResult<()>
    where
        F: FnMut(Product),
    {
        ProductStore::new(self.db.clone()).get_all(job_id, cb).await
    }

    /// Every job in id order, one row at a time.
    pub async fn get_all<F>(&self, mut cb: F) -> SchedResult<()>
    where
        F: FnMut(Job),
    {
        let sql = format!("SELECT {} FROM job ORDER BY id", JOB_COLUMNS);
        let mut rows = sqlx::query_as::<_, Job>(&sql).fetch(self.db.pool());
        while let Some(job) = rows.try_next().await? {
            cb(job);
        }
        Ok(())
    }

    async fn transition_error(&self, job_id: i64, to: JobState) -> SchedError {
        match self.get(job_id).await {
            Ok(job) => SchedError::state(format!(
                "job {} is {}, cannot move to {}",
                job_id, job.state, to
            )),
            Err(err) => err,
        }
    }
}
