use crate::db::{job_exists, DbHandle};
use crate::{SchedError, SchedResult, Sequence};
use futures::TryStreamExt;

/// Read side of per-job input sequences. Sequences are only ever written by
/// a committed [`crate::submission::Submission`].
#[derive(Clone)]
pub struct SequenceStore {
    db: DbHandle,
}

impl SequenceStore {
    pub fn new(db: DbHandle) -> Self {
        SequenceStore { db }
    }

    pub async fn get(&self, seq_id: i64) -> SchedResult<Sequence> {
        sqlx::query_as::<_, Sequence>("SELECT id, job_id, name, data FROM seq WHERE id = ?")
            .bind(seq_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| SchedError::not_found(format!("sequence {}", seq_id)))
    }

    /// Oldest sequence of `job_id` without any product yet. `None` means the
    /// job has nothing left to score.
    pub async fn next_unscored(&self, job_id: i64) -> SchedResult<Option<Sequence>> {
        let seq = sqlx::query_as::<_, Sequence>(
            "SELECT s.id, s.job_id, s.name, s.data FROM seq s \
            WHERE s.job_id = ? \
            AND NOT EXISTS (SELECT 1 FROM prod p WHERE p.seq_id = s.id) \
            ORDER BY s.id LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(self.db.pool())
        .await?;
        self.or_missing_job(job_id, seq).await
    }

    /// Cursor over a job's sequences in creation order: the first one after
    /// `after`, or the very first when `after` is `None`.
    pub async fn next_after(&self, job_id: i64, after: Option<i64>) -> SchedResult<Option<Sequence>> {
        let seq = sqlx::query_as::<_, Sequence>(
            "SELECT id, job_id, name, data FROM seq \
            WHERE job_id = ? AND id > ? \
            ORDER BY id LIMIT 1",
        )
        .bind(job_id)
        .bind(after.unwrap_or(0))
        .fetch_optional(self.db.pool())
        .await?;
        self.or_missing_job(job_id, seq).await
    }

    pub async fn get_all<F>(&self, job_id: i64, mut cb: F) -> SchedResult<()>
    where
        F: FnMut(Sequence),
    {
        if !job_exists(self.db.pool(), job_id).await? {
            return Err(SchedError::not_found(format!("job {}", job_id)));
        }
        let mut rows = sqlx::query_as::<_, Sequence>(
            "SELECT id, job_id, name, data FROM seq WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch(self.db.pool());
        while let Some(seq) = rows.try_next().await? {
            cb(seq);
        }
        Ok(())
    }

    async fn or_missing_job(&self, job_id: i64, seq: Option<Sequence>) -> SchedResult<Option<Sequence>> {
        if seq.is_none() && !job_exists(self.db.pool(), job_id).await? {
            return Err(SchedError::not_found(format!("job {}", job_id)));
        }
        Ok(seq)
    }
}
