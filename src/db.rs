use crate::{SchedConfig, SchedResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Shared handle to the durable store. Cloning is cheap; every clone talks
/// to the same pool.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<SqlitePool>,
}

impl DbHandle {
    #[instrument(name = "db.open", skip_all, fields(database = %config.database.display()))]
    pub async fn new(config: &SchedConfig) -> SchedResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.database)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;
        debug!("Store ready");

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Unix time in seconds, the resolution every timestamp column uses.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) async fn job_exists(pool: &SqlitePool, job_id: i64) -> SchedResult<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM job WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}
