use crate::db::DbHandle;
use crate::limits::{check_len, FILENAME_MAX};
use crate::{Database, SchedError, SchedResult};
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument};

const HASH_BUFSIZE: usize = 64 * 1024;

/// Registry of profile databases, deduplicated by content hash.
#[derive(Clone)]
pub struct DatabaseCatalog {
    db: DbHandle,
}

impl DatabaseCatalog {
    pub fn new(db: DbHandle) -> Self {
        DatabaseCatalog { db }
    }

    /// Registers the file at `filename`, or returns the existing record if a
    /// file with the same content was registered before.
    #[instrument(name = "catalog.register", skip_all, fields(filename = %filename.as_ref().display()))]
    pub async fn register(&self, filename: impl AsRef<Path>) -> SchedResult<Database> {
        let path = filename.as_ref();
        let name = path
            .to_str()
            .ok_or_else(|| SchedError::invalid("database filename is not valid UTF-8"))?;
        check_len("database filename", name, FILENAME_MAX)?;

        let hash64 = content_hash(path).await?;
        debug!(hash64, "Hashed database file");

        let inserted = sqlx::query(
            "INSERT INTO db (hash64, filename) VALUES (?, ?) \
            ON CONFLICT (hash64) DO NOTHING",
        )
        .bind(hash64)
        .bind(name)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        let database = self.get_by_hash(hash64).await?;
        if inserted == 1 {
            info!(db_id = database.id, "Registered database");
        } else {
            debug!(db_id = database.id, "Database already registered");
        }
        Ok(database)
    }

    pub async fn get(&self, id: i64) -> SchedResult<Database> {
        sqlx::query_as::<_, Database>("SELECT id, hash64, filename FROM db WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| SchedError::not_found(format!("database {}", id)))
    }

    pub async fn get_by_hash(&self, hash64: i64) -> SchedResult<Database> {
        sqlx::query_as::<_, Database>("SELECT id, hash64, filename FROM db WHERE hash64 = ?")
            .bind(hash64)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| SchedError::not_found(format!("database with hash {}", hash64)))
    }

    /// First database registered under `filename`. Filenames are not unique,
    /// only content is.
    pub async fn get_by_filename(&self, filename: &str) -> SchedResult<Database> {
        sqlx::query_as::<_, Database>(
            "SELECT id, hash64, filename FROM db WHERE filename = ? ORDER BY id LIMIT 1",
        )
        .bind(filename)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| SchedError::not_found(format!("database {}", filename)))
    }

    /// Hands every database to `cb` in storage order, one row at a time.
    pub async fn list_all<F>(&self, mut cb: F) -> SchedResult<()>
    where
        F: FnMut(Database),
    {
        let mut rows = sqlx::query_as::<_, Database>("SELECT id, hash64, filename FROM db ORDER BY id")
            .fetch(self.db.pool());
        while let Some(database) = rows.try_next().await? {
            cb(database);
        }
        Ok(())
    }

    /// Unregisters a database. Fails with `InvalidState` while any job still
    /// references it.
    #[instrument(name = "catalog.remove", skip(self))]
    pub async fn remove(&self, id: i64) -> SchedResult<()> {
        let removed = sqlx::query(
            "DELETE FROM db WHERE id = ? \
            AND NOT EXISTS (SELECT 1 FROM job WHERE db_id = ?)",
        )
        .bind(id)
        .bind(id)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if removed == 0 {
            self.get(id).await?;
            return Err(SchedError::state(format!("database {} is referenced by jobs", id)));
        }
        info!("Database removed");
        Ok(())
    }
}

/// 64-bit content hash: the leading eight bytes of the file's SHA-256.
pub async fn content_hash(path: &Path) -> SchedResult<i64> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFSIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    Ok(i64::from_be_bytes(head))
}
