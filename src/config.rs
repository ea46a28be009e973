use std::path::PathBuf;
use std::time::Duration;

/// Where the scheduler keeps its state and how it talks to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedConfig {
    /// SQLite file, created on first open.
    pub database: PathBuf,
    /// Directory receiving the per-slot product streams.
    pub output_dir: PathBuf,
    pub max_connections: u32,
    /// How long a statement waits on another writer before giving up.
    pub busy_timeout: Duration,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            database: PathBuf::from("seqsched.sqlite3"),
            output_dir: PathBuf::from("prods"),
            max_connections: 5,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

impl SchedConfig {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        SchedConfig {
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}
