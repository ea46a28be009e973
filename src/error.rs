use thiserror::Error;

pub type SchedResult<T> = Result<T, SchedError>;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

impl SchedError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        SchedError::NotFound(what.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SchedError::InvalidArgument(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        SchedError::InvalidState(msg.into())
    }
}
