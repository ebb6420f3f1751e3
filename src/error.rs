/// Opossum error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum OpossumError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("concurrency mismatch: expected last position {expected:?}, found {actual}")]
    ConcurrencyMismatch { expected: Option<i64>, actual: i64 },

    #[error("append condition failed: query matched a disqualifying event")]
    AppendConditionFailed,

    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OpossumError>;
