use thiserror::Error;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Item '{0}' already exists")]
    AlreadyExists(String),

    #[error("Item '{0}' not found")]
    NotFound(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Lock conflict or timeout: {0}")]
    ConflictOrTimeout(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Restock service unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("Backup archival failed: {0}")]
    ArchivalFailure(String),

    #[error("Backup retention sweep failed: {0}")]
    RetentionFailure(String),

    #[error("Restore failed: {0}")]
    RestoreFailure(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl InventoryError {
    /// True for failures a caller may resolve by retrying with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConflictOrTimeout(_) | Self::DownstreamUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, InventoryError>;

impl<T> From<std::sync::PoisonError<T>> for InventoryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
