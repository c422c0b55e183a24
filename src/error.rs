use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error: {0}")]
    IoMessage(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Out of space: {0}")]
    OutOfSpace(String),

    #[error("Entry too large: {0}")]
    EntryTooLarge(String),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Validation rejected the update")]
    ValidationRejected,

    #[error("Serializer mismatch: {0}")]
    SerializerMismatch(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Storage is read-only after a failed rollback")]
    ReadOnly,

    #[error("Atomic operation error: {0}")]
    AtomicOperation(String),

    #[error("Index error: {0}")]
    Index(String),
}

impl StorageError {
    /// True when the error indicates on-disk state that cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corruption(_) | StorageError::SerializerMismatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
