use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupted record at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("sequence {requested} has been compacted, first available is {first_available}")]
    Compacted { requested: u64, first_available: u64 },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("archive sink error: {0}")]
    Archive(String),

    #[error("event store is closed")]
    Closed,

    #[error("event store refuses writes after a failed write: {0}")]
    Poisoned(String),
}

impl StoreError {
    pub fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }

    /// Copy of this error for fanning one write failure out to every waiter
    /// of a group commit.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            StoreError::Io(e) => StoreError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StoreError::Serialization(e) => {
                StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
            }
            StoreError::Corrupted { offset, reason } => StoreError::corrupted(*offset, reason.clone()),
            StoreError::Compacted { requested, first_available } => StoreError::Compacted {
                requested: *requested,
                first_available: *first_available,
            },
            StoreError::InvalidSnapshot(m) => StoreError::InvalidSnapshot(m.clone()),
            StoreError::InvalidPattern(e) => StoreError::InvalidPattern(e.clone()),
            StoreError::Checkpoint(m) => StoreError::Checkpoint(m.clone()),
            StoreError::Archive(m) => StoreError::Archive(m.clone()),
            StoreError::Closed => StoreError::Closed,
            StoreError::Poisoned(m) => StoreError::Poisoned(m.clone()),
        }
    }
}
