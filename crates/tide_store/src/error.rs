//! Error surface of the write service.
//!
//! `StorageError` is the only failure that must stop a replica: it is
//! returned unchanged to the replication layer. Validation failures, failed
//! checks and overflows are not errors at this level; they are reported
//! through the response `Status`. `WriteError` adds the protocol misuse
//! cases (batch ordering, decree regression), which are caller bugs.

use tide_proto::{RequestKind, Status, TimetagError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage i/o failure: {0}")]
    Io(String),
    #[error("corrupted record at key {key:?}: {reason}")]
    Corruption { key: Vec<u8>, reason: String },
    #[error("fjall engine failure: {0}")]
    Engine(#[from] fjall::Error),
}

impl StorageError {
    /// Status reported to every response affected by this failure.
    pub fn status(&self) -> Status {
        match self {
            StorageError::Io(_) | StorageError::Engine(_) => Status::IoError,
            StorageError::Corruption { .. } => Status::Corruption,
        }
    }

    pub fn code(&self) -> i32 {
        self.status().code()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("batch write for decree {decree} issued before batch_prepare")]
    BatchNotPrepared { decree: i64 },
    #[error("batch for decree {open} is still open")]
    BatchInProgress { open: i64 },
    #[error("batch is open for decree {expected}, got decree {actual}")]
    DecreeMismatch { expected: i64, actual: i64 },
    #[error("decree {decree} is below the last applied decree {last_applied}")]
    DecreeRegression { decree: i64, last_applied: i64 },
    #[error("{kind:?} request cannot be batched with other requests (decree {decree})")]
    Unbatchable { decree: i64, kind: RequestKind },
    #[error("invalid write timestamp: {0}")]
    Timetag(#[from] TimetagError),
}

impl WriteError {
    pub fn status(&self) -> Status {
        match self {
            WriteError::Storage(err) => err.status(),
            _ => Status::InvalidArgument,
        }
    }

    /// True when the replica must stop applying decrees.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, WriteError::Storage(_))
    }
}

pub type WriteResult<T> = Result<T, WriteError>;
