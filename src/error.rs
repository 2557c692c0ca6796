use thiserror::Error;

/// Everything a store operation can fail with. The first four are benign
/// caller errors and leave the store untouched. `Io` aborts the current
/// operation and leaves reconciliation to the next open. `Corrupt` poisons
/// the engine until the store is re-opened.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("no object at {path:?}")]
    NotFound { path: String },

    #[error("{path:?} is already taken")]
    AlreadyExists { path: String },

    #[error("the store is not open")]
    NotReady,

    #[error("store i/o failed")]
    Io(#[from] std::io::Error),

    #[error("store structure is corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
