use histguard_history::DigestError;
use thiserror::Error;

use crate::model::DigestKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("digest row {0} changed since it was read")]
    Conflict(DigestKey),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        StorageError::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        StorageError::Internal(msg.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Digest(#[from] DigestError),
}

pub type StorageResult<T> = Result<T, StorageError>;
pub type IntegrityResult<T> = Result<T, IntegrityError>;
