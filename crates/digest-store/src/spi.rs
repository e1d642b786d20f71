use async_trait::async_trait;
use histguard_history::HistoryDigest;

use crate::errors::StorageResult;
use crate::model::DigestKey;
use crate::tx::DigestTxn;

/// Backend holding digest rows. Nothing outside this crate's
/// [`IntegrityStore`](crate::IntegrityStore) is expected to call it on the
/// request path.
#[async_trait]
pub trait DigestStore: Send + Sync {
    async fn get(&self, key: &DigestKey) -> StorageResult<Option<HistoryDigest>>;

    /// Upsert.
    async fn put(&self, key: &DigestKey, digest: HistoryDigest) -> StorageResult<()>;

    async fn delete(&self, key: &DigestKey) -> StorageResult<()>;

    /// Applies every staged write of `txn` or none of them. Fails with
    /// [`StorageError::Conflict`](crate::StorageError::Conflict) when a row
    /// recorded as read no longer holds the value observed.
    async fn commit(&self, txn: DigestTxn) -> StorageResult<CommitReport>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub upserted: usize,
    pub deleted: usize,
}
