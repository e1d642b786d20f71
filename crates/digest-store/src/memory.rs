use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use histguard_history::HistoryDigest;
use parking_lot::RwLock;
use tracing::debug;

use crate::errors::{StorageError, StorageResult};
use crate::model::{DigestKey, WriteOp};
use crate::spi::{CommitReport, DigestStore};
use crate::tx::DigestTxn;

/// In-process digest table.
///
/// Commits validate and apply under a single write lock, so a transaction
/// is observed either entirely or not at all. Write faults can be injected
/// per key to exercise that guarantee.
#[derive(Clone, Default)]
pub struct MemoryDigestStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: RwLock<HashMap<DigestKey, HistoryDigest>>,
    faults: RwLock<HashSet<DigestKey>>,
}

impl MemoryDigestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later write touching `key` fail as unavailable.
    pub fn inject_write_fault(&self, key: DigestKey) {
        self.inner.faults.write().insert(key);
    }

    pub fn clear_faults(&self) {
        self.inner.faults.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rows.read().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<DigestKey, HistoryDigest> {
        self.inner.rows.read().clone()
    }

    fn check_fault(&self, key: &DigestKey) -> StorageResult<()> {
        if self.inner.faults.read().contains(key) {
            Err(StorageError::unavailable(format!("write to {key} failed")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DigestStore for MemoryDigestStore {
    async fn get(&self, key: &DigestKey) -> StorageResult<Option<HistoryDigest>> {
        Ok(self.inner.rows.read().get(key).cloned())
    }

    async fn put(&self, key: &DigestKey, digest: HistoryDigest) -> StorageResult<()> {
        self.check_fault(key)?;
        self.inner.rows.write().insert(key.clone(), digest);
        Ok(())
    }

    async fn delete(&self, key: &DigestKey) -> StorageResult<()> {
        self.check_fault(key)?;
        self.inner.rows.write().remove(key);
        Ok(())
    }

    async fn commit(&self, txn: DigestTxn) -> StorageResult<CommitReport> {
        let mut rows = self.inner.rows.write();

        for (key, observed) in txn.reads() {
            let current = rows.get(key);
            let unchanged = match (observed, current) {
                (None, None) => true,
                (Some(seen), Some(now)) => seen.matches(now),
                _ => false,
            };
            if !unchanged {
                return Err(StorageError::Conflict(key.clone()));
            }
        }

        // Validate every write before touching the table.
        for (key, _) in txn.writes() {
            self.check_fault(key)?;
        }

        let mut report = CommitReport::default();
        for (key, op) in txn.writes() {
            match op {
                WriteOp::Put(digest) => {
                    rows.insert(key.clone(), digest.clone());
                    report.upserted += 1;
                }
                WriteOp::Delete => {
                    rows.remove(key);
                    report.deleted += 1;
                }
            }
        }
        debug!(
            upserted = report.upserted,
            deleted = report.deleted,
            "digest transaction committed"
        );
        Ok(report)
    }
}
