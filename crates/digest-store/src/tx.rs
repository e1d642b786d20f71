use std::collections::BTreeMap;

use histguard_history::HistoryDigest;

use crate::model::{DigestKey, WriteOp};

/// Reads observed and writes staged by one request.
///
/// Reads act as commit preconditions. A later write to the same key
/// replaces the earlier one.
#[derive(Debug, Clone, Default)]
pub struct DigestTxn {
    reads: BTreeMap<DigestKey, Option<HistoryDigest>>,
    writes: BTreeMap<DigestKey, WriteOp>,
}

impl DigestTxn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the first observation of a key.
    pub fn record_read(&mut self, key: DigestKey, observed: Option<HistoryDigest>) {
        self.reads.entry(key).or_insert(observed);
    }

    pub fn stage_put(&mut self, key: DigestKey, digest: HistoryDigest) {
        self.writes.insert(key, WriteOp::Put(digest));
    }

    pub fn stage_delete(&mut self, key: DigestKey) {
        self.writes.insert(key, WriteOp::Delete);
    }

    pub fn reads(&self) -> impl Iterator<Item = (&DigestKey, &Option<HistoryDigest>)> {
        self.reads.iter()
    }

    pub fn writes(&self) -> impl Iterator<Item = (&DigestKey, &WriteOp)> {
        self.writes.iter()
    }

    pub fn observed(&self, key: &DigestKey) -> Option<&Option<HistoryDigest>> {
        self.reads.get(key)
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_write_replaces_earlier() {
        let key = DigestKey::new("a", "t");
        let mut txn = DigestTxn::new();
        txn.stage_put(key.clone(), HistoryDigest::sha256(b"x"));
        txn.stage_delete(key.clone());
        assert_eq!(txn.write_count(), 1);
        assert_eq!(txn.writes().next(), Some((&key, &WriteOp::Delete)));
    }

    #[test]
    fn first_read_is_the_precondition() {
        let key = DigestKey::new("a", "t");
        let mut txn = DigestTxn::new();
        txn.record_read(key.clone(), None);
        txn.record_read(key.clone(), Some(HistoryDigest::sha256(b"x")));
        assert_eq!(txn.observed(&key), Some(&None));
    }
}
