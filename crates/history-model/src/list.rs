use serde_json::{Map, Value};

use crate::canonical::canonicalize_to_string;
use crate::digest::{HistoryDigest, IntegrityMode};
use crate::entry::HistoryEntry;
use crate::errors::{DigestError, HistoryResult, MalformedHistoryError};

/// Access history of a single object, in append order.
///
/// `(api, method)` pairs are unique within a list; [`HistoryList::append`]
/// keeps that invariant and parsing rejects payloads that break it.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryList {
    obj_id: String,
    entries: Vec<HistoryEntry>,
}

impl HistoryList {
    pub fn new(obj_id: impl Into<String>) -> Self {
        Self {
            obj_id: obj_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn with_entries(
        obj_id: impl Into<String>,
        entries: impl IntoIterator<Item = HistoryEntry>,
    ) -> HistoryResult<Self> {
        let mut list = Self::new(obj_id);
        for entry in entries {
            if let Some(existing) = list.find(entry.api(), entry.method()) {
                return Err(MalformedHistoryError::DuplicateEntry {
                    object: list.obj_id.clone(),
                    api: existing.api().to_string(),
                    method: existing.method().to_string(),
                });
            }
            list.entries.push(entry);
        }
        Ok(list)
    }

    pub fn obj_id(&self) -> &str {
        &self.obj_id
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, api: &str, method: &str) -> Option<&HistoryEntry> {
        self.entries
            .iter()
            .find(|entry| entry.api() == api && entry.method() == method)
    }

    /// Dedup-or-add: a repeated `(api, method)` increments the existing
    /// counter and takes the new timestamp; anything else is appended.
    pub fn append(&mut self, entry: HistoryEntry) {
        match self.entries.iter_mut().find(|existing| existing.same_call(&entry)) {
            Some(existing) => existing.record_repeat(entry.timestamp()),
            None => self.entries.push(entry),
        }
    }

    pub fn entries_value(&self) -> Value {
        Value::Array(self.entries.iter().map(HistoryEntry::to_value).collect())
    }

    /// Single-object envelope `{obj_id: [entries...]}`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.obj_id.clone(), self.entries_value());
        Value::Object(map)
    }

    pub fn to_canonical_json(&self) -> String {
        canonicalize_to_string(&self.to_value())
    }

    /// Parses a single-object envelope; exactly one top-level key is allowed.
    pub fn from_json(raw: &str) -> HistoryResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| MalformedHistoryError::InvalidJson(err.to_string()))?;
        Self::from_envelope(&value)
    }

    pub(crate) fn from_envelope(value: &Value) -> HistoryResult<Self> {
        let map = value.as_object().ok_or(MalformedHistoryError::NotAnObject)?;
        if map.len() != 1 {
            return Err(MalformedHistoryError::EnvelopeSize(map.len()));
        }
        let (obj_id, entries) = map
            .iter()
            .next()
            .ok_or(MalformedHistoryError::EnvelopeSize(0))?;
        Self::from_entries_value(obj_id, entries)
    }

    pub(crate) fn from_entries_value(obj_id: &str, value: &Value) -> HistoryResult<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| MalformedHistoryError::NotAnArray(obj_id.to_string()))?;
        let entries = items
            .iter()
            .enumerate()
            .map(|(index, item)| HistoryEntry::from_value(obj_id, index, item))
            .collect::<HistoryResult<Vec<_>>>()?;
        Self::with_entries(obj_id, entries)
    }

    /// Plain SHA-256 over the canonical form.
    pub fn digest(&self) -> HistoryDigest {
        HistoryDigest::sha256(self.to_canonical_json().as_bytes())
    }

    /// HMAC-SHA256 over the canonical form.
    pub fn mac(&self, key: &[u8]) -> Result<HistoryDigest, DigestError> {
        HistoryDigest::hmac_sha256(key, self.to_canonical_json().as_bytes())
    }

    pub fn digest_with(
        &self,
        mode: IntegrityMode,
        key: Option<&[u8]>,
    ) -> Result<HistoryDigest, DigestError> {
        match mode {
            IntegrityMode::Hash => Ok(self.digest()),
            IntegrityMode::Hmac => self.mac(key.ok_or(DigestError::MissingKey)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HistoryList {
        let mut list = HistoryList::new("evt-1");
        list.append(HistoryEntry::new("/api/events", "POST", 10.0));
        list.append(HistoryEntry::new("/api/events/evt-1", "GET", 11.5));
        list
    }

    #[test]
    fn repeat_access_increments_counter() {
        let mut list = sample();
        list.append(HistoryEntry::new("/api/events/evt-1", "GET", 20.25));
        assert_eq!(list.len(), 2);
        let entry = list.find("/api/events/evt-1", "GET").unwrap();
        assert_eq!(entry.counter(), 1);
        assert_eq!(entry.timestamp(), 20.25);
    }

    #[test]
    fn novel_call_is_appended_in_order() {
        let mut list = sample();
        list.append(HistoryEntry::new("/api/events/evt-1", "DELETE", 30.0));
        let methods: Vec<_> = list.entries().iter().map(|e| e.method()).collect();
        assert_eq!(methods, vec!["POST", "GET", "DELETE"]);
    }

    #[test]
    fn same_api_different_method_is_distinct() {
        let mut list = HistoryList::new("x");
        list.append(HistoryEntry::new("/a", "GET", 1.0));
        list.append(HistoryEntry::new("/a", "POST", 1.0));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn canonical_form_is_keyed_by_object() {
        let list = sample();
        assert_eq!(
            list.to_canonical_json(),
            r#"{"evt-1":[{"api":"/api/events","counter":0,"method":"POST","timestamp":10.0},{"api":"/api/events/evt-1","counter":0,"method":"GET","timestamp":11.5}]}"#
        );
    }

    #[test]
    fn parse_restores_entries_and_order() {
        let list = sample();
        let parsed = HistoryList::from_json(&list.to_canonical_json()).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn envelope_with_two_objects_is_rejected() {
        let raw = r#"{"a": [], "b": []}"#;
        assert_eq!(
            HistoryList::from_json(raw),
            Err(MalformedHistoryError::EnvelopeSize(2))
        );
    }

    #[test]
    fn duplicate_pairs_are_rejected() {
        let raw = r#"{"a": [
            {"api": "/x", "method": "GET", "counter": 0, "timestamp": 1.0},
            {"api": "/x", "method": "GET", "counter": 4, "timestamp": 2.0}
        ]}"#;
        assert!(matches!(
            HistoryList::from_json(raw),
            Err(MalformedHistoryError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn hmac_mode_requires_key() {
        let list = sample();
        assert_eq!(
            list.digest_with(IntegrityMode::Hmac, None),
            Err(DigestError::MissingKey)
        );
        assert!(list.digest_with(IntegrityMode::Hash, None).is_ok());
    }

    #[test]
    fn mac_depends_on_key() {
        let list = sample();
        let a = list.mac(b"client-a").unwrap();
        let b = list.mac(b"client-b").unwrap();
        assert!(!a.matches(&b));
        assert!(!a.matches(&list.digest()));
    }
}
