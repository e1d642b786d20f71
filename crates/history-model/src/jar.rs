//! Client-side keeper of issued histories.
//!
//! A caller holds one history per `(token, object)` pair. Each response's
//! `Set-Authorization-History` is absorbed, the next request's
//! `Authorization-History` is built from what is held, and a deleted object
//! is forgotten.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::batch::BatchHistoryList;
use crate::errors::{HistoryResult, MalformedHistoryError};
use crate::list::HistoryList;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryJar {
    // object id -> token -> history, the layout clients persist
    objects: BTreeMap<String, BTreeMap<String, HistoryList>>,
}

impl HistoryJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores every list of a `Set-Authorization-History` value for `token`,
    /// replacing what was held. A blank value is a no-op. Returns the number
    /// of lists stored.
    pub fn absorb(&mut self, token: &str, header: &str) -> HistoryResult<usize> {
        let batch = BatchHistoryList::from_header(Some(header))?;
        let mut stored = 0;
        for list in batch.iter() {
            self.keep(token, list.clone());
            stored += 1;
        }
        Ok(stored)
    }

    pub fn keep(&mut self, token: &str, list: HistoryList) {
        self.objects
            .entry(list.obj_id().to_string())
            .or_default()
            .insert(token.to_string(), list);
    }

    pub fn get(&self, token: &str, obj_id: &str) -> Option<&HistoryList> {
        self.objects.get(obj_id)?.get(token)
    }

    /// Held histories of `ids` for `token`; objects never seen are left out.
    pub fn batch_for<S: AsRef<str>>(&self, token: &str, ids: &[S]) -> BatchHistoryList {
        ids.iter()
            .filter_map(|id| self.get(token, id.as_ref()).cloned())
            .collect()
    }

    /// `Authorization-History` value for a request addressing `ids`, or
    /// `None` when nothing is held for any of them.
    pub fn header_for<S: AsRef<str>>(&self, token: &str, ids: &[S]) -> Option<String> {
        let batch = self.batch_for(token, ids);
        (!batch.is_empty()).then(|| batch.to_canonical_json())
    }

    pub fn forget(&mut self, token: &str, obj_id: &str) -> Option<HistoryList> {
        let tokens = self.objects.get_mut(obj_id)?;
        let removed = tokens.remove(token);
        if tokens.is_empty() {
            self.objects.remove(obj_id);
        }
        removed
    }

    /// Number of `(token, object)` pairs held.
    pub fn len(&self) -> usize {
        self.objects.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// `{"<object>": {"<token>": [entries]}}`
    pub fn to_value(&self) -> Value {
        let objects = self
            .objects
            .iter()
            .map(|(obj_id, tokens)| {
                let tokens: Map<String, Value> = tokens
                    .iter()
                    .map(|(token, list)| (token.clone(), list.entries_value()))
                    .collect();
                (obj_id.clone(), Value::Object(tokens))
            })
            .collect::<Map<String, Value>>();
        Value::Object(objects)
    }

    pub fn from_value(value: &Value) -> HistoryResult<Self> {
        let objects = value.as_object().ok_or(MalformedHistoryError::NotAnObject)?;
        let mut jar = Self::new();
        for (obj_id, tokens) in objects {
            let tokens = tokens.as_object().ok_or(MalformedHistoryError::NotAnObject)?;
            for (token, entries) in tokens {
                jar.keep(token, HistoryList::from_entries_value(obj_id, entries)?);
            }
        }
        Ok(jar)
    }
}
