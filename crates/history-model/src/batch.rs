use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::canonical::canonicalize_to_string;
use crate::entry::HistoryEntry;
use crate::errors::{HistoryResult, MalformedHistoryError};
use crate::list::HistoryList;

/// Histories of several objects keyed by object id, the unit carried in
/// the history request/response headers.
///
/// On the wire every value is the entry array of its key. Values written as
/// a nested single-object envelope (`{"e1": {"e1": [...]}}`) are accepted as
/// long as the inner id equals the outer key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchHistoryList {
    lists: HashMap<String, HistoryList>,
}

impl BatchHistoryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_wire(raw: &str) -> HistoryResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| MalformedHistoryError::InvalidJson(err.to_string()))?;
        Self::from_value(&value)
    }

    /// Header form: a missing or blank header is an empty batch.
    pub fn from_header(raw: Option<&str>) -> HistoryResult<Self> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::new()),
            Some(raw) => Self::from_wire(raw),
        }
    }

    pub fn from_value(value: &Value) -> HistoryResult<Self> {
        let map = value.as_object().ok_or(MalformedHistoryError::NotAnObject)?;
        let mut lists = HashMap::with_capacity(map.len());
        for (obj_id, item) in map {
            let list = match item {
                Value::Object(_) => {
                    let list = HistoryList::from_envelope(item)?;
                    if list.obj_id() != obj_id {
                        return Err(MalformedHistoryError::ObjectMismatch {
                            key: obj_id.clone(),
                            inner: list.obj_id().to_string(),
                        });
                    }
                    list
                }
                _ => HistoryList::from_entries_value(obj_id, item)?,
            };
            lists.insert(obj_id.clone(), list);
        }
        Ok(Self { lists })
    }

    pub fn get(&self, obj_id: &str) -> Option<&HistoryList> {
        self.lists.get(obj_id)
    }

    /// Presented history for `obj_id`, or an empty list for an object the
    /// caller has no history for yet.
    pub fn get_or_empty(&self, obj_id: &str) -> HistoryList {
        self.lists
            .get(obj_id)
            .cloned()
            .unwrap_or_else(|| HistoryList::new(obj_id))
    }

    pub fn contains(&self, obj_id: &str) -> bool {
        self.lists.contains_key(obj_id)
    }

    pub fn insert(&mut self, list: HistoryList) -> Option<HistoryList> {
        self.lists.insert(list.obj_id().to_string(), list)
    }

    pub fn remove(&mut self, obj_id: &str) -> Option<HistoryList> {
        self.lists.remove(obj_id)
    }

    /// Appends to the history of `obj_id`, creating it on first access.
    pub fn append(&mut self, obj_id: &str, entry: HistoryEntry) {
        self.lists
            .entry(obj_id.to_string())
            .or_insert_with(|| HistoryList::new(obj_id))
            .append(entry);
    }

    /// Batch restricted to `ids`; ids the batch does not know get an empty
    /// list.
    pub fn subset<S: AsRef<str>>(&self, ids: &[S]) -> Self {
        let lists = ids
            .iter()
            .map(|id| {
                let id = id.as_ref();
                (id.to_string(), self.get_or_empty(id))
            })
            .collect();
        Self { lists }
    }

    pub fn object_count(&self) -> usize {
        self.lists.len()
    }

    pub fn entry_count(&self) -> usize {
        self.lists.values().map(HistoryList::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Object ids in lexicographic order.
    pub fn object_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.lists.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryList> {
        self.lists.values()
    }

    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .lists
            .iter()
            .map(|(id, list)| (id.clone(), list.entries_value()))
            .collect();
        Value::Object(map)
    }

    pub fn to_canonical_json(&self) -> String {
        canonicalize_to_string(&self.to_value())
    }
}

impl FromIterator<HistoryList> for BatchHistoryList {
    fn from_iter<I: IntoIterator<Item = HistoryList>>(iter: I) -> Self {
        let lists = iter
            .into_iter()
            .map(|list| (list.obj_id().to_string(), list))
            .collect();
        Self { lists }
    }
}
