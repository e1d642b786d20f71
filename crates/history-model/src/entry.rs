use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::errors::{HistoryResult, MalformedHistoryError};

/// One collapsed `(api, method)` access: repeats bump `counter` and refresh
/// `timestamp` instead of adding a new entry.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    api: String,
    method: String,
    counter: u64,
    timestamp: f64,
}

impl HistoryEntry {
    pub fn new(api: impl Into<String>, method: impl Into<String>, timestamp: f64) -> Self {
        Self::with_counter(api, method, 0, timestamp)
    }

    pub fn with_counter(
        api: impl Into<String>,
        method: impl Into<String>,
        counter: u64,
        timestamp: f64,
    ) -> Self {
        Self {
            api: api.into(),
            method: method.into(),
            counter,
            timestamp: finite_or_zero(timestamp),
        }
    }

    /// Entry stamped with the current wall-clock time.
    pub fn now(api: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(api, method, unix_now())
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn same_call(&self, other: &HistoryEntry) -> bool {
        self.api == other.api && self.method == other.method
    }

    pub(crate) fn record_repeat(&mut self, timestamp: f64) {
        self.counter = self.counter.saturating_add(1);
        self.timestamp = finite_or_zero(timestamp);
    }

    pub fn to_value(&self) -> Value {
        json!({
            "api": self.api,
            "method": self.method,
            "counter": self.counter,
            "timestamp": self.timestamp,
        })
    }

    pub(crate) fn from_value(object: &str, index: usize, value: &Value) -> HistoryResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| MalformedHistoryError::InvalidField {
                object: object.to_string(),
                index,
                field: "entry",
            })?;

        let api = string_field(map, object, index, "api")?;
        let method = string_field(map, object, index, "method")?;
        let counter = required(map, object, index, "counter")?
            .as_u64()
            .ok_or_else(|| invalid(object, index, "counter"))?;
        let timestamp = required(map, object, index, "timestamp")?
            .as_f64()
            .filter(|ts| ts.is_finite())
            .ok_or_else(|| invalid(object, index, "timestamp"))?;

        Ok(Self {
            api,
            method,
            counter,
            timestamp,
        })
    }
}

/// Seconds since the unix epoch as a float, the timestamp unit on the wire.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn required<'a>(
    map: &'a Map<String, Value>,
    object: &str,
    index: usize,
    field: &'static str,
) -> HistoryResult<&'a Value> {
    map.get(field)
        .ok_or_else(|| MalformedHistoryError::MissingField {
            object: object.to_string(),
            index,
            field,
        })
}

fn string_field(
    map: &Map<String, Value>,
    object: &str,
    index: usize,
    field: &'static str,
) -> HistoryResult<String> {
    required(map, object, index, field)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(object, index, field))
}

fn invalid(object: &str, index: usize, field: &'static str) -> MalformedHistoryError {
    MalformedHistoryError::InvalidField {
        object: object.to_string(),
        index,
        field,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_counter_is_reported() {
        let value = json!({"api": "/events", "method": "GET", "timestamp": 1.5});
        let err = HistoryEntry::from_value("e1", 0, &value).unwrap_err();
        assert_eq!(
            err,
            MalformedHistoryError::MissingField {
                object: "e1".into(),
                index: 0,
                field: "counter",
            }
        );
    }

    #[test]
    fn negative_counter_is_invalid() {
        let value = json!({"api": "/events", "method": "GET", "counter": -1, "timestamp": 1.5});
        assert!(matches!(
            HistoryEntry::from_value("e1", 2, &value),
            Err(MalformedHistoryError::InvalidField {
                field: "counter",
                index: 2,
                ..
            })
        ));
    }

    #[test]
    fn integer_timestamp_is_accepted() {
        let value = json!({"api": "/events", "method": "GET", "counter": 3, "timestamp": 1700000000});
        let entry = HistoryEntry::from_value("e1", 0, &value).unwrap();
        assert_eq!(entry.counter(), 3);
        assert_eq!(entry.timestamp(), 1_700_000_000.0);
    }

    #[test]
    fn non_finite_timestamp_is_clamped() {
        let entry = HistoryEntry::new("/events", "GET", f64::NAN);
        assert_eq!(entry.timestamp(), 0.0);
    }
}
