use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedHistoryError {
    #[error("history payload is not valid json: {0}")]
    InvalidJson(String),
    #[error("history payload must be a json object keyed by object id")]
    NotAnObject,
    #[error("history of object {0} must be an array of entries")]
    NotAnArray(String),
    #[error("entry {index} of object {object}: missing field `{field}`")]
    MissingField {
        object: String,
        index: usize,
        field: &'static str,
    },
    #[error("entry {index} of object {object}: invalid field `{field}`")]
    InvalidField {
        object: String,
        index: usize,
        field: &'static str,
    },
    #[error("expected exactly one object in history envelope, found {0}")]
    EnvelopeSize(usize),
    #[error("history stored under key {key} names object {inner}")]
    ObjectMismatch { key: String, inner: String },
    #[error("object {object} lists ({method} {api}) more than once")]
    DuplicateEntry {
        object: String,
        api: String,
        method: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    #[error("hmac integrity mode requires a client key")]
    MissingKey,
    #[error("invalid hmac key: {0}")]
    InvalidKey(String),
}

pub type HistoryResult<T> = Result<T, MalformedHistoryError>;
