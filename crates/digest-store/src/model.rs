use std::fmt;

use histguard_history::HistoryDigest;

/// Primary key of a digest row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DigestKey {
    pub object_id: String,
    pub token: String,
}

impl DigestKey {
    pub fn new(object_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            token: token.into(),
        }
    }
}

/// Tokens are secrets; only a short prefix ever reaches logs or errors.
impl fmt::Display for DigestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.token.chars().take(6).collect();
        write!(f, "({}, {}…)", self.object_id, prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(HistoryDigest),
    Delete,
}
