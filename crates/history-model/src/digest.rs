use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::DigestError;

type HmacSha256 = Hmac<Sha256>;

/// How the server protects stored history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    /// SHA-256 of the canonical history. Anyone holding the history can
    /// recompute it.
    Hash,
    /// HMAC-SHA256 keyed with the client's secret.
    #[default]
    Hmac,
}

impl IntegrityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityMode::Hash => "hash",
            IntegrityMode::Hmac => "hmac",
        }
    }
}

impl fmt::Display for IntegrityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hash" | "sha256" => Ok(IntegrityMode::Hash),
            "hmac" => Ok(IntegrityMode::Hmac),
            other => Err(format!("unknown integrity mode `{other}`")),
        }
    }
}

/// Raw digest bytes. Comparisons go through [`HistoryDigest::matches`], which
/// runs in constant time.
#[derive(Clone, PartialEq, Eq)]
pub struct HistoryDigest(Vec<u8>);

impl HistoryDigest {
    pub fn sha256(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).to_vec())
    }

    pub fn hmac_sha256(key: &[u8], bytes: &[u8]) -> Result<Self, DigestError> {
        if key.is_empty() {
            return Err(DigestError::MissingKey);
        }
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|err| DigestError::InvalidKey(err.to_string()))?;
        mac.update(bytes);
        Ok(Self(mac.finalize().into_bytes().to_vec()))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn matches(&self, other: &HistoryDigest) -> bool {
        self.0.len() == other.0.len() && bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Debug for HistoryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HistoryDigest({})", self.to_hex())
    }
}
