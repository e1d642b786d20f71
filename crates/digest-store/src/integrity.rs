use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use histguard_history::{HistoryList, IntegrityMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{IntegrityResult, StorageResult};
use crate::model::DigestKey;
use crate::spi::{CommitReport, DigestStore};
use crate::tx::DigestTxn;

/// Treatment of history presented for an `(object, token)` pair that has no
/// digest row yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirstUsePolicy {
    /// Any presented history becomes the baseline.
    #[default]
    Trust,
    /// Only an empty history is accepted without a row.
    RequireEmpty,
}

impl fmt::Display for FirstUsePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FirstUsePolicy::Trust => "trust",
            FirstUsePolicy::RequireEmpty => "require-empty",
        })
    }
}

impl FromStr for FirstUsePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trust" => Ok(FirstUsePolicy::Trust),
            "require-empty" | "require_empty" => Ok(FirstUsePolicy::RequireEmpty),
            other => Err(format!("unknown first-use policy `{other}`")),
        }
    }
}

/// Outcome of checking one presented history against its stored digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// No row yet; accepted under the first-use policy.
    FirstUse,
    /// Digest of the presented history equals the stored digest.
    Verified,
    /// Stored digest differs from the presented history.
    Mismatch,
    /// No row yet and the first-use policy refuses the presented history.
    Unseeded,
}

impl IntegrityCheck {
    pub fn is_valid(self) -> bool {
        matches!(self, IntegrityCheck::FirstUse | IntegrityCheck::Verified)
    }
}

/// Validate-then-admit over a [`DigestStore`].
#[derive(Clone)]
pub struct IntegrityStore {
    backend: Arc<dyn DigestStore>,
    mode: IntegrityMode,
    first_use: FirstUsePolicy,
}

impl IntegrityStore {
    pub fn new(backend: Arc<dyn DigestStore>, mode: IntegrityMode, first_use: FirstUsePolicy) -> Self {
        Self {
            backend,
            mode,
            first_use,
        }
    }

    pub fn mode(&self) -> IntegrityMode {
        self.mode
    }

    pub fn first_use(&self) -> FirstUsePolicy {
        self.first_use
    }

    pub fn backend(&self) -> &Arc<dyn DigestStore> {
        &self.backend
    }

    pub fn begin(&self) -> DigestTxn {
        DigestTxn::new()
    }

    /// Compares `presented` with the row for `(presented.obj_id(), token)` and
    /// records the row as a commit precondition of `txn`.
    pub async fn check(
        &self,
        txn: &mut DigestTxn,
        token: &str,
        presented: &HistoryList,
        hmac_key: Option<&[u8]>,
    ) -> IntegrityResult<IntegrityCheck> {
        let key = DigestKey::new(presented.obj_id(), token);
        let stored = self.backend.get(&key).await?;
        txn.record_read(key.clone(), stored.clone());

        let outcome = match stored {
            None if presented.is_empty() => IntegrityCheck::FirstUse,
            None => match self.first_use {
                FirstUsePolicy::Trust => IntegrityCheck::FirstUse,
                FirstUsePolicy::RequireEmpty => IntegrityCheck::Unseeded,
            },
            Some(stored) => {
                let recomputed = presented.digest_with(self.mode, hmac_key)?;
                if stored.matches(&recomputed) {
                    IntegrityCheck::Verified
                } else {
                    IntegrityCheck::Mismatch
                }
            }
        };

        if outcome.is_valid() {
            debug!(key = %key, outcome = ?outcome, entries = presented.len(), "history admitted");
        } else {
            warn!(key = %key, outcome = ?outcome, mode = %self.mode, "history rejected");
        }
        Ok(outcome)
    }

    /// Stages the digest of `updated` for `(updated.obj_id(), token)`.
    pub fn stage_update(
        &self,
        txn: &mut DigestTxn,
        token: &str,
        updated: &HistoryList,
        hmac_key: Option<&[u8]>,
    ) -> IntegrityResult<()> {
        let digest = updated.digest_with(self.mode, hmac_key)?;
        txn.stage_put(DigestKey::new(updated.obj_id(), token), digest);
        Ok(())
    }

    pub fn stage_removal(&self, txn: &mut DigestTxn, token: &str, object_id: &str) {
        txn.stage_delete(DigestKey::new(object_id, token));
    }

    pub async fn commit(&self, txn: DigestTxn) -> StorageResult<CommitReport> {
        if !txn.has_writes() {
            return Ok(CommitReport::default());
        }
        self.backend.commit(txn).await
    }
}
