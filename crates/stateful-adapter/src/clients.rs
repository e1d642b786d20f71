use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::errors::{AuthzError, AuthzResult};

/// Registered OAuth2 client as the validator sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub policy_endpoint: Option<String>,
    /// Content hashes of every policy the client accepts, all compiled.
    pub policy_hashes: Vec<String>,
    pub update_program: Option<String>,
    #[serde(skip)]
    pub hmac_key: Vec<u8>,
}

impl ClientRecord {
    pub fn accepts_policy(&self, hash: &str) -> bool {
        self.policy_hashes
            .iter()
            .any(|known| known.eq_ignore_ascii_case(hash))
    }

    /// Policy a token of this client runs under.
    ///
    /// A token-bound policy must be registered for the client. A token without
    /// one only passes when the client registers no policies at all.
    pub fn resolve_policy(&self, token_policy: Option<&str>) -> AuthzResult<Option<String>> {
        match token_policy {
            Some(hash) if self.accepts_policy(hash) => Ok(Some(hash.to_ascii_lowercase())),
            Some(hash) => Err(AuthzError::UnregisteredPolicy(hash.to_string())),
            None if self.policy_hashes.is_empty() => Ok(None),
            None => Err(AuthzError::UnregisteredPolicy("<none>".into())),
        }
    }
}

#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, Arc<ClientRecord>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: ClientRecord) -> Arc<ClientRecord> {
        let record = Arc::new(record);
        self.clients
            .write()
            .insert(record.client_id.clone(), record.clone());
        record
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ClientRecord>> {
        self.clients.read().get(client_id).cloned()
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<ClientRecord>> {
        self.clients.write().remove(client_id)
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
