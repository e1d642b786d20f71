use std::sync::Arc;

use digest_store::IntegrityStore;
use policy_sandbox::{PolicyRunner, SandboxHost, UpdateRunner, WasmPolicyRunner, WasmUpdateRunner};

use crate::clients::ClientRegistry;
use crate::registration::{PolicyFetcher, Registrar};
use crate::tokens::{MemoryTokenStore, TokenStore};
use crate::validator::{StatefulValidator, ValidatorSettings};

/// Builder for wiring the validator and its collaborators.
#[derive(Clone)]
pub struct ValidatorBootstrap {
    integrity: IntegrityStore,
    policy: Arc<dyn PolicyRunner>,
    updater: Arc<dyn UpdateRunner>,
    tokens: Arc<dyn TokenStore>,
    clients: ClientRegistry,
    settings: ValidatorSettings,
}

impl ValidatorBootstrap {
    /// Policies and update programs run in `host`.
    pub fn wasm(host: SandboxHost, integrity: IntegrityStore) -> Self {
        Self::from_runners(
            integrity,
            Arc::new(WasmPolicyRunner::new(host.clone())),
            Arc::new(WasmUpdateRunner::new(host)),
        )
    }

    pub fn from_runners(
        integrity: IntegrityStore,
        policy: Arc<dyn PolicyRunner>,
        updater: Arc<dyn UpdateRunner>,
    ) -> Self {
        Self {
            integrity,
            policy,
            updater,
            tokens: Arc::new(MemoryTokenStore::new()),
            clients: ClientRegistry::new(),
            settings: ValidatorSettings::default(),
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_clients(mut self, clients: ClientRegistry) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_settings(mut self, settings: ValidatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Registrar sharing this builder's client registry.
    pub fn registrar(&self, host: SandboxHost, fetcher: Arc<dyn PolicyFetcher>) -> Registrar {
        Registrar::new(host, self.clients.clone(), fetcher)
    }

    pub fn build(self) -> Arc<StatefulValidator> {
        Arc::new(StatefulValidator::from_parts(
            self.tokens,
            self.clients,
            self.integrity,
            self.policy,
            self.updater,
            self.settings,
        ))
    }
}
