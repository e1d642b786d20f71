use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use policy_sandbox::{module_hash, SandboxError, SandboxHost};
use rand::RngCore;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::clients::{ClientRecord, ClientRegistry};
use crate::errors::{AuthzError, AuthzResult};

pub const HMAC_KEY_BYTES: usize = 64;

/// Everything a client hands over when it registers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub policy_endpoint: Option<String>,
    /// Hashes to fetch from `policy_endpoint` and verify.
    #[serde(default)]
    pub policy_hashes: Vec<String>,
    /// Compiled modules uploaded directly; registered under their own hash.
    #[serde(skip)]
    pub uploaded_policies: Vec<Vec<u8>>,
    #[serde(skip)]
    pub update_program: Option<Vec<u8>>,
    #[serde(skip)]
    pub hmac_key: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FetchError(pub String);

/// Source of policy module bytes at registration time.
#[async_trait]
pub trait PolicyFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches modules over HTTP(S).
#[derive(Clone)]
pub struct HttpPolicyFetcher {
    client: reqwest::Client,
}

impl HttpPolicyFetcher {
    pub fn new(timeout: Duration) -> AuthzResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("histguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AuthzError::Internal(format!("http client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PolicyFetcher for HttpPolicyFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError(format!("request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError(format!("endpoint answered {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError(format!("body read failed: {err}")))?;
        Ok(bytes.to_vec())
    }
}

pub fn policy_url(endpoint: &str, hash: &str) -> String {
    format!("{}/{}.wasm", endpoint.trim_end_matches('/'), hash)
}

/// Verifies, compiles and records client registrations.
#[derive(Clone)]
pub struct Registrar {
    host: SandboxHost,
    clients: ClientRegistry,
    fetcher: Arc<dyn PolicyFetcher>,
}

impl Registrar {
    pub fn new(host: SandboxHost, clients: ClientRegistry, fetcher: Arc<dyn PolicyFetcher>) -> Self {
        Self {
            host,
            clients,
            fetcher,
        }
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    #[instrument(skip_all, fields(client = %registration.client_id))]
    pub async fn register(&self, registration: ClientRegistration) -> AuthzResult<Arc<ClientRecord>> {
        let mut policy_hashes = Vec::with_capacity(
            registration.policy_hashes.len() + registration.uploaded_policies.len(),
        );

        for expected in &registration.policy_hashes {
            let expected = expected.to_ascii_lowercase();
            self.load_from_endpoint(registration.policy_endpoint.as_deref(), &expected)
                .await?;
            if !policy_hashes.contains(&expected) {
                policy_hashes.push(expected);
            }
        }

        for bytes in &registration.uploaded_policies {
            let handle = self.host.compile(bytes).map_err(compile_failure)?;
            let hash = handle.hash().to_string();
            if !policy_hashes.contains(&hash) {
                policy_hashes.push(hash);
            }
        }

        let update_program = match &registration.update_program {
            Some(bytes) => Some(
                self.host
                    .compile(bytes)
                    .map_err(compile_failure)?
                    .hash()
                    .to_string(),
            ),
            None => None,
        };

        let hmac_key = match registration.hmac_key {
            Some(key) if !key.is_empty() => key,
            _ => generate_hmac_key(),
        };

        let record = ClientRecord {
            client_id: registration.client_id,
            scopes: registration.scopes,
            policy_endpoint: registration.policy_endpoint,
            policy_hashes,
            update_program,
            hmac_key,
        };
        info!(
            policies = record.policy_hashes.len(),
            update_program = record.update_program.is_some(),
            "client registered"
        );
        Ok(self.clients.upsert(record))
    }

    async fn load_from_endpoint(&self, endpoint: Option<&str>, expected: &str) -> AuthzResult<()> {
        if self.host.module(expected).is_some() {
            return Ok(());
        }
        let endpoint = endpoint.ok_or_else(|| {
            AuthzError::BadPolicyEndpoint(format!("no policy endpoint to fetch {expected} from"))
        })?;
        let url = policy_url(endpoint, expected);
        let bytes = self.fetcher.fetch(&url).await.map_err(|err| {
            warn!(%url, error = %err, "policy fetch failed");
            AuthzError::BadPolicyEndpoint(format!("{url}: {err}"))
        })?;

        let actual = module_hash(&bytes);
        if actual != expected {
            warn!(%url, %expected, %actual, "fetched policy does not match its hash");
            return Err(AuthzError::PolicyHashMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        self.host.compile(&bytes).map_err(compile_failure)?;
        Ok(())
    }
}

fn compile_failure(err: SandboxError) -> AuthzError {
    AuthzError::BadPolicyEndpoint(format!("module rejected: {err}"))
}

pub fn generate_hmac_key() -> Vec<u8> {
    let mut key = vec![0u8; HMAC_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
