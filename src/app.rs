//! Wires configuration, sandbox, integrity store and demo routes together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::Router;
use digest_store::{IntegrityStore, MemoryDigestStore};
use policy_sandbox::{module_hash, SandboxHost};
use stateful_adapter::{
    health_router, ClientRegistration, HttpPolicyFetcher, MemoryTokenStore, PolicyFetcher,
    ProtectedRoute, Registrar, StatefulValidator, TokenRecord, ValidatorBootstrap,
};
use axum::http::{HeaderName, Method};
use histguard_history::HISTORY_RESPONSE_HEADER;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{ClientSeed, HistguardConfig, TokenSeed};
use crate::resources::{EventItem, EventStore, EventsBatch, EventsCollection};

pub const EVENTS_SCOPE: &str = "events";

/// Process-scoped handles, created once at startup and shared by reference.
#[derive(Clone)]
pub struct App {
    pub validator: Arc<StatefulValidator>,
    pub host: SandboxHost,
    pub digests: MemoryDigestStore,
    pub tokens: MemoryTokenStore,
    pub events: EventStore,
}

impl App {
    pub async fn build(config: &HistguardConfig) -> Result<Self> {
        let fetcher = HttpPolicyFetcher::new(Duration::from_millis(config.fetch_timeout_ms))?;
        Self::build_with_fetcher(config, Arc::new(fetcher)).await
    }

    pub async fn build_with_fetcher(
        config: &HistguardConfig,
        fetcher: Arc<dyn PolicyFetcher>,
    ) -> Result<Self> {
        let host = SandboxHost::new(config.sandbox.clone()).context("failed to start sandbox")?;
        let digests = MemoryDigestStore::new();
        let integrity = IntegrityStore::new(
            Arc::new(digests.clone()),
            config.integrity.mode,
            config.integrity.first_use,
        );
        let tokens = MemoryTokenStore::new();
        let bootstrap = ValidatorBootstrap::wasm(host.clone(), integrity)
            .with_tokens(Arc::new(tokens.clone()))
            .with_settings(config.validator_settings());

        let registrar = bootstrap.registrar(host.clone(), fetcher);
        for seed in &config.clients {
            register_seed(&registrar, seed).await?;
        }
        for seed in &config.tokens {
            tokens.insert(token_from_seed(seed)?);
        }
        info!(
            clients = config.clients.len(),
            tokens = tokens.len(),
            mode = %config.integrity.mode,
            first_use = %config.integrity.first_use,
            "validator ready"
        );

        Ok(Self {
            validator: bootstrap.build(),
            host,
            digests,
            tokens,
            events: EventStore::new(),
        })
    }

    pub fn router(&self) -> Router {
        let protect = |handler: Arc<dyn stateful_adapter::ResourceHandler>| {
            ProtectedRoute::new(self.validator.clone(), handler)
                .with_scopes([EVENTS_SCOPE])
                .into_method_router()
        };
        Router::new()
            .route(
                "/api/events",
                protect(Arc::new(EventsCollection::new(self.events.clone()))),
            )
            .route(
                "/api/events/batch",
                protect(Arc::new(EventsBatch::new(self.events.clone()))),
            )
            .route(
                "/api/events/:id",
                protect(Arc::new(EventItem::new(self.events.clone()))),
            )
            .merge(health_router())
            .layer(cors_layer())
            .layer(TraceLayer::new_for_http())
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(HISTORY_RESPONSE_HEADER)])
}

async fn register_seed(registrar: &Registrar, seed: &ClientSeed) -> Result<()> {
    let uploaded_policies = seed
        .policy_files
        .iter()
        .map(|path| {
            std::fs::read(path).with_context(|| format!("failed to read policy {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let update_program = seed
        .update_program_file
        .as_ref()
        .map(|path| {
            std::fs::read(path)
                .with_context(|| format!("failed to read update program {}", path.display()))
        })
        .transpose()?;
    let hmac_key = seed
        .hmac_key_hex
        .as_deref()
        .map(hex::decode)
        .transpose()
        .with_context(|| format!("hmac_key_hex of {} is not hex", seed.client_id))?;

    registrar
        .register(ClientRegistration {
            client_id: seed.client_id.clone(),
            scopes: seed.scopes.clone(),
            policy_endpoint: seed.policy_endpoint.clone(),
            policy_hashes: seed.policy_hashes.clone(),
            uploaded_policies,
            update_program,
            hmac_key,
        })
        .await
        .map_err(|err| anyhow!("registering client {}: {err}", seed.client_id))?;
    Ok(())
}

fn token_from_seed(seed: &TokenSeed) -> Result<TokenRecord> {
    let policy = match &seed.policy_file {
        Some(path) => Some(module_hash(
            &std::fs::read(path)
                .with_context(|| format!("failed to read policy {}", path.display()))?,
        )),
        None => seed.policy.clone(),
    };
    let mut record = TokenRecord::new(&seed.access_token, &seed.client_id, seed.expires_in)
        .with_scope(&seed.scope);
    record.user_id = seed.user_id.clone();
    record.policy = policy;
    Ok(record)
}

/// Binds `config.listen` and serves until the process stops.
pub async fn serve(config: &HistguardConfig) -> Result<()> {
    let app = App::build(config).await?;
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(addr = %config.listen, "histguard listening");
    axum::serve(listener, app.router().into_make_service())
        .await
        .context("server exited unexpectedly")?;
    Ok(())
}
