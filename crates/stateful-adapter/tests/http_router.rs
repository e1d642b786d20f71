use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use digest_store::{FirstUsePolicy, IntegrityStore, MemoryDigestStore};
use histguard_history::{BatchHistoryList, IntegrityMode, HISTORY_REQUEST_HEADER, HISTORY_RESPONSE_HEADER};
use policy_sandbox::{module_hash, SandboxHost, SandboxLimits};
use serde_json::{json, Value};
use stateful_adapter::{
    health_router, ClientRegistration, FetchError, MemoryTokenStore, PolicyFetcher, ProtectedRoute,
    ResourceHandler, ResourceOutcome, ResourceRequest, TokenRecord, ValidatorBootstrap,
};
use tower::ServiceExt;

/// Accepts only when the presented history mentions a POST.
const REQUIRES_POST: &str = r#"(module
  (import "wasi_snapshot_preview1" "args_sizes_get"
    (func $args_sizes_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "args_get"
    (func $args_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 4)
  (data (i32.const 256) "Accept")
  (data (i32.const 272) "Deny")
  (func $print (param $ptr i32) (param $len i32)
    (i32.store (i32.const 32) (local.get $ptr))
    (i32.store (i32.const 36) (local.get $len))
    (drop (call $fd_write (i32.const 1) (i32.const 32) (i32.const 1) (i32.const 48))))
  (func $has_post (param $p i32) (result i32)
    (block $done
      (loop $scan
        (br_if $done (i32.eqz (i32.load8_u (local.get $p))))
        (if (i32.and
              (i32.and
                (i32.eq (i32.load8_u (local.get $p)) (i32.const 80))
                (i32.eq (i32.load8_u offset=1 (local.get $p)) (i32.const 79)))
              (i32.and
                (i32.eq (i32.load8_u offset=2 (local.get $p)) (i32.const 83))
                (i32.eq (i32.load8_u offset=3 (local.get $p)) (i32.const 84))))
          (then (return (i32.const 1))))
        (local.set $p (i32.add (local.get $p) (i32.const 1)))
        (br $scan)))
    (i32.const 0))
  (func (export "_start")
    (drop (call $args_sizes_get (i32.const 0) (i32.const 4)))
    (drop (call $args_get (i32.const 64) (i32.const 1024)))
    (if (call $has_post (i32.load (i32.const 72)))
      (then (call $print (i32.const 256) (i32.const 6)))
      (else (call $print (i32.const 272) (i32.const 4))))))"#;

const TRAPS: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start") unreachable))"#;

struct NoFetch;

#[async_trait]
impl PolicyFetcher for NoFetch {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Err(FetchError(format!("unexpected fetch of {url}")))
    }
}

struct Events;

#[async_trait]
impl ResourceHandler for Events {
    async fn handle(&self, request: ResourceRequest<'_>) -> ResourceOutcome {
        ResourceOutcome::ok(json!({ "id": request.path_object_id }))
    }
}

struct Fixture {
    router: Router,
    backend: MemoryDigestStore,
}

async fn fixture(policy_wat: &str) -> Fixture {
    let host = SandboxHost::new(SandboxLimits::default()).unwrap();
    let backend = MemoryDigestStore::new();
    let integrity = IntegrityStore::new(
        Arc::new(backend.clone()),
        IntegrityMode::Hmac,
        FirstUsePolicy::Trust,
    );
    let tokens = MemoryTokenStore::new();
    tokens.insert(
        TokenRecord::new("tok-1", "client-a", 3600)
            .with_scope("events")
            .with_policy(module_hash(policy_wat.as_bytes())),
    );

    let bootstrap =
        ValidatorBootstrap::wasm(host.clone(), integrity).with_tokens(Arc::new(tokens));
    bootstrap
        .registrar(host, Arc::new(NoFetch))
        .register(ClientRegistration {
            client_id: "client-a".into(),
            scopes: vec!["events".into()],
            uploaded_policies: vec![policy_wat.as_bytes().to_vec()],
            ..Default::default()
        })
        .await
        .unwrap();

    let validator = bootstrap.build();
    let router = Router::new()
        .route(
            "/api/events/:id",
            ProtectedRoute::new(validator, Arc::new(Events))
                .with_scopes(["events"])
                .into_method_router(),
        )
        .merge(health_router());
    Fixture { router, backend }
}

fn get(uri: &str, token: Option<&str>, history: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    if let Some(history) = history {
        builder = builder.header(HISTORY_REQUEST_HEADER, history);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_is_ok() {
    let fixture = fixture(REQUIRES_POST).await;
    let response = fixture
        .router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn history_with_creation_is_accepted_and_extended() {
    let fixture = fixture(REQUIRES_POST).await;
    let presented =
        r#"{"evt-1":[{"api":"/api/events","counter":0,"method":"POST","timestamp":10.0}]}"#;
    let response = fixture
        .router
        .clone()
        .oneshot(get("/api/events/evt-1", Some("tok-1"), Some(presented)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let header = response
        .headers()
        .get(HISTORY_RESPONSE_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let batch = BatchHistoryList::from_wire(&header).unwrap();
    let list = batch.get("evt-1").unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.find("/api/events/evt-1", "GET").is_some());
    assert_eq!(fixture.backend.len(), 1);
    assert_eq!(json_body(response).await["id"], "evt-1");

    // carrying the returned header forward keeps working
    let again = fixture
        .router
        .oneshot(get("/api/events/evt-1", Some("tok-1"), Some(&header)))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn history_without_creation_is_denied() {
    let fixture = fixture(REQUIRES_POST).await;
    let response = fixture
        .router
        .oneshot(get("/api/events/evt-2", Some("tok-1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers().get(HISTORY_RESPONSE_HEADER).unwrap(), "");
    assert_eq!(json_body(response).await["error"], "policy_failed");
    assert!(fixture.backend.is_empty());
}

#[tokio::test]
async fn trapping_policy_is_a_crash() {
    let fixture = fixture(TRAPS).await;
    let response = fixture
        .router
        .oneshot(get("/api/events/evt-1", Some("tok-1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "policy_crashed");
    assert!(fixture.backend.is_empty());
}

#[tokio::test]
async fn missing_token_gets_a_bearer_challenge() {
    let fixture = fixture(REQUIRES_POST).await;
    let response = fixture
        .router
        .oneshot(get("/api/events/evt-1", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(challenge.starts_with(r#"Bearer realm="histguard", error="invalid_token""#));
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn malformed_history_is_a_bad_request() {
    let fixture = fixture(REQUIRES_POST).await;
    let response = fixture
        .router
        .oneshot(get("/api/events/evt-1", Some("tok-1"), Some("[1,2]")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_history");
}
