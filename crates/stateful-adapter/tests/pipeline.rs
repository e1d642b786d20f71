use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use digest_store::{DigestKey, DigestStore, FirstUsePolicy, IntegrityStore, MemoryDigestStore};
use histguard_history::{BatchHistoryList, IntegrityMode, HISTORY_REQUEST_HEADER};
use parking_lot::Mutex;
use policy_sandbox::{Decision, PolicyRunner, SandboxError, SandboxResult, UpdateRunner};
use serde_json::{json, Value};
use serial_test::serial;
use stateful_adapter::metrics::outcome_count;
use stateful_adapter::{
    AuthzError, ClientRecord, MemoryTokenStore, ProtectedRequest, ResourceHandler, ResourceOutcome,
    ResourceRequest, StatefulValidator, TokenRecord, ValidatorBootstrap,
};

const TOKEN: &str = "tok-1";
const POLICY: &str = "p1";
const UPDATER: &str = "u1";

#[derive(Clone, Copy)]
enum Verdict {
    Accept,
    Deny,
    Crash,
}

struct StubPolicy {
    verdict: Mutex<Verdict>,
    calls: AtomicUsize,
    seen_history: Mutex<Vec<String>>,
}

#[async_trait]
impl PolicyRunner for StubPolicy {
    async fn run(&self, policy_hash: &str, _request: &str, history: &str) -> SandboxResult<Decision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_history.lock().push(history.to_string());
        match *self.verdict.lock() {
            Verdict::Accept => Ok(Decision::Accept),
            Verdict::Deny => Ok(Decision::Deny),
            Verdict::Crash => Err(SandboxError::Crashed {
                program: policy_hash.to_string(),
                reason: "unreachable executed".into(),
            }),
        }
    }
}

/// Rewrites every list to a single marker entry, or fails.
struct StubUpdater {
    fail: bool,
    api: &'static str,
}

#[async_trait]
impl UpdateRunner for StubUpdater {
    async fn update(&self, program: &str, _request: &str, old: &str) -> SandboxResult<Value> {
        if self.fail {
            return Err(SandboxError::OutOfFuel {
                program: program.to_string(),
                limit: 1,
            });
        }
        let old: Value = serde_json::from_str(old).unwrap();
        let mut next = serde_json::Map::new();
        for id in old.as_object().unwrap().keys() {
            next.insert(
                id.clone(),
                json!([{"api": self.api, "method": "GET", "counter": 0, "timestamp": 1.0}]),
            );
        }
        Ok(Value::Object(next))
    }
}

struct StubResource {
    status: Mutex<StatusCode>,
    created: Option<&'static str>,
    calls: AtomicUsize,
}

#[async_trait]
impl ResourceHandler for StubResource {
    async fn handle(&self, request: ResourceRequest<'_>) -> ResourceOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let status = *self.status.lock();
        if status.is_client_error() {
            return ResourceOutcome::error(status, "no such event");
        }
        match self.created {
            Some(id) if *request.method == Method::POST && request.object_ids.is_empty() => {
                ResourceOutcome::created(json!({ "id": id }), id)
            }
            _ => ResourceOutcome::ok(json!({ "ids": request.object_ids })),
        }
    }
}

struct Harness {
    validator: Arc<StatefulValidator>,
    backend: MemoryDigestStore,
    tokens: MemoryTokenStore,
    policy: Arc<StubPolicy>,
    resource: Arc<StubResource>,
}

fn harness(with_policy: bool, update_program: Option<StubUpdater>) -> Harness {
    let backend = MemoryDigestStore::new();
    let integrity = IntegrityStore::new(
        Arc::new(backend.clone()),
        IntegrityMode::Hmac,
        FirstUsePolicy::Trust,
    );
    let policy = Arc::new(StubPolicy {
        verdict: Mutex::new(Verdict::Accept),
        calls: AtomicUsize::new(0),
        seen_history: Mutex::new(Vec::new()),
    });
    let has_updater = update_program.is_some();
    let updater = Arc::new(update_program.unwrap_or(StubUpdater { fail: false, api: "/updated" }));
    let tokens = MemoryTokenStore::new();
    let mut token = TokenRecord::new(TOKEN, "client-a", 3600).with_scope("events");
    if with_policy {
        token = token.with_policy(POLICY);
    }
    tokens.insert(token);

    let bootstrap = ValidatorBootstrap::from_runners(integrity, policy.clone(), updater)
        .with_tokens(Arc::new(tokens.clone()));
    bootstrap.clients().upsert(ClientRecord {
        client_id: "client-a".into(),
        scopes: vec!["events".into()],
        policy_endpoint: None,
        policy_hashes: if with_policy { vec![POLICY.into()] } else { Vec::new() },
        update_program: has_updater.then(|| UPDATER.to_string()),
        hmac_key: vec![9; 64],
    });

    Harness {
        validator: bootstrap.build(),
        backend,
        tokens,
        policy,
        resource: Arc::new(StubResource {
            status: Mutex::new(StatusCode::OK),
            created: Some("new-1"),
            calls: AtomicUsize::new(0),
        }),
    }
}

fn request(method: Method, uri: &str, id: Option<&str>, history: Option<&str>, body: Option<Value>) -> ProtectedRequest {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_str(&format!("Bearer {TOKEN}")).unwrap());
    if let Some(history) = history {
        headers.insert(HISTORY_REQUEST_HEADER, HeaderValue::from_str(history).unwrap());
    }
    let body = match body {
        Some(body) => {
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            serde_json::to_vec(&body).unwrap().into()
        }
        None => Default::default(),
    };
    ProtectedRequest {
        request_id: "req-1".into(),
        method,
        uri: uri.parse().unwrap(),
        headers,
        body,
        path_object_id: id.map(str::to_string),
    }
}

fn scopes() -> Vec<String> {
    vec!["events".into()]
}

const E1_HISTORY: &str =
    r#"{"e1":[{"api":"/api/events","counter":0,"method":"POST","timestamp":10.0}]}"#;

impl Harness {
    async fn get_e1(&self, history: Option<&str>) -> Result<stateful_adapter::ValidatedResponse, AuthzError> {
        self.validator
            .validate(
                request(Method::GET, "/api/events/e1", Some("e1"), history, None),
                &scopes(),
                self.resource.as_ref(),
            )
            .await
    }
}

#[tokio::test]
async fn first_use_is_accepted_and_history_extended() {
    let h = harness(true, None);
    let response = h.get_e1(Some(E1_HISTORY)).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.timings.history_length, 1);
    assert_eq!(response.timings.history_size, E1_HISTORY.len());

    let returned = BatchHistoryList::from_wire(&response.history_header).unwrap();
    let list = returned.get("e1").unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.find("/api/events", "POST").is_some());
    assert!(list.find("/api/events/e1", "GET").is_some());
    assert_eq!(h.backend.len(), 1);
    assert_eq!(h.policy.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.policy.seen_history.lock()[0], E1_HISTORY);
}

#[tokio::test]
async fn returned_history_is_accepted_next_time() {
    let h = harness(true, None);
    let first = h.get_e1(Some(E1_HISTORY)).await.unwrap();
    let second = h.get_e1(Some(&first.history_header)).await.unwrap();
    let list = BatchHistoryList::from_wire(&second.history_header).unwrap();
    assert_eq!(list.get("e1").unwrap().find("/api/events/e1", "GET").unwrap().counter(), 1);
}

#[tokio::test]
async fn tampered_history_never_reaches_the_policy() {
    let h = harness(true, None);
    let first = h.get_e1(Some(E1_HISTORY)).await.unwrap();
    let calls = h.policy.calls.load(Ordering::SeqCst);

    let tampered = first.history_header.replacen("\"counter\":0", "\"counter\":5", 1);
    assert_ne!(tampered, first.history_header);
    let err = h.get_e1(Some(&tampered)).await.unwrap_err();
    assert!(matches!(err, AuthzError::InvalidHistory(_)));
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.policy.calls.load(Ordering::SeqCst), calls);

    // dropping the history altogether is tampering as well
    let err = h.get_e1(None).await.unwrap_err();
    assert!(matches!(err, AuthzError::InvalidHistory(_)));
}

#[tokio::test]
async fn malformed_history_is_rejected() {
    let h = harness(true, None);
    let err = h.get_e1(Some(r#"{"e1": 5}"#)).await.unwrap_err();
    assert_eq!(err.error_code(), "invalid_history");
    assert_eq!(h.policy.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[serial]
async fn denial_skips_the_resource_and_leaves_the_store() {
    let h = harness(true, None);
    *h.policy.verdict.lock() = Verdict::Deny;
    let before = outcome_count("policy_denied");

    let err = h.get_e1(Some(E1_HISTORY)).await.unwrap_err();
    assert_eq!(err, AuthzError::PolicyFailed);
    assert_eq!(err.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.resource.calls.load(Ordering::SeqCst), 0);
    assert!(h.backend.is_empty());
    assert_eq!(outcome_count("policy_denied"), before + 1);
}

#[tokio::test]
#[serial]
async fn crashing_policy_is_distinguished_from_denial() {
    let h = harness(true, None);
    *h.policy.verdict.lock() = Verdict::Crash;
    let before = outcome_count("policy_crashed");

    let err = h.get_e1(Some(E1_HISTORY)).await.unwrap_err();
    assert!(matches!(err, AuthzError::PolicyCrashed(_)));
    assert_eq!(err.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.resource.calls.load(Ordering::SeqCst), 0);
    assert!(h.backend.is_empty());
    assert_eq!(outcome_count("policy_crashed"), before + 1);
}

#[tokio::test]
async fn token_failures_come_first() {
    let h = harness(true, None);
    h.tokens.revoke(TOKEN);
    let err = h.get_e1(Some(E1_HISTORY)).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

    let h = harness(true, None);
    let err = h
        .validator
        .validate(
            request(Method::GET, "/api/events/e1", Some("e1"), None, None),
            &["admin".to_string()],
            h.resource.as_ref(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AuthzError::InsufficientScope {
            required: "admin".into()
        }
    );
}

#[tokio::test]
async fn token_policy_must_belong_to_the_client() {
    let h = harness(true, None);
    h.tokens
        .insert(TokenRecord::new(TOKEN, "client-a", 3600).with_scope("events").with_policy("other"));
    let err = h.get_e1(Some(E1_HISTORY)).await.unwrap_err();
    assert_eq!(err, AuthzError::UnregisteredPolicy("other".into()));
    assert_eq!(h.policy.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn policy_free_client_skips_evaluation() {
    let h = harness(false, None);
    let response = h.get_e1(Some(E1_HISTORY)).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.policy.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_resource_call_keeps_history() {
    let h = harness(true, None);
    *h.resource.status.lock() = StatusCode::NOT_FOUND;
    let response = h.get_e1(Some(E1_HISTORY)).await.unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.history_header, "");
    assert!(h.backend.is_empty());
}

#[tokio::test]
async fn delete_removes_the_row() {
    let h = harness(true, None);
    let first = h.get_e1(Some(E1_HISTORY)).await.unwrap();
    assert_eq!(h.backend.len(), 1);

    let response = h
        .validator
        .validate(
            request(Method::DELETE, "/api/events/e1", Some("e1"), Some(&first.history_header), None),
            &scopes(),
            h.resource.as_ref(),
        )
        .await
        .unwrap();
    assert_eq!(response.history_header, "");
    assert!(h.backend.is_empty());
}

#[tokio::test]
async fn other_methods_leave_history_alone() {
    let h = harness(true, None);
    let response = h
        .validator
        .validate(
            request(Method::PUT, "/api/events/e1", Some("e1"), Some(E1_HISTORY), Some(json!({}))),
            &scopes(),
            h.resource.as_ref(),
        )
        .await
        .unwrap();
    assert_eq!(response.history_header, "");
    assert!(h.backend.is_empty());
}

#[tokio::test]
async fn created_object_gets_a_fresh_history() {
    let h = harness(true, None);
    let response = h
        .validator
        .validate(
            request(Method::POST, "/api/events", None, None, Some(json!({"title": "launch"}))),
            &scopes(),
            h.resource.as_ref(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::CREATED);
    let batch = BatchHistoryList::from_wire(&response.history_header).unwrap();
    assert_eq!(batch.object_ids(), vec!["new-1"]);
    assert!(batch.get("new-1").unwrap().find("/api/events", "POST").is_some());
    assert!(h
        .backend
        .get(&DigestKey::new("new-1", TOKEN))
        .await
        .unwrap()
        .is_some());
    assert_eq!(h.policy.seen_history.lock()[0], "{}");
}

#[tokio::test]
async fn batch_write_failure_updates_nothing() {
    let h = harness(true, None);
    h.backend.inject_write_fault(DigestKey::new("b", TOKEN));
    let err = h
        .validator
        .validate(
            request(
                Method::POST,
                "/api/events/batch",
                None,
                None,
                Some(json!({"ids": ["a", "b", "c"]})),
            ),
            &scopes(),
            h.resource.as_ref(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "storage_unavailable");
    assert!(h.backend.is_empty());

    h.backend.clear_faults();
    let response = h
        .validator
        .validate(
            request(
                Method::POST,
                "/api/events/batch",
                None,
                None,
                Some(json!({"ids": ["a", "b", "c"]})),
            ),
            &scopes(),
            h.resource.as_ref(),
        )
        .await
        .unwrap();
    let batch = BatchHistoryList::from_wire(&response.history_header).unwrap();
    assert_eq!(batch.object_ids(), vec!["a", "b", "c"]);
    assert_eq!(h.backend.len(), 3);
}

#[tokio::test]
async fn update_program_output_becomes_the_new_history() {
    let h = harness(true, Some(StubUpdater { fail: false, api: "/updated" }));
    let response = h.get_e1(Some(E1_HISTORY)).await.unwrap();
    assert_eq!(
        response.history_header,
        r#"{"e1":[{"api":"/updated","counter":0,"method":"GET","timestamp":1.0}]}"#
    );
    let next = h.get_e1(Some(&response.history_header)).await.unwrap();
    assert_eq!(next.status, StatusCode::OK);
}

#[tokio::test]
async fn failing_update_program_writes_nothing() {
    let h = harness(true, Some(StubUpdater { fail: true, api: "/updated" }));
    let err = h.get_e1(Some(E1_HISTORY)).await.unwrap_err();
    assert!(matches!(err, AuthzError::HistoryUpdateFailed(_)));
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(h.backend.is_empty());
}

#[tokio::test]
async fn non_ascii_history_survives_the_round_trip() {
    let h = harness(
        true,
        Some(StubUpdater {
            fail: false,
            api: "/\u{e9}v\u{e9}nements\u{7f}",
        }),
    );
    let response = h.get_e1(Some(E1_HISTORY)).await.unwrap();
    assert_eq!(
        response.history_header,
        r#"{"e1":[{"api":"/\u00e9v\u00e9nements\u007f","counter":0,"method":"GET","timestamp":1.0}]}"#
    );
    assert!(HeaderValue::from_str(&response.history_header).is_ok());

    let next = h.get_e1(Some(&response.history_header)).await.unwrap();
    assert_eq!(next.status, StatusCode::OK);
}
