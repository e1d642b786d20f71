use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use digest_store::{IntegrityCheck, IntegrityStore};
use histguard_history::canonical::is_header_safe;
use histguard_history::{BatchHistoryList, HistoryEntry, HISTORY_REQUEST_HEADER};
use policy_sandbox::{PolicyRunner, UpdateRunner};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn, Instrument};

use crate::clients::{ClientRecord, ClientRegistry};
use crate::errors::{from_policy_error, AuthzError, AuthzResult};
use crate::metrics::record_outcome;
use crate::object_ids::extract_object_ids;
use crate::request::{redact_headers, RequestView};
use crate::timings::{RequestTimings, Stage};
use crate::tokens::{authenticate, now_unix, TokenRecord, TokenStore};
use crate::trace::ValidatorTracer;

/// Inbound request as the pipeline consumes it.
#[derive(Debug, Clone)]
pub struct ProtectedRequest {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// First path parameter of the matched route, if any.
    pub path_object_id: Option<String>,
}

/// What a protected resource sees once authorization passed.
pub struct ResourceRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub path_object_id: Option<&'a str>,
    pub body: Option<&'a Value>,
    pub object_ids: &'a [String],
    pub token: &'a TokenRecord,
}

/// Result of a resource call together with the ids it touched.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOutcome {
    pub status: StatusCode,
    pub body: Value,
    /// Ids touched by the call. Empty means "the ids the request addressed".
    pub object_ids: Vec<String>,
}

impl ResourceOutcome {
    pub fn ok(body: Value) -> Self {
        Self::with_status(StatusCode::OK, body)
    }

    pub fn created(body: Value, object_id: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CREATED, body).touching(vec![object_id.into()])
    }

    pub fn with_status(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            body,
            object_ids: Vec::new(),
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self::with_status(status, serde_json::json!({ "error": message.into() }))
    }

    pub fn touching(mut self, object_ids: Vec<String>) -> Self {
        self.object_ids = object_ids;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_client_error() || self.status.is_server_error()
    }
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn handle(&self, request: ResourceRequest<'_>) -> ResourceOutcome;
}

/// Authorized response plus the history the caller must carry forward.
#[derive(Debug, Clone)]
pub struct ValidatedResponse {
    pub status: StatusCode,
    pub body: Value,
    /// Canonical batch for `Set-Authorization-History`; empty after a delete
    /// or when nothing was updated.
    pub history_header: String,
    pub timings: RequestTimings,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidatorSettings {
    pub realm: String,
    /// Methods whose successful calls extend the history. DELETE always
    /// removes it; any other method leaves it untouched.
    pub update_methods: Vec<String>,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            realm: "histguard".into(),
            update_methods: vec!["GET".into(), "POST".into()],
        }
    }
}

impl ValidatorSettings {
    fn updates_history(&self, method: &Method) -> bool {
        self.update_methods
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(method.as_str()))
    }
}

/// Token lookup, history integrity, policy, resource call, history update.
/// Each stage either hands over to the next or ends the request.
pub struct StatefulValidator {
    tokens: Arc<dyn TokenStore>,
    clients: ClientRegistry,
    integrity: IntegrityStore,
    policy: Arc<dyn PolicyRunner>,
    updater: Arc<dyn UpdateRunner>,
    settings: ValidatorSettings,
    tracer: ValidatorTracer,
}

enum HistoryChange {
    Extend,
    Remove,
    Keep,
}

impl StatefulValidator {
    pub(crate) fn from_parts(
        tokens: Arc<dyn TokenStore>,
        clients: ClientRegistry,
        integrity: IntegrityStore,
        policy: Arc<dyn PolicyRunner>,
        updater: Arc<dyn UpdateRunner>,
        settings: ValidatorSettings,
    ) -> Self {
        Self {
            tokens,
            clients,
            integrity,
            policy,
            updater,
            settings,
            tracer: ValidatorTracer {
                component: "stateful-adapter".into(),
            },
        }
    }

    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn integrity(&self) -> &IntegrityStore {
        &self.integrity
    }

    pub async fn validate(
        &self,
        request: ProtectedRequest,
        scopes: &[String],
        handler: &dyn ResourceHandler,
    ) -> AuthzResult<ValidatedResponse> {
        let span = self
            .tracer
            .span(request.method.as_str(), request.uri.path(), &request.request_id);
        let mut timings = RequestTimings::default();
        let result = self
            .run(&request, scopes, handler, &mut timings)
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        let outcome = match &result {
            Ok(response) if response.status.is_client_error() || response.status.is_server_error() => {
                "resource_error"
            }
            Ok(_) => "accepted",
            Err(AuthzError::PolicyFailed) => "policy_denied",
            Err(err) => err.error_code(),
        };
        record_outcome(outcome);
        timings.emit(outcome);
        if let Err(err) = &result {
            warn!(code = err.error_code(), error = %err, "request rejected");
        }
        result.map(|mut response| {
            response.timings = timings;
            response
        })
    }

    async fn run(
        &self,
        request: &ProtectedRequest,
        scopes: &[String],
        handler: &dyn ResourceHandler,
        timings: &mut RequestTimings,
    ) -> AuthzResult<ValidatedResponse> {
        debug!(headers = ?redact_headers(&request.headers), "protected request");

        let started = Instant::now();
        let token = authenticate(self.tokens.as_ref(), &request.headers, scopes, now_unix()).await;
        timings.record(Stage::TokenValidation, started);
        let token = token?;
        let client = self
            .clients
            .get(&token.client_id)
            .ok_or_else(|| AuthzError::InvalidToken("token belongs to an unknown client".into()))?;
        tracing::Span::current().record("client", client.client_id.as_str());

        let view = RequestView::from_parts(
            &request.method,
            &request.uri,
            &request.headers,
            &request.body,
            histguard_history::unix_now(),
        )?;
        let object_ids = extract_object_ids(request.path_object_id.as_deref(), view.body_json())?;

        let started = Instant::now();
        let mut txn = self.integrity.begin();
        let presented = self
            .verify_history(request, &token, &client, &object_ids, &mut txn, timings)
            .await;
        timings.record(Stage::HistoryValidation, started);
        let presented = presented?;

        let request_json = view.to_json()?;
        let started = Instant::now();
        // only verified lists reach the policy
        let verified = presented.subset(&object_ids);
        let verdict = self
            .evaluate_policy(&token, &client, &request_json, &verified)
            .await;
        timings.record(Stage::PolicyExecution, started);
        verdict?;

        let started = Instant::now();
        let outcome = handler
            .handle(ResourceRequest {
                method: &request.method,
                path: &view.path,
                path_object_id: request.path_object_id.as_deref(),
                body: view.body_json(),
                object_ids: &object_ids,
                token: &token,
            })
            .await;
        timings.record(Stage::ResourceExecution, started);
        if outcome.is_failure() {
            debug!(status = outcome.status.as_u16(), "resource call failed, history unchanged");
            return Ok(ValidatedResponse {
                status: outcome.status,
                body: outcome.body,
                history_header: String::new(),
                timings: RequestTimings::default(),
            });
        }

        let started = Instant::now();
        let history_header = self
            .update_history(
                &token,
                &client,
                &request.method,
                &view,
                &request_json,
                &presented,
                &object_ids,
                &outcome.object_ids,
                txn,
            )
            .await;
        timings.record(Stage::HistoryUpdate, started);

        Ok(ValidatedResponse {
            status: outcome.status,
            body: outcome.body,
            history_header: history_header?,
            timings: RequestTimings::default(),
        })
    }

    /// Parses the presented batch and checks every addressed id against its
    /// stored digest.
    async fn verify_history(
        &self,
        request: &ProtectedRequest,
        token: &TokenRecord,
        client: &ClientRecord,
        object_ids: &[String],
        txn: &mut digest_store::DigestTxn,
        timings: &mut RequestTimings,
    ) -> AuthzResult<BatchHistoryList> {
        let raw = request
            .headers
            .get(HISTORY_REQUEST_HEADER)
            .map(|value| {
                value.to_str().map_err(|_| {
                    AuthzError::InvalidHistory("history header is not valid ascii".into())
                })
            })
            .transpose()?;
        timings.history_size = raw.map(str::len).unwrap_or(0);
        let presented = BatchHistoryList::from_header(raw)?;
        timings.history_length = presented.entry_count();

        for id in object_ids {
            self.admit(txn, token, client, &presented, id).await?;
        }
        Ok(presented)
    }

    async fn admit(
        &self,
        txn: &mut digest_store::DigestTxn,
        token: &TokenRecord,
        client: &ClientRecord,
        presented: &BatchHistoryList,
        object_id: &str,
    ) -> AuthzResult<()> {
        let list = presented.get_or_empty(object_id);
        let check = self
            .integrity
            .check(txn, &token.access_token, &list, Some(client.hmac_key.as_slice()))
            .await?;
        match check {
            IntegrityCheck::FirstUse | IntegrityCheck::Verified => Ok(()),
            IntegrityCheck::Mismatch => Err(AuthzError::InvalidHistory(format!(
                "history for `{object_id}` does not match its stored digest"
            ))),
            IntegrityCheck::Unseeded => Err(AuthzError::InvalidHistory(format!(
                "history for `{object_id}` was never issued by this server"
            ))),
        }
    }

    async fn evaluate_policy(
        &self,
        token: &TokenRecord,
        client: &ClientRecord,
        request_json: &str,
        history: &BatchHistoryList,
    ) -> AuthzResult<()> {
        let Some(policy) = client.resolve_policy(token.policy.as_deref())? else {
            debug!("client registers no policy, skipping evaluation");
            return Ok(());
        };
        tracing::Span::current().record("policy", policy.as_str());

        let decision = self
            .policy
            .run(&policy, request_json, &history.to_canonical_json())
            .await
            .map_err(|err| from_policy_error(&policy, err))?;
        if decision.is_accept() {
            Ok(())
        } else {
            Err(AuthzError::PolicyFailed)
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_history(
        &self,
        token: &TokenRecord,
        client: &ClientRecord,
        method: &Method,
        view: &RequestView,
        request_json: &str,
        presented: &BatchHistoryList,
        addressed: &[String],
        reported: &[String],
        mut txn: digest_store::DigestTxn,
    ) -> AuthzResult<String> {
        let touched: Vec<String> = if reported.is_empty() {
            addressed.to_vec()
        } else {
            let mut ids = Vec::with_capacity(reported.len());
            for id in reported {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
            ids
        };

        let change = if *method == Method::DELETE {
            HistoryChange::Remove
        } else if self.settings.updates_history(method) {
            HistoryChange::Extend
        } else {
            HistoryChange::Keep
        };
        if touched.is_empty() || matches!(change, HistoryChange::Keep) {
            return Ok(String::new());
        }

        // ids the handler touched beyond the addressed ones still need a read
        // precondition, and their presented history must hold
        for id in touched.iter().filter(|id| !addressed.contains(id)) {
            self.admit(&mut txn, token, client, presented, id).await?;
        }

        if let HistoryChange::Remove = change {
            for id in &touched {
                self.integrity.stage_removal(&mut txn, &token.access_token, id);
            }
            let report = self.integrity.commit(txn).await?;
            info!(deleted = report.deleted, "history rows removed");
            return Ok(String::new());
        }

        let old = presented.subset(&touched);
        let next = match &client.update_program {
            Some(program) => {
                let value = self
                    .updater
                    .update(program, request_json, &old.to_canonical_json())
                    .await
                    .map_err(|err| AuthzError::HistoryUpdateFailed(err.to_string()))?;
                BatchHistoryList::from_value(&value)
                    .map_err(|err| AuthzError::HistoryUpdateFailed(err.to_string()))?
                    .subset(&touched)
            }
            None => native_update(old, view),
        };

        // a digest may only be stored for a history the caller can carry back
        let header = next.to_canonical_json();
        if !is_header_safe(&header) {
            return Err(AuthzError::HistoryUpdateFailed(
                "updated history is not representable as a header".into(),
            ));
        }
        for list in next.iter() {
            self.integrity
                .stage_update(&mut txn, &token.access_token, list, Some(client.hmac_key.as_slice()))?;
        }
        let report = self.integrity.commit(txn).await?;
        debug!(upserted = report.upserted, "history digests committed");
        Ok(header)
    }
}

/// Built-in transition: one entry per call, deduplicated on (api, method).
fn native_update(mut batch: BatchHistoryList, view: &RequestView) -> BatchHistoryList {
    let ids: Vec<String> = batch.object_ids().into_iter().map(str::to_string).collect();
    for id in ids {
        batch.append(&id, HistoryEntry::new(&view.path, &view.method, view.time));
    }
    batch
}
