use std::sync::Arc;

use axum::body;
use axum::extract::{RawPathParams, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, MethodRouter};
use axum::{Json, Router};
use histguard_history::HISTORY_RESPONSE_HEADER;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::errors::AuthzError;
use crate::validator::{ProtectedRequest, ResourceHandler, StatefulValidator, ValidatedResponse};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// A resource handler behind the validator, mountable on any path.
#[derive(Clone)]
pub struct ProtectedRoute {
    validator: Arc<StatefulValidator>,
    handler: Arc<dyn ResourceHandler>,
    scopes: Arc<[String]>,
    body_limit: usize,
}

impl ProtectedRoute {
    pub fn new(validator: Arc<StatefulValidator>, handler: Arc<dyn ResourceHandler>) -> Self {
        Self {
            validator,
            handler,
            scopes: Arc::from(Vec::new()),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Every method on the path goes through the pipeline; the handler
    /// decides which methods it serves.
    pub fn into_method_router<S>(self) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        any(move |params: RawPathParams, request: Request| {
            let route = self.clone();
            async move { route.serve(params, request).await }
        })
    }

    pub async fn serve(&self, params: RawPathParams, request: Request) -> Response {
        let realm = self.validator.settings().realm.clone();
        let path_object_id = params.iter().next().map(|(_, value)| value.to_string());
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (parts, body) = request.into_parts();
        let body = match body::to_bytes(body, self.body_limit).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return HttpError::from_authz(
                    &AuthzError::InvalidRequest(format!("unreadable body: {err}")),
                    &realm,
                )
                .with_request_id(&request_id)
                .into_response()
            }
        };

        let protected = ProtectedRequest {
            request_id: request_id.clone(),
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            path_object_id,
        };
        match self
            .validator
            .validate(protected, &self.scopes, self.handler.as_ref())
            .await
        {
            Ok(validated) => success_response(validated, &realm, &request_id),
            Err(err) => HttpError::from_authz(&err, &realm)
                .with_request_id(&request_id)
                .into_response(),
        }
    }
}

fn success_response(validated: ValidatedResponse, realm: &str, request_id: &str) -> Response {
    let history = match HeaderValue::from_bytes(validated.history_header.as_bytes()) {
        Ok(value) => value,
        Err(err) => {
            error!(%err, "history does not fit in a header");
            return HttpError::from_authz(
                &AuthzError::Internal("history not representable as a header".into()),
                realm,
            )
            .with_request_id(request_id)
            .into_response();
        }
    };
    let mut response = (validated.status, Json(validated.body)).into_response();
    response.headers_mut().insert(HISTORY_RESPONSE_HEADER, history);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub fn health_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/healthz", get(|| async { "ok" }))
}

/// Wire form of a pipeline rejection.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    code: &'static str,
    message: String,
    challenge: Option<String>,
    request_id: Option<String>,
}

impl HttpError {
    pub fn from_authz(err: &AuthzError, realm: &str) -> Self {
        Self {
            status: err.status(),
            code: err.error_code(),
            message: err.to_string(),
            challenge: err.challenge(realm),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code,
            "error_description": self.message,
        }));
        let mut response = (self.status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(HISTORY_RESPONSE_HEADER, HeaderValue::from_static(""));
        if let Some(value) = self
            .challenge
            .and_then(|challenge| HeaderValue::from_str(&challenge).ok())
        {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }
        if let Some(value) = self
            .request_id
            .and_then(|id| HeaderValue::from_str(&id).ok())
        {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}
