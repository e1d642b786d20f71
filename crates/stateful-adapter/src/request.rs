use std::collections::BTreeMap;

use axum::http::{header, HeaderMap, HeaderName, Method, Uri};
use serde::Serialize;
use serde_json::Value;

use crate::errors::{AuthzError, AuthzResult};

/// Header values that never reach a log line verbatim.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "authorization-history",
    "set-authorization-history",
    "x-api-key",
];

const REDACTED: &str = "<redacted>";

/// The request document handed to policy and update programs.
///
/// `headers` is the full header map, credentials included. Guest programs
/// see it as-is; logs only ever see [`redact_headers`].
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub method: String,
    pub uri: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub time: f64,
}

impl RequestView {
    pub fn from_parts(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
        time: f64,
    ) -> AuthzResult<Self> {
        let body = if is_json(headers) && !body.is_empty() {
            serde_json::from_slice(body)
                .map_err(|err| AuthzError::InvalidRequest(format!("body is not valid json: {err}")))?
        } else {
            Value::Null
        };
        Ok(Self {
            method: method.as_str().to_string(),
            uri: full_uri(uri, headers),
            path: uri.path().to_string(),
            headers: flatten_headers(headers),
            body,
            time,
        })
    }

    pub fn body_json(&self) -> Option<&Value> {
        match &self.body {
            Value::Null => None,
            other => Some(other),
        }
    }

    pub fn to_json(&self) -> AuthzResult<String> {
        serde_json::to_string(self).map_err(|err| AuthzError::Internal(err.to_string()))
    }
}

/// Absolute request URL. Origin-form targets are completed from `Host`,
/// with the scheme taken from `X-Forwarded-Proto` (default `http`).
pub fn full_uri(uri: &Uri, headers: &HeaderMap) -> String {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }
    let Some(host) = header_str(headers, header::HOST) else {
        return uri.to_string();
    };
    let scheme = header_str(headers, HeaderName::from_static("x-forwarded-proto"))
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("http");
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{scheme}://{host}{target}")
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}

/// Header map safe to log.
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat = flatten_headers(headers);
    for (name, value) in flat.iter_mut() {
        if SENSITIVE_HEADERS.contains(&name.as_str()) {
            *value = REDACTED.to_string();
        }
    }
    flat
}
