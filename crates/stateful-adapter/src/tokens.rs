use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::errors::{AuthzError, AuthzResult};

/// An issued access token as the authorization server recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub client_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Space-separated scope list.
    #[serde(default)]
    pub scope: String,
    /// Content hash of the policy bound at issuance.
    #[serde(default)]
    pub policy: Option<String>,
    pub issued_at: i64,
    pub expires_in: i64,
    #[serde(default)]
    pub revoked: bool,
}

impl TokenRecord {
    pub fn new(access_token: impl Into<String>, client_id: impl Into<String>, expires_in: i64) -> Self {
        Self {
            access_token: access_token.into(),
            client_id: client_id.into(),
            user_id: None,
            scope: String::new(),
            policy: None,
            issued_at: now_unix(),
            expires_in,
            revoked: false,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_in > 0 && now >= self.issued_at.saturating_add(self.expires_in)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }

    pub fn has_scope(&self, required: &str) -> bool {
        self.scopes().any(|scope| scope == required)
    }
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Lookup of issued tokens by their opaque value.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn lookup(&self, access_token: &str) -> Option<TokenRecord>;
}

#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    tokens: Arc<DashMap<String, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: TokenRecord) {
        self.tokens.insert(record.access_token.clone(), record);
    }

    pub fn revoke(&self, access_token: &str) -> bool {
        match self.tokens.get_mut(access_token) {
            Some(mut record) => {
                record.revoked = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn lookup(&self, access_token: &str) -> Option<TokenRecord> {
        self.tokens.get(access_token).map(|record| record.clone())
    }
}

/// Pulls the bearer credential out of `Authorization`.
pub fn bearer_token(headers: &HeaderMap) -> AuthzResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AuthzError::InvalidToken("missing bearer token".into()))?
        .to_str()
        .map_err(|_| AuthzError::InvalidToken("authorization header is not ascii".into()))?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| AuthzError::InvalidToken("malformed authorization header".into()))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthzError::InvalidToken(format!(
            "unsupported authorization scheme `{scheme}`"
        )));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthzError::InvalidToken("empty bearer token".into()));
    }
    Ok(token)
}

/// Resolves the bearer token, rejects expired or revoked tokens and checks
/// every scope in `required`.
pub async fn authenticate(
    store: &dyn TokenStore,
    headers: &HeaderMap,
    required: &[String],
    now: i64,
) -> AuthzResult<TokenRecord> {
    let presented = bearer_token(headers)?;
    let record = store
        .lookup(presented)
        .await
        .ok_or_else(|| AuthzError::InvalidToken("unknown token".into()))?;
    if record.is_revoked() {
        return Err(AuthzError::InvalidToken("token revoked".into()));
    }
    if record.is_expired(now) {
        return Err(AuthzError::InvalidToken("token expired".into()));
    }
    if let Some(missing) = required.iter().find(|scope| !record.has_scope(scope)) {
        return Err(AuthzError::InsufficientScope {
            required: missing.clone(),
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    fn store() -> MemoryTokenStore {
        let store = MemoryTokenStore::new();
        store.insert(TokenRecord::new("tok-live", "client-a", 3600).with_scope("events profile"));
        store
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token(&headers("bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(&headers("Bearer  abc ")).unwrap(), "abc");
        assert!(bearer_token(&headers("Basic abc")).is_err());
        assert!(bearer_token(&headers("Bearer")).is_err());
        assert!(bearer_token(&HeaderMap::new()).is_err());
    }

    #[test]
    fn zero_lifetime_never_expires() {
        let mut record = TokenRecord::new("t", "c", 0);
        record.issued_at = 0;
        assert!(!record.is_expired(i64::MAX));
        record.expires_in = 10;
        assert!(record.is_expired(10));
        assert!(!record.is_expired(9));
    }

    #[tokio::test]
    async fn scopes_must_all_be_granted() {
        let store = store();
        let now = now_unix();
        let ok = authenticate(&store, &headers("Bearer tok-live"), &["events".into()], now)
            .await
            .unwrap();
        assert_eq!(ok.client_id, "client-a");

        let err = authenticate(
            &store,
            &headers("Bearer tok-live"),
            &["events".into(), "admin".into()],
            now,
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
    async fn revoked_and_expired_tokens_are_invalid() {
        let store = store();
        let now = now_unix();
        assert!(store.revoke("tok-live"));
        let err = authenticate(&store, &headers("Bearer tok-live"), &[], now)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_token");

        let mut old = TokenRecord::new("tok-old", "client-a", 60);
        old.issued_at = now - 120;
        store.insert(old);
        let err = authenticate(&store, &headers("Bearer tok-old"), &[], now)
            .await
            .unwrap_err();
        assert_eq!(err, AuthzError::InvalidToken("token expired".into()));
    }
}
