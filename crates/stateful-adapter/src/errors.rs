use axum::http::StatusCode;
use digest_store::{IntegrityError, StorageError};
use histguard_history::MalformedHistoryError;
use policy_sandbox::SandboxError;
use thiserror::Error;

/// Pipeline-level failure. Every stage reports exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthzError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token lacks required scope `{required}`")]
    InsufficientScope { required: String },
    #[error("policy {0} is not registered for this client")]
    UnregisteredPolicy(String),
    #[error("policy denied the request")]
    PolicyFailed,
    #[error("policy crashed: {0}")]
    PolicyCrashed(String),
    #[error("policy endpoint unusable: {0}")]
    BadPolicyEndpoint(String),
    #[error("policy hash mismatch: expected {expected}, fetched {actual}")]
    PolicyHashMismatch { expected: String, actual: String },
    #[error("invalid history: {0}")]
    InvalidHistory(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("history changed concurrently: {0}")]
    HistoryConflict(String),
    #[error("history update failed: {0}")]
    HistoryUpdateFailed(String),
    #[error("policy sandbox busy: {0}")]
    SandboxBusy(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthzError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthzError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AuthzError::InsufficientScope { .. }
            | AuthzError::UnregisteredPolicy(_)
            | AuthzError::PolicyFailed
            | AuthzError::PolicyCrashed(_)
            | AuthzError::BadPolicyEndpoint(_)
            | AuthzError::PolicyHashMismatch { .. } => StatusCode::FORBIDDEN,
            AuthzError::InvalidHistory(_) | AuthzError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AuthzError::HistoryConflict(_) => StatusCode::CONFLICT,
            AuthzError::HistoryUpdateFailed(_) | AuthzError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AuthzError::SandboxBusy(_) | AuthzError::StorageUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// OAuth2-style `error` code.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthzError::InvalidToken(_) => "invalid_token",
            AuthzError::InsufficientScope { .. } => "insufficient_scope",
            AuthzError::UnregisteredPolicy(_) => "unregistered_policy",
            AuthzError::PolicyFailed => "policy_failed",
            AuthzError::PolicyCrashed(_) => "policy_crashed",
            AuthzError::BadPolicyEndpoint(_) => "bad_policy_endpoint",
            AuthzError::PolicyHashMismatch { .. } => "policy_hash_mismatch",
            AuthzError::InvalidHistory(_) => "invalid_history",
            AuthzError::InvalidRequest(_) => "invalid_request",
            AuthzError::HistoryConflict(_) => "history_conflict",
            AuthzError::HistoryUpdateFailed(_) => "history_update_failed",
            AuthzError::SandboxBusy(_) => "temporarily_unavailable",
            AuthzError::StorageUnavailable(_) => "storage_unavailable",
            AuthzError::Internal(_) => "server_error",
        }
    }

    /// `WWW-Authenticate` value for errors that carry a bearer challenge.
    pub fn challenge(&self, realm: &str) -> Option<String> {
        match self {
            AuthzError::InvalidToken(_) => Some(format!(
                r#"Bearer realm="{}", error="invalid_token", error_description="{}""#,
                quote_safe(realm),
                quote_safe(&self.to_string())
            )),
            AuthzError::InsufficientScope { required } => Some(format!(
                r#"Bearer realm="{}", error="insufficient_scope", error_description="{}", scope="{}""#,
                quote_safe(realm),
                quote_safe(&self.to_string()),
                quote_safe(required)
            )),
            _ => None,
        }
    }
}

fn quote_safe(value: &str) -> String {
    value.replace(['"', '\\'], "'")
}

impl From<MalformedHistoryError> for AuthzError {
    fn from(err: MalformedHistoryError) -> Self {
        AuthzError::InvalidHistory(err.to_string())
    }
}

impl From<StorageError> for AuthzError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(key) => AuthzError::HistoryConflict(key.to_string()),
            StorageError::Unavailable(msg) => AuthzError::StorageUnavailable(msg),
            StorageError::Internal(msg) => AuthzError::Internal(msg),
        }
    }
}

impl From<IntegrityError> for AuthzError {
    fn from(err: IntegrityError) -> Self {
        match err {
            IntegrityError::Storage(err) => err.into(),
            IntegrityError::Digest(err) => AuthzError::Internal(err.to_string()),
        }
    }
}

/// Policy-stage translation: anything other than a clean verdict denies.
pub(crate) fn from_policy_error(policy: &str, err: SandboxError) -> AuthzError {
    match err {
        SandboxError::ModuleNotFound(_) => AuthzError::UnregisteredPolicy(policy.to_string()),
        SandboxError::Busy(name) => AuthzError::SandboxBusy(name),
        other => AuthzError::PolicyCrashed(other.to_string()),
    }
}

pub type AuthzResult<T> = Result<T, AuthzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table() {
        let cases = [
            (AuthzError::InvalidToken("x".into()), 401),
            (AuthzError::InsufficientScope { required: "events".into() }, 403),
            (AuthzError::UnregisteredPolicy("p".into()), 403),
            (AuthzError::PolicyFailed, 403),
            (AuthzError::PolicyCrashed("trap".into()), 403),
            (AuthzError::BadPolicyEndpoint("404".into()), 403),
            (
                AuthzError::PolicyHashMismatch {
                    expected: "a".into(),
                    actual: "b".into(),
                },
                403,
            ),
            (AuthzError::InvalidHistory("bad".into()), 400),
        ];
        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
        }
    }

    #[test]
    fn only_token_errors_carry_challenge() {
        let challenge = AuthzError::InvalidToken("expired".into())
            .challenge("histguard")
            .unwrap();
        assert!(challenge.starts_with(r#"Bearer realm="histguard", error="invalid_token""#));

        let scope = AuthzError::InsufficientScope {
            required: "events:write".into(),
        }
        .challenge("r")
        .unwrap();
        assert!(scope.ends_with(r#"scope="events:write""#));

        assert!(AuthzError::PolicyFailed.challenge("r").is_none());
    }

    #[test]
    fn missing_module_is_unregistered_and_traps_are_crashes() {
        assert_eq!(
            from_policy_error("abc", SandboxError::ModuleNotFound("abc".into())),
            AuthzError::UnregisteredPolicy("abc".into())
        );
        assert!(matches!(
            from_policy_error(
                "abc",
                SandboxError::Timeout {
                    program: "abc".into(),
                    wall_ms: 10
                }
            ),
            AuthzError::PolicyCrashed(_)
        ));
    }
}
