use std::borrow::Cow;

use tracing::{info_span, Span};

#[derive(Clone, Default)]
pub struct ValidatorTracer {
    pub component: Cow<'static, str>,
}

impl ValidatorTracer {
    /// One span per protected request. `client` and `policy` are filled in
    /// once the token is resolved.
    pub fn span(&self, method: &str, path: &str, request_id: &str) -> Span {
        info_span!(
            "histguard.validate",
            method = method,
            path = path,
            request_id = request_id,
            client = tracing::field::Empty,
            policy = tracing::field::Empty,
            component = %self.component
        )
    }
}
