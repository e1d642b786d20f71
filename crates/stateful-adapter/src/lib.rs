//! Stateful bearer-token validation.
//!
//! A protected request passes, in order: token lookup and scope check,
//! integrity check of the presented history against the stored digests,
//! the client's policy program, the resource handler, and finally the
//! history update whose result is returned in `Set-Authorization-History`.
//! Any stage may end the request with an [`AuthzError`].

pub mod bootstrap;
pub mod clients;
pub mod errors;
pub mod http;
pub mod metrics;
pub mod object_ids;
pub mod registration;
pub mod request;
pub mod timings;
pub mod tokens;
pub mod trace;
pub mod validator;

pub use bootstrap::ValidatorBootstrap;
pub use clients::{ClientRecord, ClientRegistry};
pub use errors::{AuthzError, AuthzResult};
pub use http::{health_router, HttpError, ProtectedRoute};
pub use metrics::register_metrics;
pub use object_ids::extract_object_ids;
pub use registration::{
    generate_hmac_key, ClientRegistration, FetchError, HttpPolicyFetcher, PolicyFetcher, Registrar,
};
pub use request::{redact_headers, RequestView};
pub use timings::RequestTimings;
pub use tokens::{MemoryTokenStore, TokenRecord, TokenStore};
pub use validator::{
    ProtectedRequest, ResourceHandler, ResourceOutcome, ResourceRequest, StatefulValidator,
    ValidatedResponse, ValidatorSettings,
};
