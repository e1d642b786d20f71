use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::ModuleHandle;
use crate::errors::{SandboxError, SandboxResult};
use crate::metrics::observe_run;
use crate::sandbox::SandboxHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Deny,
}

impl Decision {
    pub fn is_accept(self) -> bool {
        matches!(self, Decision::Accept)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Deny => "deny",
        }
    }
}

/// Maps captured stdout to a decision. `Deny` anywhere wins, then `Accept`;
/// output naming neither denies.
pub fn parse_verdict(stdout: &str) -> Decision {
    if stdout.contains("Deny") {
        Decision::Deny
    } else if stdout.contains("Accept") {
        Decision::Accept
    } else {
        Decision::Deny
    }
}

/// Evaluates a policy, identified by content hash, against a request and the
/// presented history.
#[async_trait]
pub trait PolicyRunner: Send + Sync {
    async fn run(
        &self,
        policy_hash: &str,
        request_json: &str,
        history_json: &str,
    ) -> SandboxResult<Decision>;
}

#[derive(Clone)]
pub struct WasmPolicyRunner {
    host: SandboxHost,
}

impl WasmPolicyRunner {
    pub fn new(host: SandboxHost) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &SandboxHost {
        &self.host
    }

    /// Invokes `policy` with argv `(policy_id, request_json, history_json)`.
    /// An absent history is passed as `{}`.
    pub async fn run_module(
        &self,
        policy: &ModuleHandle,
        policy_id: &str,
        request_json: &str,
        history_json: &str,
    ) -> SandboxResult<Decision> {
        let history_json = if history_json.trim().is_empty() {
            "{}"
        } else {
            history_json
        };
        let argv = vec![
            policy_id.to_string(),
            request_json.to_string(),
            history_json.to_string(),
        ];

        let started = Instant::now();
        let result = self.host.run_program(policy, argv).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(output) => {
                let decision = parse_verdict(&output.stdout_lossy());
                observe_run("policy", decision.as_str(), latency_ms);
                debug!(
                    policy = %policy.hash(),
                    decision = decision.as_str(),
                    fuel = output.fuel_consumed,
                    "policy evaluated"
                );
                Ok(decision)
            }
            Err(err) => {
                observe_run("policy", err.label(), latency_ms);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl PolicyRunner for WasmPolicyRunner {
    async fn run(
        &self,
        policy_hash: &str,
        request_json: &str,
        history_json: &str,
    ) -> SandboxResult<Decision> {
        let handle = self
            .host
            .module(policy_hash)
            .ok_or_else(|| SandboxError::ModuleNotFound(policy_hash.to_string()))?;
        self.run_module(&handle, policy_hash, request_json, history_json)
            .await
    }
}
