use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::ModuleHandle;
use crate::errors::{SandboxError, SandboxResult};
use crate::metrics::observe_run;
use crate::sandbox::SandboxHost;

/// Computes the next history document from the request and the current one.
#[async_trait]
pub trait UpdateRunner: Send + Sync {
    async fn update(
        &self,
        program_hash: &str,
        request_json: &str,
        old_history_json: &str,
    ) -> SandboxResult<Value>;
}

#[derive(Clone)]
pub struct WasmUpdateRunner {
    host: SandboxHost,
}

impl WasmUpdateRunner {
    pub fn new(host: SandboxHost) -> Self {
        Self { host }
    }

    pub async fn run_module(
        &self,
        program: &ModuleHandle,
        request_json: &str,
        old_history_json: &str,
    ) -> SandboxResult<Value> {
        let old_history_json = if old_history_json.trim().is_empty() {
            "{}"
        } else {
            old_history_json
        };
        let argv = vec![
            program.hash().to_string(),
            request_json.to_string(),
            old_history_json.to_string(),
        ];

        let started = Instant::now();
        let result = self
            .host
            .run_program(program, argv)
            .await
            .and_then(|output| validate_output(program.hash(), &output.stdout_lossy(), old_history_json));
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => observe_run("update", "ok", latency_ms),
            Err(err) => observe_run("update", err.label(), latency_ms),
        }
        result
    }
}

#[async_trait]
impl UpdateRunner for WasmUpdateRunner {
    async fn update(
        &self,
        program_hash: &str,
        request_json: &str,
        old_history_json: &str,
    ) -> SandboxResult<Value> {
        let handle = self
            .host
            .module(program_hash)
            .ok_or_else(|| SandboxError::ModuleNotFound(program_hash.to_string()))?;
        self.run_module(&handle, request_json, old_history_json).await
    }
}

/// The new document must be a JSON object that still covers every object id
/// present in the old one.
fn validate_output(program: &str, stdout: &str, old_history_json: &str) -> SandboxResult<Value> {
    let invalid = |reason: String| SandboxError::InvalidOutput {
        program: program.to_string(),
        reason,
    };

    let new_history: Value =
        serde_json::from_str(stdout.trim()).map_err(|err| invalid(err.to_string()))?;
    let new_map = new_history
        .as_object()
        .ok_or_else(|| invalid("expected a json object keyed by object id".into()))?;

    let old_history: Value =
        serde_json::from_str(old_history_json).map_err(|err| invalid(format!("old history: {err}")))?;
    if let Some(old_map) = old_history.as_object() {
        if let Some(missing) = old_map.keys().find(|key| !new_map.contains_key(*key)) {
            return Err(invalid(format!("object {missing} dropped from history")));
        }
    }
    Ok(new_history)
}
