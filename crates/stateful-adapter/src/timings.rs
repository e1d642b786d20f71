use std::time::{Duration, Instant};

use tracing::info;

use crate::metrics::observe_stage;

/// Per-request stage timings and history size figures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestTimings {
    pub token_validation: Duration,
    pub history_validation: Duration,
    pub policy_execution: Duration,
    pub resource_execution: Duration,
    pub history_update: Duration,
    /// Entries across every presented list.
    pub history_length: usize,
    /// Bytes of the presented history header.
    pub history_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TokenValidation,
    HistoryValidation,
    PolicyExecution,
    ResourceExecution,
    HistoryUpdate,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::TokenValidation => "token_validation",
            Stage::HistoryValidation => "history_validation",
            Stage::PolicyExecution => "policy_execution",
            Stage::ResourceExecution => "resource_execution",
            Stage::HistoryUpdate => "history_update",
        }
    }
}

impl RequestTimings {
    pub fn record(&mut self, stage: Stage, started: Instant) {
        let elapsed = started.elapsed();
        let slot = match stage {
            Stage::TokenValidation => &mut self.token_validation,
            Stage::HistoryValidation => &mut self.history_validation,
            Stage::PolicyExecution => &mut self.policy_execution,
            Stage::ResourceExecution => &mut self.resource_execution,
            Stage::HistoryUpdate => &mut self.history_update,
        };
        *slot += elapsed;
        observe_stage(stage.as_str(), elapsed.as_secs_f64() * 1000.0);
    }

    pub fn total(&self) -> Duration {
        self.token_validation
            + self.history_validation
            + self.policy_execution
            + self.resource_execution
            + self.history_update
    }

    pub fn emit(&self, outcome: &str) {
        info!(
            outcome,
            token_ms = millis(self.token_validation),
            history_ms = millis(self.history_validation),
            policy_ms = millis(self.policy_execution),
            resource_ms = millis(self.resource_execution),
            update_ms = millis(self.history_update),
            history_length = self.history_length,
            history_size = self.history_size,
            "request timings"
        );
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
