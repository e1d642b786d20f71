use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-invocation resource budget applied to every guest program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Instruction budget, in wasmtime fuel units.
    pub fuel: u64,
    pub wall_ms: u64,
    pub mem_mb: u32,
    /// Captured stdout beyond this size traps the guest.
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    /// Concurrent invocations allowed per module.
    pub concurrency: u32,
    pub epoch_tick_ms: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            fuel: 50_000_000,
            wall_ms: 1_000,
            mem_mb: 64,
            stdout_bytes: 256 * 1024,
            stderr_bytes: 16 * 1024,
            concurrency: 8,
            epoch_tick_ms: 10,
        }
    }
}

impl SandboxLimits {
    pub fn wall_budget(&self) -> Duration {
        Duration::from_millis(self.wall_ms.max(1))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }

    /// Epoch deadline in ticks. One extra tick absorbs the phase between the
    /// deadline being armed and the next tick of the shared ticker.
    pub fn epoch_ticks(&self) -> u64 {
        let tick = self.epoch_tick_ms.max(1);
        self.wall_ms.max(1).div_ceil(tick) + 1
    }

    pub fn memory_bytes(&self) -> usize {
        (self.mem_mb as usize).saturating_mul(1024 * 1024)
    }
}
