use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("engine setup failed: {0}")]
    Engine(String),
    #[error("failed to compile module: {0}")]
    Compile(String),
    #[error("module not loaded: {0}")]
    ModuleNotFound(String),
    #[error("program {program} crashed: {reason}")]
    Crashed { program: String, reason: String },
    #[error("program {program} exhausted its fuel budget of {limit}")]
    OutOfFuel { program: String, limit: u64 },
    #[error("program {program} exceeded its wall-clock budget of {wall_ms}ms")]
    Timeout { program: String, wall_ms: u64 },
    #[error("program {0} is at its concurrency limit")]
    Busy(String),
    #[error("program {program} produced invalid output: {reason}")]
    InvalidOutput { program: String, reason: String },
    #[error("sandbox task failed: {0}")]
    Join(String),
}

impl SandboxError {
    /// Faults raised while guest code was running, as opposed to host-side
    /// setup problems.
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            SandboxError::Crashed { .. }
                | SandboxError::OutOfFuel { .. }
                | SandboxError::Timeout { .. }
                | SandboxError::InvalidOutput { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SandboxError::Engine(_) => "engine",
            SandboxError::Compile(_) => "compile",
            SandboxError::ModuleNotFound(_) => "not_found",
            SandboxError::Crashed { .. } => "crashed",
            SandboxError::OutOfFuel { .. } => "out_of_fuel",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::Busy(_) => "busy",
            SandboxError::InvalidOutput { .. } => "invalid_output",
            SandboxError::Join(_) => "join",
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
