//! Sandboxed execution of untrusted guest programs.
//!
//! Policy programs print a verdict, update programs print the next history
//! document. Both are WASI command modules started through `_start` with
//! argv `(program, request_json, history_json)` and run under fuel, epoch
//! and memory limits in a store that lives for exactly one call.

pub mod cache;
pub mod errors;
pub mod guard;
pub mod limits;
pub mod metrics;
pub mod policy;
pub mod sandbox;
pub mod update;

pub use cache::{module_hash, ModuleCache, ModuleHandle};
pub use errors::{SandboxError, SandboxResult};
pub use limits::SandboxLimits;
pub use policy::{parse_verdict, Decision, PolicyRunner, WasmPolicyRunner};
pub use sandbox::{ProgramOutput, SandboxHost};
pub use update::{UpdateRunner, WasmUpdateRunner};
