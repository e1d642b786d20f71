//! histguard service library
//!
//! Exposes the application wiring for the binary and integration tests.

pub mod app;
pub mod config;
pub mod metrics;
pub mod resources;

pub use app::App;
pub use config::{load_config, HistguardConfig};
