//! Runtime configuration: YAML file plus `HISTGUARD_*` environment overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use digest_store::FirstUsePolicy;
use histguard_history::IntegrityMode;
use policy_sandbox::SandboxLimits;
use serde::Deserialize;
use stateful_adapter::ValidatorSettings;
use tracing::{info, warn};

pub const ENV_INTEGRITY_CHECK: &str = "HISTGUARD_INTEGRITY_CHECK";
pub const ENV_FIRST_USE: &str = "HISTGUARD_FIRST_USE";
pub const ENV_LISTEN: &str = "HISTGUARD_LISTEN";

const LOCAL_CONFIG: &str = "config/histguard.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistguardConfig {
    pub listen: SocketAddr,
    pub realm: String,
    pub integrity: IntegrityConfig,
    pub sandbox: SandboxLimits,
    /// Timeout for fetching policy modules at registration.
    pub fetch_timeout_ms: u64,
    pub clients: Vec<ClientSeed>,
    pub tokens: Vec<TokenSeed>,
}

impl Default for HistguardConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            realm: ValidatorSettings::default().realm,
            integrity: IntegrityConfig::default(),
            sandbox: SandboxLimits::default(),
            fetch_timeout_ms: 5_000,
            clients: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub mode: IntegrityMode,
    pub first_use: FirstUsePolicy,
    pub update_methods: Vec<String>,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            mode: IntegrityMode::default(),
            first_use: FirstUsePolicy::default(),
            update_methods: ValidatorSettings::default().update_methods,
        }
    }
}

/// Client registered at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientSeed {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub policy_endpoint: Option<String>,
    pub policy_hashes: Vec<String>,
    /// Module files (binary or text format) registered as direct uploads.
    pub policy_files: Vec<PathBuf>,
    pub update_program_file: Option<PathBuf>,
    pub hmac_key_hex: Option<String>,
}

/// Token record preloaded into the in-memory token store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenSeed {
    pub access_token: String,
    pub client_id: String,
    pub user_id: Option<String>,
    pub scope: String,
    pub policy: Option<String>,
    /// Binds the token to the hash of this module file instead of `policy`.
    pub policy_file: Option<PathBuf>,
    /// Seconds; zero never expires.
    pub expires_in: i64,
}

impl HistguardConfig {
    pub fn validator_settings(&self) -> ValidatorSettings {
        ValidatorSettings {
            realm: self.realm.clone(),
            update_methods: self.integrity.update_methods.clone(),
        }
    }

    /// Relative seed paths resolve against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        for client in &mut self.clients {
            client.policy_files.iter_mut().for_each(resolve);
            if let Some(path) = client.update_program_file.as_mut() {
                resolve(path);
            }
        }
        for token in &mut self.tokens {
            if let Some(path) = token.policy_file.as_mut() {
                resolve(path);
            }
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_INTEGRITY_CHECK) {
            self.integrity.mode = raw
                .parse()
                .map_err(|err| anyhow!("invalid {ENV_INTEGRITY_CHECK}: {err}"))?;
            info!(mode = %self.integrity.mode, "integrity mode from environment");
        }
        if let Some(raw) = lookup(ENV_FIRST_USE) {
            self.integrity.first_use = raw
                .parse()
                .map_err(|err| anyhow!("invalid {ENV_FIRST_USE}: {err}"))?;
        }
        if let Some(raw) = lookup(ENV_LISTEN) {
            self.listen = raw
                .parse()
                .with_context(|| format!("invalid {ENV_LISTEN} `{raw}`"))?;
        }
        Ok(())
    }
}

/// `--config`, else `config/histguard.yaml`, else the user config dir, else
/// defaults. Environment overrides apply last.
pub fn load_config(explicit: Option<&Path>) -> Result<HistguardConfig> {
    let candidate = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_locations().into_iter().find(|path| path.exists()),
    };

    let mut config = match candidate {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let mut config: HistguardConfig = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?;
            if let Some(base) = path.parent() {
                config.resolve_paths(base);
            }
            info!(path = %path.display(), "loaded configuration");
            config
        }
        None => {
            warn!("no configuration file found, using defaults");
            HistguardConfig::default()
        }
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn default_locations() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
    if let Some(mut dir) = dirs::config_dir() {
        dir.push("histguard");
        dir.push("config.yaml");
        paths.push(dir);
    }
    paths
}
