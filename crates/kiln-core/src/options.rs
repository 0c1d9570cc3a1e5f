//! Server configuration, loaded from environment variables or built in code.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Model lifecycle policy for the repository manager.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ControlMode {
    /// Load every discovered model at startup; never change afterwards.
    None,
    /// Load at startup and rescan the repository on a fixed interval.
    Poll,
    /// Load and unload only through explicit calls.
    Explicit,
}

/// Runtime configuration for a [`Server`](crate::server::Server).
///
/// Every field has a default so a server works out-of-the-box against a
/// single repository path.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Filesystem roots scanned for model directories.
    pub model_repository_paths: Vec<PathBuf>,

    /// Lifecycle policy (default: [`ControlMode::None`]).
    pub model_control_mode: ControlMode,

    /// Models loaded at startup in [`ControlMode::Explicit`]; also the set
    /// whose readiness gates `is_ready` under [`Self::strict_readiness`].
    pub startup_models: BTreeSet<String>,

    /// Reject models with a missing or invalid `config.pbtxt` instead of
    /// auto-generating a minimal one.
    pub strict_model_config: bool,

    /// Report ready only when every startup model is ready.
    pub strict_readiness: bool,

    /// How long `stop` waits for in-flight requests and model drains.
    pub exit_timeout: Duration,

    /// Byte budget of the shared pinned host-memory pool.
    pub pinned_memory_pool_size: u64,

    /// Byte budget per device-memory pool, keyed by device index.
    pub cuda_memory_pool_sizes: BTreeMap<u32, u64>,

    /// Minimum compute capability a device must report to host a pool.
    pub min_supported_compute_capability: f64,

    /// Rescan interval in [`ControlMode::Poll`].
    pub repository_poll_interval: Duration,

    /// `tracing` filter string, e.g. `"info"` or `"debug,kiln_core=trace"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            model_repository_paths: Vec::new(),
            model_control_mode: ControlMode::None,
            startup_models: BTreeSet::new(),
            strict_model_config: false,
            strict_readiness: true,
            exit_timeout: Duration::from_secs(30),
            pinned_memory_pool_size: 256 << 20,
            cuda_memory_pool_sizes: BTreeMap::new(),
            min_supported_compute_capability: 0.0,
            repository_poll_interval: Duration::from_secs(15),
            log_level: "info".to_owned(),
            log_json: false,
        }
    }
}

impl ServerOptions {
    /// Build [`ServerOptions`] from `KILN_*` environment variables, falling
    /// back to defaults.
    ///
    /// Recognized variables:
    /// - `KILN_MODEL_REPOSITORY` – comma-separated repository roots
    /// - `KILN_MODEL_CONTROL_MODE` – `none`, `poll`, or `explicit`
    /// - `KILN_STARTUP_MODELS` – comma-separated model names
    /// - `KILN_STRICT_MODEL_CONFIG`, `KILN_STRICT_READINESS` – booleans
    /// - `KILN_EXIT_TIMEOUT_SECS`, `KILN_POLL_INTERVAL_SECS` – seconds
    /// - `KILN_PINNED_MEMORY_POOL_BYTES` – bytes
    /// - `KILN_CUDA_MEMORY_POOL_BYTES` – `device:bytes` pairs, comma-separated
    /// - `KILN_MIN_COMPUTE_CAPABILITY` – e.g. `6.0`
    /// - `KILN_LOG`, `KILN_LOG_JSON` – tracing filter and JSON toggle
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model_repository_paths: list_env("KILN_MODEL_REPOSITORY")
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            model_control_mode: std::env::var("KILN_MODEL_CONTROL_MODE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.model_control_mode),
            startup_models: list_env("KILN_STARTUP_MODELS").into_iter().collect(),
            strict_model_config: bool_env("KILN_STRICT_MODEL_CONFIG", defaults.strict_model_config),
            strict_readiness: bool_env("KILN_STRICT_READINESS", defaults.strict_readiness),
            exit_timeout: Duration::from_secs(parse_env("KILN_EXIT_TIMEOUT_SECS", 30)),
            pinned_memory_pool_size: parse_env(
                "KILN_PINNED_MEMORY_POOL_BYTES",
                defaults.pinned_memory_pool_size,
            ),
            cuda_memory_pool_sizes: device_map_env("KILN_CUDA_MEMORY_POOL_BYTES"),
            min_supported_compute_capability: parse_env(
                "KILN_MIN_COMPUTE_CAPABILITY",
                defaults.min_supported_compute_capability,
            ),
            repository_poll_interval: Duration::from_secs(parse_env(
                "KILN_POLL_INTERVAL_SECS",
                15,
            )),
            log_level: env_or("KILN_LOG", &defaults.log_level),
            log_json: bool_env("KILN_LOG_JSON", defaults.log_json),
        }
    }

    /// Sanity-check the options before a server starts.
    pub fn validate(&self) -> Result<(), Error> {
        if self.model_repository_paths.is_empty() {
            return Err(Error::InvalidArg(
                "at least one model repository path is required".into(),
            ));
        }
        if self.model_control_mode == ControlMode::Poll
            && self.repository_poll_interval.is_zero()
        {
            return Err(Error::InvalidArg(
                "repository_poll_interval must be > 0 in poll mode".into(),
            ));
        }
        Ok(())
    }

    /// Add a repository root (chainable).
    pub fn with_repository(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_repository_paths.push(path.into());
        self
    }

    /// Set the control mode (chainable).
    pub fn with_control_mode(mut self, mode: ControlMode) -> Self {
        self.model_control_mode = mode;
        self
    }

    /// Add a startup model (chainable).
    pub fn with_startup_model(mut self, name: impl Into<String>) -> Self {
        self.startup_models.insert(name.into());
        self
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn list_env(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn device_map_env(key: &str) -> BTreeMap<u32, u64> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .filter_map(|pair| {
                    let (device, bytes) = pair.split_once(':')?;
                    Some((
                        device.trim().parse().ok()?,
                        bytes.trim().parse().ok()?,
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}
