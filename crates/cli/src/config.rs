//! Client configuration
//!
//! Precedence: CLI flag / environment (clap) > `<data_dir>/config.toml` > defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use dispatchsim_transport::DeliveryMode;
use serde::Deserialize;

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_WS_URL: &str = "ws://localhost:5000/ws";
pub const DEFAULT_TRAINEE: &str = "default";
/// How long a new call rings before it is picked up.
pub const DEFAULT_PICKUP_DELAY_MS: u64 = 3000;

/// Optional keys from `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub mode: Option<DeliveryMode>,
    pub trainee_id: Option<String>,
    pub auth_token: Option<String>,
    pub pickup_delay_ms: Option<u64>,
}

/// Values given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub mode: Option<DeliveryMode>,
    pub trainee_id: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_url: String,
    pub ws_url: String,
    pub mode: DeliveryMode,
    pub trainee_id: String,
    pub auth_token: Option<String>,
    pub pickup_delay: Duration,
}

impl ClientConfig {
    pub fn resolve(overrides: Overrides, file: FileConfig) -> Self {
        Self {
            api_url: overrides
                .api_url
                .or(file.api_url)
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            ws_url: overrides
                .ws_url
                .or(file.ws_url)
                .unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            mode: overrides.mode.or(file.mode).unwrap_or_default(),
            trainee_id: overrides
                .trainee_id
                .or(file.trainee_id)
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TRAINEE.to_string()),
            auth_token: overrides.auth_token.or(file.auth_token),
            pickup_delay: Duration::from_millis(
                file.pickup_delay_ms.unwrap_or(DEFAULT_PICKUP_DELAY_MS),
            ),
        }
    }
}

/// Read `config.toml`; a missing file is an empty config.
pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}
