//! Relay configuration
//!
//! A single JSON file plus two environment fallbacks: `SHELLGATE_MASTER_KEY`
//! for the vault key and `SHELLGATE_AUTH_TOKEN` for the static gateway token.
//! Timeouts default to the values the pool and gateway were tuned for;
//! deployments usually only set the bind address and the inventory path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::ResourceRecord;
use crate::pool::PoolConfig;
use crate::vault::{CredentialRecord, CryptoError, MasterKey};

pub const MASTER_KEY_ENV: &str = "SHELLGATE_MASTER_KEY";
pub const AUTH_TOKEN_ENV: &str = "SHELLGATE_AUTH_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("no master key: set `master_key` or {MASTER_KEY_ENV}")]
    MissingMasterKey,

    #[error("invalid master key: {0}")]
    InvalidMasterKey(#[from] CryptoError),

    #[error("no auth token: set `auth_token` or {AUTH_TOKEN_ENV}")]
    MissingAuthToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Connect + authenticate budget per channel open (seconds).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Idle pooled channels older than this are closed (seconds).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Sweep cadence for idle eviction (seconds).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Base64-encoded 32-byte vault key. Env fallback: `SHELLGATE_MASTER_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,

    /// Bearer token the gateway accepts. Env fallback: `SHELLGATE_AUTH_TOKEN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Inventory file with resources and sealed credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_path: Option<PathBuf>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8022".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    10 * 60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            master_key: None,
            auth_token: None,
            inventory_path: None,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }

    /// Resolve the vault key from config or environment.
    pub fn master_key(&self) -> Result<MasterKey, ConfigError> {
        let encoded = match &self.master_key {
            Some(encoded) => encoded.clone(),
            None => std::env::var(MASTER_KEY_ENV)
                .map_err(|_| ConfigError::MissingMasterKey)?,
        };
        Ok(MasterKey::from_base64(&encoded)?)
    }

    /// Resolve the gateway bearer token from config or environment.
    pub fn auth_token(&self) -> Result<String, ConfigError> {
        match &self.auth_token {
            Some(token) => Ok(token.clone()),
            None => std::env::var(AUTH_TOKEN_ENV).map_err(|_| ConfigError::MissingAuthToken),
        }
    }
}

/// The inventory file the standalone binary serves from: resources plus
/// sealed credentials, both maintained by external tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
    #[serde(default)]
    pub credentials: Vec<CredentialRecord>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_to_sparse_config() {
        let config: RelayConfig = serde_json::from_str(r#"{"bind_addr":"0.0.0.0:9000"}"#).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.idle_timeout_secs, 600);
        assert_eq!(config.pool_config().connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn inventory_roundtrips_through_file() {
        let inventory = r#"{
            "resources": [
                {"id": 1, "resource_type": "server", "name": "web-1", "host": "10.0.0.5"}
            ],
            "credentials": []
        }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(inventory.as_bytes()).unwrap();

        let loaded = Inventory::load(file.path()).unwrap();
        assert_eq!(loaded.resources.len(), 1);
        assert_eq!(loaded.resources[0].port, 22);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            RelayConfig::load(Path::new("/nonexistent/shellgate.json")),
            Err(ConfigError::Io(_, _))
        ));
    }
}
