use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::FixtureError;

/// Environment variable naming a JSON config file for the binary
pub const CONFIG_ENV: &str = "SIP_FIXTURE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    pub account: String,
    pub password: String,
    pub port: u16,
    pub bind_host: String,
    /// Domain the registrar accepts bindings for
    pub registrar_domain: String,
    pub default_expiry_secs: u64,
    pub test_name: String,
    pub protocol: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            account: "sip:testacc@127.0.0.1".to_string(),
            password: "testpwd".to_string(),
            port: 9090,
            bind_host: "0.0.0.0".to_string(),
            registrar_domain: "127.0.0.1".to_string(),
            default_expiry_secs: 3600,
            test_name: "sofiasip".to_string(),
            protocol: "sip".to_string(),
        }
    }
}

impl FixtureConfig {
    pub fn default_expiry(&self) -> Duration {
        Duration::from_secs(self.default_expiry_secs)
    }
}

/// Path from `SIP_FIXTURE_CONFIG`, if set
pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV).map(PathBuf::from)
}

/// Load the fixture config. A missing file yields the defaults; fields
/// absent from the file keep their default values.
pub fn load_config(path: &Path) -> Result<FixtureConfig, FixtureError> {
    if !path.exists() {
        tracing::info!("No config at {}, using defaults", path.display());
        return Ok(FixtureConfig::default());
    }

    let json = fs::read_to_string(path)
        .map_err(|e| FixtureError::Config(format!("Failed to read config file: {}", e)))?;

    let config: FixtureConfig = serde_json::from_str(&json)
        .map_err(|e| FixtureError::Config(format!("Failed to parse config file: {}", e)))?;

    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}
