//! Layered configuration: defaults, then the YAML file at `APICALL_CONFIG`,
//! then row overrides from the `config` table applied at startup.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, Result};

pub const CONFIG_ENV_VAR: &str = "APICALL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/apicall/apicall.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub api_bind_addr: SocketAddr,
    pub fastagi_bind_addr: SocketAddr,
    pub max_cps: u32,
    pub max_channels: u32,
    pub max_per_trunk: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            api_bind_addr: "0.0.0.0:8088".parse().unwrap(),
            fastagi_bind_addr: "0.0.0.0:4573".parse().unwrap(),
            max_cps: 10,
            max_channels: 60,
            max_per_trunk: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: "apicall".to_string(),
            secret: "changeme".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite://apicall.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub sweeper_tick_secs: u64,
    pub reaper_tick_secs: u64,
    pub reaper_horizon_secs: i64,
    pub reaper_hard_ceiling_secs: i64,
    pub ivr_digit_grace_secs: u64,
    pub sweeper_batch_cap: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sweeper_tick_secs: 5,
            reaper_tick_secs: 120,
            reaper_horizon_secs: 600,
            reaper_hard_ceiling_secs: 3600,
            ivr_digit_grace_secs: 3,
            sweeper_batch_cap: 100,
        }
    }
}

impl TimingConfig {
    pub fn sweeper_tick(&self) -> Duration {
        Duration::from_secs(self.sweeper_tick_secs)
    }

    pub fn reaper_tick(&self) -> Duration {
        Duration::from_secs(self.reaper_tick_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ApicallConfig {
    pub general: GeneralConfig,
    pub switch: SwitchConfig,
    pub database: DatabaseConfig,
    pub timing: TimingConfig,
}

impl ApicallConfig {
    /// Resolves the config file path from `APICALL_CONFIG`, falling back to
    /// the documented default, and loads it. Missing file is not an error —
    /// we fall back to built-in defaults the way a fresh install would.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using built-in defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Configuration(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| EngineError::Configuration(format!("parsing {}: {e}", path.display())))
    }

    /// Applies `key`/`value` overrides sourced from the `config` table,
    /// which win over file defaults at startup.
    pub fn apply_override(&mut self, key: &str, value: &str) {
        match key {
            "max_cps" => {
                if let Ok(v) = value.parse() {
                    self.general.max_cps = v;
                }
            }
            "max_channels" => {
                if let Ok(v) = value.parse() {
                    self.general.max_channels = v;
                }
            }
            "max_per_trunk" => {
                if let Ok(v) = value.parse() {
                    self.general.max_per_trunk = v;
                }
            }
            other => tracing::debug!(key = other, "ignoring unknown config override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ApicallConfig::load_from(Path::new("/nonexistent/apicall.yaml")).unwrap();
        assert_eq!(cfg.general.max_cps, 10);
    }

    #[test]
    fn override_wins_over_default() {
        let mut cfg = ApicallConfig::default();
        cfg.apply_override("max_cps", "25");
        assert_eq!(cfg.general.max_cps, 25);
    }
}
