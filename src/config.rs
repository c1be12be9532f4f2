//! Relay configuration: a JSON file created on first start, plus environment
//! overrides.

use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "TUYA_RELAY_CONFIG";
pub const SITE_NAME_ENV: &str = "TUYA_RELAY_SITE_NAME";
pub const BIND_ENV: &str = "TUYA_RELAY_BIND";

const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_SITE_NAME: &str = "UNKNOWN_SITE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("environment variable {name} has an invalid value: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Label reported by /health and prefixed to command logs
    pub site_name: String,
    pub bind: SocketAddr,
    pub scan_timeout_secs: u64,
    /// Per connect/read/write timeout for device commands
    pub command_timeout_secs: u64,
    /// Upper bound on a whole /tuya/command request
    pub request_timeout_secs: u64,
    pub max_concurrent_commands: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_name: DEFAULT_SITE_NAME.to_string(),
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            scan_timeout_secs: 10,
            command_timeout_secs: 5,
            request_timeout_secs: 45,
            max_concurrent_commands: 8,
        }
    }
}

impl Config {
    /// `$TUYA_RELAY_CONFIG`, falling back to `./config.json`.
    pub fn default_path() -> PathBuf {
        env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Loads `path`, writing a default file first if none exists.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            info!(
                "[OK] {} created with site_name = {}",
                path.display(),
                config.site_name
            );
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }

    /// Applies `TUYA_RELAY_SITE_NAME` and `TUYA_RELAY_BIND`.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(env::var(SITE_NAME_ENV).ok(), env::var(BIND_ENV).ok())
    }

    fn apply_overrides(
        mut self,
        site_name: Option<String>,
        bind: Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(site) = site_name.filter(|s| !s.trim().is_empty()) {
            self.site_name = site;
        }
        if let Some(bind) = bind {
            self.bind = bind.parse().map_err(|_| ConfigError::InvalidEnv {
                name: BIND_ENV,
                value: bind.clone(),
            })?;
        }
        Ok(self)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["site_name"], DEFAULT_SITE_NAME);
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"site_name": "LOJA_01", "unknown": true}"#).unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.site_name, "LOJA_01");
        assert_eq!(config.bind, Config::default().bind);
        assert_eq!(config.request_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn broken_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ site_name: ").unwrap();

        assert!(matches!(
            Config::load_or_create(&path),
            Err(ConfigError::Json { .. })
        ));
    }

    #[test]
    fn overrides_replace_site_and_bind() {
        let config = Config::default()
            .apply_overrides(Some("KIOSK".into()), Some("127.0.0.1:9000".into()))
            .unwrap();
        assert_eq!(config.site_name, "KIOSK");
        assert_eq!(config.bind, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());

        let blank = Config::default()
            .apply_overrides(Some("  ".into()), None)
            .unwrap();
        assert_eq!(blank.site_name, DEFAULT_SITE_NAME);

        assert!(matches!(
            Config::default().apply_overrides(None, Some("nope".into())),
            Err(ConfigError::InvalidEnv { .. })
        ));
    }
}
