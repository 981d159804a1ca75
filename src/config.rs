//! Node configuration, stored as TOML.
//!
//! On first run a default `privtxd.toml` is written to the data directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::PayloadCodec;
use crate::error::AppError;
use crate::types::PublicKey;

pub const CONFIG_FILE_NAME: &str = "privtxd.toml";

/// Platform-specific data directory.
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\privtxd
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("privtxd")
    } else {
        // Linux/Mac: ~/.privtxd
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".privtxd")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub enclave: EnclaveConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub peers: PeersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Url other nodes reach this node at. Announced in party info.
    pub url: String,
    pub listen_address: String,
    /// Seconds a client gets to deliver a complete request.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_read_timeout_secs() -> u64 {
    10
}

impl NodeConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclaveConfig {
    pub key_file: String,
    /// Environment variable holding the key file password, if the keys are locked.
    #[serde(default)]
    pub password_env: Option<String>,
    /// Base64 keys added as recipients of every standard send.
    #[serde(default)]
    pub forwarding_keys: Vec<String>,
}

impl EnclaveConfig {
    pub fn forwarding_keys(&self) -> Result<BTreeSet<PublicKey>, AppError> {
        self.forwarding_keys
            .iter()
            .map(|k| PublicKey::from_base64(k).map_err(|e| AppError::Config(e.to_string())))
            .collect()
    }

    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `sled` or `memory`
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub codec: PayloadCodec,
}

fn default_backend() -> String {
    "sled".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeersConfig {
    #[serde(default)]
    pub bootstrap: Vec<String>,
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_validations")]
    pub max_concurrent_validations: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_validation_timeout_secs() -> u64 {
    5
}

fn default_max_concurrent_validations() -> usize {
    16
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            validation_timeout_secs: default_validation_timeout_secs(),
            max_concurrent_validations: default_max_concurrent_validations(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl PeersConfig {
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `compact` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = get_data_dir();
        Self {
            node: NodeConfig {
                url: "http://127.0.0.1:9001".to_string(),
                listen_address: "0.0.0.0:9001".to_string(),
                read_timeout_secs: default_read_timeout_secs(),
            },
            enclave: EnclaveConfig {
                key_file: data_dir.join("keys.json").to_string_lossy().to_string(),
                password_env: None,
                forwarding_keys: Vec::new(),
            },
            storage: StorageConfig {
                backend: default_backend(),
                data_dir: data_dir.join("db").to_string_lossy().to_string(),
                codec: PayloadCodec::default(),
            },
            peers: PeersConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), AppError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Load `path`, or write and return the defaults if it does not exist.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            let mut config = Self::load_from_file(path)?;
            if config.storage.data_dir.is_empty() {
                config.storage.data_dir = get_data_dir().join("db").to_string_lossy().to_string();
            }
            config.validate()?;
            return Ok(config);
        }

        let config = Self::default();
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default configuration to {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.node.url.trim().is_empty() {
            return Err(AppError::Config("node.url must not be empty".to_string()));
        }
        if self.node.read_timeout_secs == 0 {
            return Err(AppError::Config(
                "node.read_timeout_secs must be positive".to_string(),
            ));
        }
        match self.storage.backend.as_str() {
            "sled" | "memory" => {}
            other => {
                return Err(AppError::Config(format!(
                    "unknown storage backend '{}'",
                    other
                )))
            }
        }
        match self.logging.format.as_str() {
            "compact" | "json" => {}
            other => {
                return Err(AppError::Config(format!(
                    "unknown log format '{}'",
                    other
                )))
            }
        }
        self.enclave.forwarding_keys()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = Config::default();
        config.peers.bootstrap = vec!["http://peer:9001".to_string()];
        config.storage.codec = PayloadCodec::Json;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(Config::load_or_create(&path).unwrap(), created);
    }

    #[test]
    fn test_optional_sections_default() {
        let toml = r#"
            [node]
            url = "http://a:9001"
            listen_address = "0.0.0.0:9001"

            [enclave]
            key_file = "keys.json"

            [storage]
            backend = "memory"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.peers, PeersConfig::default());
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.storage.codec, PayloadCodec::Bincode);
        assert_eq!(config.node.read_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.storage.backend = "postgres".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.enclave.forwarding_keys = vec!["not-a-key".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node.read_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
