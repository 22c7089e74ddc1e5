//! permd - permissions and groups authorization engine
//!
//! Decides whether a user holds a permission by flattening their own nodes
//! and every group they inherit into a cached, per-context view.

pub mod cache;
pub mod commands;
pub mod engine;
pub mod export;
pub mod holder;
pub mod inheritance;
pub mod listener;
pub mod managers;
pub mod node;
pub mod storage;
pub mod tasks;
pub mod track;

use std::path::Path;

use anyhow::{bail, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

pub use engine::{Engine, EngineError};

/// Which storage backend to open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite database file. None = in-memory
    pub path: Option<String>,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server name this host answers permission checks for
    pub server: String,
    pub default_group: String,
    /// Whether `a.b.*` nodes grant `a.b.c`
    pub apply_wildcards: bool,
    pub storage: StorageConfig,
    pub storage_timeout_ms: u64,
    /// 0 disables the expiry audit task
    pub expiry_check_interval_secs: u64,
    /// 0 disables the storage sync task
    pub sync_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: node::GLOBAL.to_string(),
            default_group: "default".to_string(),
            apply_wildcards: true,
            storage: StorageConfig::default(),
            storage_timeout_ms: 5000,
            expiry_check_interval_secs: 60,
            sync_interval_secs: 0,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `PERMD_` environment
    /// variables (`__` separates nested keys, e.g. `PERMD_STORAGE__PATH`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("PERMD_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        engine::validate_name(&self.default_group)?;
        if self.storage_timeout_ms == 0 {
            bail!("storage_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}
