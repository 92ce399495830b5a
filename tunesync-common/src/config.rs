//! Configuration loading and root folder resolution
//!
//! Resolution priority for every value: environment variable, then TOML
//! config file, then compiled default. The TOML file lives at
//! `~/.config/tunesync/config.toml` (or `/etc/tunesync/config.toml` on
//! Linux system installs).

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// On-disk TOML configuration. Every field optional; unset fields fall
/// back to env vars and then compiled defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub root_folder: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub storage_endpoint: Option<String>,
    pub storage_public_base: Option<String>,
    pub provider_api_base: Option<String>,
    pub provider_api_key: Option<String>,
}

impl TomlConfig {
    /// Parse a TOML config file. Missing file is not an error; malformed
    /// TOML is.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root folder holding the database and any scratch files
    pub root_folder: PathBuf,
    /// HTTP bind host
    pub host: String,
    /// HTTP bind port
    pub port: u16,
    /// Durable storage upload endpoint (PUT target base)
    pub storage_endpoint: String,
    /// Public URL prefix of durable storage; URLs under this prefix are
    /// treated as higher quality than raw provider URLs and never replaced
    pub storage_public_base: String,
    /// Provider API base URL for pull-based task queries
    pub provider_api_base: String,
    /// Provider API key
    pub provider_api_key: Option<String>,
}

impl ServiceConfig {
    /// Resolve configuration: env overrides, TOML file, compiled defaults.
    pub fn resolve(module_name: &str) -> Result<Self> {
        let toml_config = match config_file_path() {
            Some(path) => {
                let cfg = TomlConfig::load(&path)?;
                if path.exists() {
                    info!("Loaded config file: {}", path.display());
                }
                cfg
            }
            None => {
                warn!("Could not determine config directory; using defaults");
                TomlConfig::default()
            }
        };

        let root_folder = resolve_root_folder(module_name, &toml_config);

        let host = env_or("TUNESYNC_HOST", toml_config.host.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = match std::env::var("TUNESYNC_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("Invalid TUNESYNC_PORT: {raw}")))?,
            Err(_) => toml_config.port.unwrap_or(5740),
        };

        let storage_endpoint = env_or("TUNESYNC_STORAGE_ENDPOINT", toml_config.storage_endpoint)
            .unwrap_or_else(|| "http://127.0.0.1:9000/tunesync-media".to_string());
        let storage_public_base =
            env_or("TUNESYNC_STORAGE_PUBLIC_BASE", toml_config.storage_public_base)
                .unwrap_or_else(|| storage_endpoint.clone());

        let provider_api_base = env_or("TUNESYNC_PROVIDER_API_BASE", toml_config.provider_api_base)
            .unwrap_or_else(|| "https://api.musegen.example".to_string());
        let provider_api_key = env_or("TUNESYNC_PROVIDER_API_KEY", toml_config.provider_api_key);

        Ok(Self {
            root_folder,
            host,
            port,
            storage_endpoint,
            storage_public_base,
            provider_api_base,
            provider_api_key,
        })
    }

    /// Database file path inside the root folder.
    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join("tunesync.db")
    }

    /// Create the root folder if missing.
    pub fn ensure_root_folder(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }
}

fn env_or(var: &str, fallback: Option<String>) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty()).or(fallback)
}

/// Root folder priority: TUNESYNC_ROOT env, TOML `root_folder`, then the
/// OS data directory default.
fn resolve_root_folder(module_name: &str, toml_config: &TomlConfig) -> PathBuf {
    if let Ok(path) = std::env::var("TUNESYNC_ROOT") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return PathBuf::from(path);
    }

    default_root_folder(module_name)
}

/// OS-dependent compiled default root folder.
fn default_root_folder(module_name: &str) -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("tunesync").join(module_name))
        .unwrap_or_else(|| PathBuf::from(".").join("tunesync-data").join(module_name))
}

/// Config file location: user config dir first, then /etc on Linux.
fn config_file_path() -> Option<PathBuf> {
    if let Some(path) = dirs::config_dir().map(|d| d.join("tunesync").join("config.toml")) {
        if path.exists() {
            return Some(path);
        }
        if cfg!(target_os = "linux") {
            let system = PathBuf::from("/etc/tunesync/config.toml");
            if system.exists() {
                return Some(system);
            }
        }
        // Not present anywhere; report the user path so load() falls back
        // to defaults without erroring
        return Some(path);
    }
    None
}
