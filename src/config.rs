//! Configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which engine answers catalog queries and duration lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CatalogBackendKind {
    #[default]
    Sqlite,
    JsonRpc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub backend: CatalogBackendKind,
    /// MyVideos database file, or the directory holding several versions
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default)]
    pub rpc_username: String,
    #[serde(default)]
    pub rpc_password: String,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// Where bare smart playlist names are looked up
    #[serde(default)]
    pub smart_playlist_dir: Option<PathBuf>,
}

fn default_rpc_url() -> String { "http://localhost:8080/jsonrpc".to_string() }
fn default_rpc_timeout() -> u64 { 30 }

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            backend: CatalogBackendKind::Sqlite,
            database: None,
            rpc_url: default_rpc_url(),
            rpc_username: String::new(),
            rpc_password: String::new(),
            rpc_timeout_secs: 30,
            smart_playlist_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local state: instance id, duration cache, logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Shared folder for channels.json and the emitted files. Defaults to data_dir.
    #[serde(default)]
    pub shared_dir: Option<PathBuf>,
    #[serde(default = "default_max_hours")]
    pub max_playlist_hours: u64,
    #[serde(default = "default_max_items")]
    pub max_playlist_items: usize,
    #[serde(default = "default_true")]
    pub auto_regen: bool,
    #[serde(default = "default_interval")]
    pub auto_regen_interval_minutes: u64,
    #[serde(default = "default_threshold")]
    pub auto_regen_threshold_hours: u64,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,
    #[serde(default = "default_rescan_days")]
    pub rescan_days: u64,
    #[serde(default = "default_group_title")]
    pub group_title: String,
    #[serde(default)]
    pub compress_guide: bool,
}

fn default_data_dir() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("linearcast");
    path
}
fn default_max_hours() -> u64 { 24 }
fn default_max_items() -> usize { 1000 }
fn default_true() -> bool { true }
fn default_interval() -> u64 { 60 }
fn default_threshold() -> u64 { 12 }
fn default_ffprobe() -> String { "ffprobe".to_string() }
fn default_rescan_days() -> u64 { 7 }
fn default_group_title() -> String { "linearcast".to_string() }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            shared_dir: None,
            max_playlist_hours: 24,
            max_playlist_items: 1000,
            auto_regen: true,
            auto_regen_interval_minutes: 60,
            auto_regen_threshold_hours: 12,
            catalog: CatalogConfig::default(),
            ffprobe_path: default_ffprobe(),
            rescan_days: 7,
            group_title: default_group_title(),
            compress_guide: false,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("linearcast");
        path.push("config.json");
        path
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| Error::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_playlist_hours == 0 {
            return Err(Error::Config("max_playlist_hours must be at least 1".into()));
        }
        if self.max_playlist_items == 0 {
            return Err(Error::Config("max_playlist_items must be at least 1".into()));
        }
        if self.auto_regen_interval_minutes == 0 {
            return Err(Error::Config("auto_regen_interval_minutes must be at least 1".into()));
        }
        if self.catalog.backend == CatalogBackendKind::JsonRpc && self.catalog.rpc_url.trim().is_empty() {
            return Err(Error::Config("catalog.rpc_url is required for the jsonrpc backend".into()));
        }
        Ok(())
    }

    pub fn shared_dir(&self) -> &Path {
        self.shared_dir.as_deref().unwrap_or(&self.data_dir)
    }

    pub fn max_duration_secs(&self) -> u64 {
        self.max_playlist_hours * 3600
    }

    pub fn regen_interval(&self) -> Duration {
        Duration::from_secs(self.auto_regen_interval_minutes * 60)
    }

    pub fn regen_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.auto_regen_threshold_hours as i64)
    }
}
