//! Runtime configuration.
//!
//! Defaults are overridden by an optional JSON file (`WATER_ADMIN_CONFIG`)
//! and then by `WATER_ADMIN_*` environment variables.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::counter::LOCAL_STORAGE_FILE;
use crate::error::{SyncError, SyncResult};
use crate::queue::DEFAULT_SYNC_TAG;
use crate::replay::{RetryPolicy, MAX_ATTEMPTS};

pub const ENV_PREFIX: &str = "WATER_ADMIN_";
pub const CONFIG_FILE_ENV: &str = "WATER_ADMIN_CONFIG";

const APP_DIR_NAME: &str = "com.wateradmin.offline";
const MIN_BANNER_SECS: u64 = 3;
const MAX_BANNER_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub api_base_url: String,
    pub max_attempts: u32,
    pub sync_tag: String,
    pub monitor_interval_secs: u64,
    pub banner_secs: u64,
    pub retry_policy: RetryPolicy,
    pub request_timeout_secs: Option<u64>,
    pub health_path: String,
    pub background_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_base_url: "http://localhost:3000".to_string(),
            max_attempts: MAX_ATTEMPTS,
            sync_tag: DEFAULT_SYNC_TAG.to_string(),
            monitor_interval_secs: 15,
            banner_secs: 4,
            retry_policy: RetryPolicy::Uniform,
            request_timeout_secs: None,
            health_path: "/api/health".to_string(),
            background_sync: true,
        }
    }
}

/// Per-user data directory, same lookup order as the desktop app.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> SyncResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| SyncError::Config(format!("{ENV_PREFIX}{name}={raw:?}: {e}")))
}

impl SyncConfig {
    /// Defaults, then the optional config file, then the environment.
    pub fn load() -> SyncResult<Self> {
        let base = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        base.with_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    pub fn from_env() -> SyncResult<Self> {
        Self::default().with_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        config.validated()
    }

    /// Apply overrides looked up by unprefixed variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("API_BASE_URL") {
            self.api_base_url = v.trim().to_string();
        }
        if let Some(v) = lookup("MAX_ATTEMPTS") {
            self.max_attempts = parse_var("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("SYNC_TAG") {
            self.sync_tag = v.trim().to_string();
        }
        if let Some(v) = lookup("MONITOR_INTERVAL_SECS") {
            self.monitor_interval_secs = parse_var("MONITOR_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("BANNER_SECS") {
            self.banner_secs = parse_var("BANNER_SECS", &v)?;
        }
        if let Some(v) = lookup("RETRY_POLICY") {
            self.retry_policy = v.parse()?;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = match v.trim() {
                "" | "0" => None,
                raw => Some(parse_var("REQUEST_TIMEOUT_SECS", raw)?),
            };
        }
        if let Some(v) = lookup("HEALTH_PATH") {
            self.health_path = v.trim().to_string();
        }
        if let Some(v) = lookup("BACKGROUND_SYNC") {
            self.background_sync = parse_var("BACKGROUND_SYNC", &v.to_ascii_lowercase())?;
        }
        self.validated()
    }

    fn validated(mut self) -> SyncResult<Self> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        if self.monitor_interval_secs == 0 {
            return Err(SyncError::Config("monitor_interval_secs must be at least 1".into()));
        }
        if self.sync_tag.is_empty() {
            return Err(SyncError::Config("sync_tag must not be empty".into()));
        }
        if self.api_base_url.is_empty() {
            return Err(SyncError::Config("api_base_url must not be empty".into()));
        }
        self.banner_secs = self.banner_secs.clamp(MIN_BANNER_SECS, MAX_BANNER_SECS);
        Ok(self)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn local_storage_path(&self) -> PathBuf {
        self.data_dir.join(LOCAL_STORAGE_FILE)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn banner_duration(&self) -> Duration {
        Duration::from_secs(self.banner_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
