use std::{
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{engine::resolve_yt_dlp_bin, error::AppError, models::DownloadPreferences};

pub const ENV_YT_DLP_BIN: &str = "MEDIA_DL_YT_DLP_BIN";
pub const ENV_DOWNLOAD_DIR: &str = "MEDIA_DL_DOWNLOAD_DIR";

const DEFAULT_DIALOG_RESET_DELAY_MS: u64 = 300;
const DEFAULT_OPERATION_LOG_CAPACITY: usize = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub yt_dlp_bin: PathBuf,
    pub download_dir: PathBuf,
    /// Upper bound for a metadata probe. `None` or zero disables the guard.
    pub probe_timeout_secs: Option<u64>,
    pub dialog_reset_delay_ms: u64,
    pub operation_log_capacity: usize,
    pub preferences: DownloadPreferences,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            yt_dlp_bin: PathBuf::from("yt-dlp"),
            download_dir: PathBuf::from("downloads"),
            probe_timeout_secs: None,
            dialog_reset_delay_ms: DEFAULT_DIALOG_RESET_DELAY_MS,
            operation_log_capacity: DEFAULT_OPERATION_LOG_CAPACITY,
            preferences: DownloadPreferences::default(),
        }
    }
}

impl Settings {
    pub fn with_defaults(base_dir: &Path) -> Self {
        Self {
            yt_dlp_bin: resolve_yt_dlp_bin(base_dir),
            download_dir: resolve_default_download_dir(base_dir),
            ..Self::default()
        }
    }

    /// Reads `path` when it exists. Fields missing from the file keep the
    /// values resolved for `base_dir`.
    pub fn load_or_default(path: &Path, base_dir: &Path) -> Result<Self> {
        let defaults = Self::with_defaults(base_dir);
        if !path.exists() {
            debug!(path = %path.display(), "settings file not found, using defaults");
            return Ok(defaults);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read settings file {}", path.display()))?;
        let mut value: serde_json::Value = serde_json::to_value(&defaults)?;
        let overrides: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse settings file {}", path.display()))?;
        merge_json(&mut value, overrides);
        let settings = serde_json::from_value(value)
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("write settings file {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bin) = lookup(ENV_YT_DLP_BIN).filter(|v| !v.trim().is_empty()) {
            self.yt_dlp_bin = PathBuf::from(bin.trim());
        }
        if let Some(dir) = lookup(ENV_DOWNLOAD_DIR).filter(|v| !v.trim().is_empty()) {
            self.download_dir = PathBuf::from(dir.trim());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.yt_dlp_bin.as_os_str().is_empty() {
            return Err(AppError::InvalidInput("yt_dlp_bin must not be empty".to_string()).into());
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(
                AppError::InvalidInput("download_dir must not be empty".to_string()).into(),
            );
        }
        if self.operation_log_capacity == 0 {
            return Err(AppError::InvalidInput(
                "operation_log_capacity must be a positive integer".to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Option<Duration> {
        self.probe_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn dialog_reset_delay(&self) -> Duration {
        Duration::from_millis(self.dialog_reset_delay_ms)
    }
}

fn resolve_default_download_dir(base_dir: &Path) -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| base_dir.join("downloads"))
}

fn merge_json(base: &mut serde_json::Value, overrides: serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Source of the default preferences shown on the Configure page. Callers
/// take a snapshot at the moment of use and never hold on to the store.
pub trait PreferencesStore: Send + Sync {
    fn snapshot(&self) -> DownloadPreferences;
}

#[derive(Debug, Default)]
pub struct SharedPreferences {
    inner: RwLock<DownloadPreferences>,
}

impl SharedPreferences {
    pub fn new(initial: DownloadPreferences) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut DownloadPreferences),
    {
        let mut guard = self.inner.write().expect("preferences lock poisoned");
        f(&mut guard);
    }
}

impl PreferencesStore for SharedPreferences {
    fn snapshot(&self) -> DownloadPreferences {
        self.inner.read().expect("preferences lock poisoned").clone()
    }
}
