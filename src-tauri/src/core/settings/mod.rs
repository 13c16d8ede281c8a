//! Host Settings
//!
//! `settings.json` in the app data directory. Loading never fails: a missing,
//! unreadable or outdated file yields normalized defaults. Writers hold an
//! advisory lock on a sibling `.lock` file and replace the file atomically.

use serde::{Deserialize, Serialize};
use specta::Type;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::fs::atomic_write_json_pretty;
use crate::core::{CoreError, CoreResult};

/// Current on-disk layout. Bump together with [`SettingsManager::upgrade`].
pub const SETTINGS_VERSION: u32 = 1;

pub const SETTINGS_FILE: &str = "settings.json";
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Window mode names accepted in settings
pub const WINDOW_MODES: &[&str] = &[
    "fullscreen_only",
    "windowed_only",
    "fullscreen_or_windowed",
    "fullscreen_or_maximized",
    "all_modes",
];

/// Per-user data directory used when the platform shell cannot provide one.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plugdock")
}

/// Host settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Type)]
#[serde(rename_all = "camelCase")]
pub struct HostSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Plugin loading settings
    #[serde(default)]
    pub plugins: PluginSettings,

    /// Template window settings
    #[serde(default)]
    pub templates: TemplateSettings,

    /// Market catalog settings
    #[serde(default)]
    pub market: MarketSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            plugins: PluginSettings::default(),
            templates: TemplateSettings::default(),
            market: MarketSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl HostSettings {
    /// Clamps numbers and replaces unknown enum strings with defaults.
    /// Hand-edited files are corrected here rather than rejected.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;

        if let Some(dir) = &self.plugins.directory {
            if dir.trim().is_empty() {
                self.plugins.directory = None;
            }
        }
        self.plugins.fuel_per_call = self
            .plugins
            .fuel_per_call
            .clamp(10_000, 10_000_000_000);
        self.plugins.max_memory_mb = self.plugins.max_memory_mb.clamp(1, 4096);

        if self.templates.shell_url.trim().is_empty() {
            self.templates.shell_url = default_shell_url();
        }
        self.templates.default_floating_percent =
            self.templates.default_floating_percent.clamp(10, 100);
        self.templates.default_window_mode = normalize_enum(
            &self.templates.default_window_mode.replace('-', "_"),
            WINDOW_MODES,
            default_window_mode(),
        );

        let base_url = self.market.base_url.trim().trim_end_matches('/').to_string();
        self.market.base_url = if base_url.starts_with("http://") || base_url.starts_with("https://")
        {
            base_url
        } else {
            default_market_url()
        };
        self.market.timeout_secs = self.market.timeout_secs.clamp(1, 120);

        self.logging.level = normalize_enum(
            &self.logging.level,
            &["trace", "debug", "info", "warn", "error"],
            default_log_level(),
        );
    }
}

fn normalize_enum(value: &str, allowed: &[&str], fallback: String) -> String {
    let lowered = value.trim().to_ascii_lowercase();
    match allowed.contains(&lowered.as_str()) {
        true => lowered,
        false => fallback,
    }
}

/// Plugin loading settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Type)]
#[serde(rename_all = "camelCase")]
pub struct PluginSettings {
    /// Directory scanned for WASM plugins (defaults to {app_data_dir}/plugins)
    #[serde(default)]
    pub directory: Option<String>,

    /// Load every discovered plugin on startup
    #[serde(default = "default_true")]
    pub autoload: bool,

    /// Fuel granted to each WASM call
    #[serde(default = "default_fuel")]
    pub fuel_per_call: u64,

    /// Linear memory cap per plugin instance
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u32,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            directory: None,
            autoload: true,
            fuel_per_call: default_fuel(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_fuel() -> u64 {
    10_000_000
}

fn default_max_memory_mb() -> u32 {
    64
}

/// Template window settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Type)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSettings {
    /// URL of the shared template shell page
    #[serde(default = "default_shell_url")]
    pub shell_url: String,

    /// Floating size used when a descriptor gives none (10-100)
    #[serde(default = "default_floating_percent")]
    pub default_floating_percent: u8,

    /// Window mode used when a descriptor gives none
    #[serde(default = "default_window_mode")]
    pub default_window_mode: String,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            shell_url: default_shell_url(),
            default_floating_percent: default_floating_percent(),
            default_window_mode: default_window_mode(),
        }
    }
}

fn default_shell_url() -> String {
    "index.html#/template".to_string()
}

fn default_floating_percent() -> u8 {
    60
}

fn default_window_mode() -> String {
    "all_modes".to_string()
}

/// Market catalog settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Type)]
#[serde(rename_all = "camelCase")]
pub struct MarketSettings {
    #[serde(default = "default_market_url")]
    pub base_url: String,

    #[serde(default = "default_market_timeout")]
    pub timeout_secs: u32,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            base_url: default_market_url(),
            timeout_secs: default_market_timeout(),
        }
    }
}

fn default_market_url() -> String {
    "https://market.plugdock.dev/api".to_string()
}

fn default_market_timeout() -> u32 {
    15
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Type)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write daily rolling log files
    #[serde(default = "default_true")]
    pub file_output: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Advisory lock on `settings.json.lock`, released on drop.
struct SettingsLock {
    file: File,
}

impl SettingsLock {
    fn acquire(path: &Path, exclusive: bool) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let locked = if exclusive {
            fs2::FileExt::lock_exclusive(&file)
        } else {
            fs2::FileExt::lock_shared(&file)
        };
        locked.map_err(|e| CoreError::Settings(format!("cannot lock {}: {}", path.display(), e)))?;
        Ok(Self { file })
    }
}

impl Drop for SettingsLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("Settings lock not released: {}", e);
        }
    }
}

/// Reads and writes `settings.json` under one data directory.
pub struct SettingsManager {
    data_dir: PathBuf,
}

impl SettingsManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    fn lock(&self, exclusive: bool) -> CoreResult<SettingsLock> {
        SettingsLock::acquire(&self.data_dir.join(SETTINGS_LOCK_FILE), exclusive)
    }

    /// Current settings, or defaults when the file is absent or unusable.
    pub fn load(&self) -> HostSettings {
        match self.try_load() {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                debug!("No settings file in {}", self.data_dir.display());
                HostSettings::default()
            }
            Err(e) => {
                warn!("Ignoring settings file: {}", e);
                HostSettings::default()
            }
        }
    }

    fn try_load(&self) -> CoreResult<Option<HostSettings>> {
        let _lock = self.lock(false)?;
        let path = self.settings_path();
        if !path.exists() {
            return Ok(None);
        }

        let mut settings: HostSettings = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if settings.version < SETTINGS_VERSION {
            info!(
                "Upgrading settings layout v{} -> v{}",
                settings.version, SETTINGS_VERSION
            );
            Self::upgrade(&mut settings);
        }
        settings.normalize();
        Ok(Some(settings))
    }

    /// Normalizes, persists and returns what was written.
    pub fn save(&self, settings: &HostSettings) -> CoreResult<HostSettings> {
        let _lock = self.lock(true)?;
        let mut stored = settings.clone();
        stored.normalize();
        atomic_write_json_pretty(&self.settings_path(), &stored)?;
        info!("Host settings written to {}", self.settings_path().display());
        Ok(stored)
    }

    /// Removes the file so the next load starts from defaults.
    pub fn reset(&self) -> CoreResult<HostSettings> {
        let _lock = self.lock(true)?;
        match fs::remove_file(self.settings_path()) {
            Ok(()) => info!("Host settings reset"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(HostSettings::default())
    }

    fn upgrade(settings: &mut HostSettings) {
        // v0 stored window modes in kebab-case.
        if settings.version == 0 {
            settings.templates.default_window_mode =
                settings.templates.default_window_mode.replace('-', "_");
        }
        settings.version = SETTINGS_VERSION;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_data_dir() {
        assert!(default_data_dir().ends_with("plugdock"));
    }

    #[test]
    fn test_defaults_are_stable() {
        let settings = HostSettings::default();
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert!(settings.plugins.autoload);
        assert_eq!(settings.templates.default_floating_percent, 60);
        assert_eq!(settings.templates.default_window_mode, "all_modes");
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_normalize_clamps_numeric_ranges() {
        let mut settings = HostSettings::default();
        settings.templates.default_floating_percent = 5;
        settings.plugins.max_memory_mb = 0;
        settings.plugins.fuel_per_call = 1;
        settings.market.timeout_secs = 9999;
        settings.normalize();

        assert_eq!(settings.templates.default_floating_percent, 10);
        assert_eq!(settings.plugins.max_memory_mb, 1);
        assert_eq!(settings.plugins.fuel_per_call, 10_000);
        assert_eq!(settings.market.timeout_secs, 120);
    }

    #[test]
    fn test_normalize_replaces_unknown_enums_and_urls() {
        let mut settings = HostSettings::default();
        settings.templates.default_window_mode = "Fullscreen-Or-Maximized".to_string();
        settings.logging.level = "LOUD".to_string();
        settings.market.base_url = "ftp://nope".to_string();
        settings.templates.shell_url = "  ".to_string();
        settings.plugins.directory = Some(" ".to_string());
        settings.normalize();

        assert_eq!(
            settings.templates.default_window_mode,
            "fullscreen_or_maximized"
        );
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.market.base_url, default_market_url());
        assert_eq!(settings.templates.shell_url, default_shell_url());
        assert!(settings.plugins.directory.is_none());
    }

    #[test]
    fn test_market_url_trailing_slash_trimmed() {
        let mut settings = HostSettings::default();
        settings.market.base_url = "http://localhost:8080/".to_string();
        settings.normalize();
        assert_eq!(settings.market.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path().to_path_buf());
        assert_eq!(manager.load(), HostSettings::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path().to_path_buf());

        let mut settings = HostSettings::default();
        settings.templates.default_floating_percent = 75;
        settings.logging.level = "debug".to_string();

        manager.save(&settings).unwrap();
        let loaded = manager.load();

        assert_eq!(loaded.templates.default_floating_percent, 75);
        assert_eq!(loaded.logging.level, "debug");
    }

    #[test]
    fn test_save_normalizes_before_persisting() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path().to_path_buf());

        let mut settings = HostSettings::default();
        settings.templates.default_floating_percent = 250;
        let saved = manager.save(&settings).unwrap();
        assert_eq!(saved.templates.default_floating_percent, 100);

        let raw = fs::read_to_string(manager.settings_path()).unwrap();
        assert!(raw.contains("\"defaultFloatingPercent\": 100"));
    }

    #[test]
    fn test_invalid_json_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path().to_path_buf());
        fs::write(manager.settings_path(), "{ invalid json }").unwrap();
        assert_eq!(manager.load(), HostSettings::default());
    }

    #[test]
    fn test_partial_json_uses_defaults_for_missing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path().to_path_buf());
        fs::write(
            manager.settings_path(),
            r#"{"version": 1, "logging": {"level": "warn"}}"#,
        )
        .unwrap();

        let loaded = manager.load();
        assert_eq!(loaded.logging.level, "warn");
        assert!(loaded.logging.file_output);
        assert_eq!(loaded.templates, TemplateSettings::default());
    }

    #[test]
    fn test_version_zero_is_migrated() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path().to_path_buf());
        fs::write(
            manager.settings_path(),
            r#"{"version": 0, "templates": {"defaultWindowMode": "windowed-only"}}"#,
        )
        .unwrap();

        let loaded = manager.load();
        assert_eq!(loaded.version, SETTINGS_VERSION);
        assert_eq!(loaded.templates.default_window_mode, "windowed_only");
    }

    #[test]
    fn test_reset_without_file_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path().to_path_buf());
        assert_eq!(manager.reset().unwrap(), HostSettings::default());
    }

    #[test]
    fn test_reset_deletes_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path().to_path_buf());

        manager.save(&HostSettings::default()).unwrap();
        assert!(manager.settings_path().exists());

        let reset = manager.reset().unwrap();
        assert!(!manager.settings_path().exists());
        assert_eq!(reset, HostSettings::default());
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested").join("dir");
        let manager = SettingsManager::new(nested);

        assert!(manager.save(&HostSettings::default()).is_ok());
        assert!(manager.settings_path().exists());
    }
}
