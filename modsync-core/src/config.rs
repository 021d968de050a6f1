//! modsync configuration
//!
//! A single YAML document holding paths, premium-source credentials and
//! install preferences. A missing file yields defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location
pub const CONFIG_ENV_VAR: &str = "MODSYNC_CONFIG";

/// Default root of the privileged module tree
pub const DEFAULT_ADB_ROOT: &str = "/data/adb";

/// Settings for the authenticated premium repository
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PremiumConfig {
    /// Client id issued by the premium API; the source is skipped when empty
    pub client_id: String,
    /// Use the staging API instead of production
    pub test_mode: bool,
}

/// Top level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModsyncConfig {
    /// Persistent data (repo list, module cache, preferences, compat table)
    pub data_dir: PathBuf,
    /// Disposable data (downloaded props, install scratch space)
    pub cache_dir: PathBuf,
    /// Root of the privileged module tree
    pub adb_root: PathBuf,
    /// Magisk runtime directory holding `.magisk/busybox`
    pub magisk_path: Option<PathBuf>,
    /// Version code of the installed root manager, 0 if unknown
    pub magisk_version_code: u32,
    pub premium: PremiumConfig,
    /// Debug freshness policy (15 minute repo refresh instead of 30)
    pub debug: bool,
    /// Prefer `magisk --install-module` when the runtime supports it
    pub prefer_install_command: bool,
    /// Hide repository modules with unusable metadata
    pub low_quality_filter: bool,
    pub max_custom_repos: usize,
    pub user_agent: String,
    pub app_version_code: u32,
    pub app_version_name: String,
}

impl Default for ModsyncConfig {
    fn default() -> Self {
        let (data_dir, cache_dir) = match directories::ProjectDirs::from("dev", "modsync", "modsync")
        {
            Some(dirs) => (dirs.data_dir().to_path_buf(), dirs.cache_dir().to_path_buf()),
            None => {
                let base = dirs::home_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join(".modsync");
                (base.join("data"), base.join("cache"))
            }
        };

        Self {
            data_dir,
            cache_dir,
            adb_root: PathBuf::from(DEFAULT_ADB_ROOT),
            magisk_path: None,
            magisk_version_code: 0,
            premium: PremiumConfig::default(),
            debug: cfg!(debug_assertions),
            prefer_install_command: false,
            low_quality_filter: true,
            max_custom_repos: 5,
            user_agent: concat!("modsync/", env!("CARGO_PKG_VERSION")).to_string(),
            app_version_code: 1,
            app_version_name: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ModsyncConfig {
    /// Config rooted in a single directory, used by tests and dry runs
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
            adb_root: root.join("adb"),
            ..Self::default()
        }
    }

    /// Load from `$MODSYNC_CONFIG` or the platform config directory
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::default_config_path()?)
    }

    /// Load from a specific path, returning defaults if it does not exist
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    pub fn default_config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        directories::ProjectDirs::from("dev", "modsync", "modsync")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .or_else(|| dirs::config_dir().map(|d| d.join("modsync")))
            .map(|dir| dir.join("config.yaml"))
            .context("Could not determine config directory")
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.adb_root.join("modules")
    }

    pub fn modules_update_dir(&self) -> PathBuf {
        self.adb_root.join("modules_update")
    }

    /// Cached `<id>.prop` files for one repository
    pub fn repo_cache_dir(&self, repo_id: &str) -> PathBuf {
        self.cache_dir.join("repos").join(repo_id)
    }

    /// Scratch space for downloaded and patched archives
    pub fn install_dir(&self) -> PathBuf {
        self.cache_dir.join("install")
    }

    pub fn compat_file(&self) -> PathBuf {
        self.data_dir.join("compat.txt")
    }

    /// Minutes after which a repository is refreshed
    pub fn repo_refresh_minutes(&self) -> i64 {
        if self.debug {
            15
        } else {
            30
        }
    }
}
