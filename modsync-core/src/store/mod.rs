//! Persistent cache store
//!
//! Three record spaces back the engine: the repository list, the per-repository
//! module list cache, and a small preference map. Every mutation is committed
//! before the call returns.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::model::{ModuleMetadata, RepositoryConfig};

/// Cached premium API token
pub const PREF_PREMIUM_TOKEN: &str = "premium.token";
/// Device identifier sent to the premium API
pub const PREF_DEVICE_ID: &str = "premium.device_id";
/// Set once the local scanner confirmed the privileged module path
pub const PREF_FIRST_SCAN_DONE: &str = "local.first_scan_done";

/// Preference key recording whether a module was active at last boot
pub fn module_active_key(module_id: &str) -> String {
    format!("module.{module_id}.active")
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Repository '{0}' not found")]
    UnknownRepo(String),
}

/// One module as last seen in a repository index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleListCacheRow {
    pub codename: String,
    pub name: String,
    pub version: String,
    pub version_code: i64,
    pub author: String,
    pub description: String,
    pub min_api: u32,
    pub max_api: u32,
    pub min_magisk: u32,
    pub need_ramdisk: bool,
    pub support: String,
    pub donate: String,
    pub config: String,
    pub change_boot: bool,
    pub mmt_reborn: bool,
    pub repo_id: String,
    /// Epoch milliseconds
    pub last_update: i64,
    pub stats: u64,
    pub safe: bool,
    /// Download link without session credentials
    pub zip_url: String,
    pub notes_url: String,
    pub checksum: String,
}

impl ModuleListCacheRow {
    /// Metadata view of the row, empty strings mapped to `None`
    pub fn to_metadata(&self) -> ModuleMetadata {
        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
        ModuleMetadata {
            id: self.codename.clone(),
            name: opt(&self.name),
            version: opt(&self.version),
            version_code: self.version_code,
            author: opt(&self.author),
            description: opt(&self.description),
            support: opt(&self.support),
            donate: opt(&self.donate),
            config: opt(&self.config),
            min_api: self.min_api,
            max_api: self.max_api,
            min_magisk: self.min_magisk,
            need_ramdisk: self.need_ramdisk,
            change_boot: self.change_boot,
            mmt_reborn: self.mmt_reborn,
            safe: self.safe,
            last_updated: self.last_update,
            ..ModuleMetadata::default()
        }
    }
}

/// Record store contract used by the aggregator, sources and scanner
pub trait CacheStore: Send + Sync {
    /// Repositories in insertion order
    fn repos(&self) -> Result<Vec<RepositoryConfig>, StoreError>;

    fn repo(&self, id: &str) -> Result<Option<RepositoryConfig>, StoreError> {
        Ok(self.repos()?.into_iter().find(|r| r.id == id))
    }

    /// Insert, or replace the row with the same id
    fn upsert_repo(&self, repo: &RepositoryConfig) -> Result<(), StoreError>;

    /// Returns false when no such row existed
    fn delete_repo(&self, id: &str) -> Result<bool, StoreError>;

    fn set_repo_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        let mut repo = self
            .repo(id)?
            .ok_or_else(|| StoreError::UnknownRepo(id.to_string()))?;
        repo.enabled = enabled;
        self.upsert_repo(&repo)
    }

    fn set_repo_last_update(&self, id: &str, last_update: i64) -> Result<(), StoreError> {
        let mut repo = self
            .repo(id)?
            .ok_or_else(|| StoreError::UnknownRepo(id.to_string()))?;
        repo.last_update = last_update;
        self.upsert_repo(&repo)
    }

    fn module_rows(&self, repo_id: &str) -> Result<Vec<ModuleListCacheRow>, StoreError>;

    /// Atomically swap all rows of one repository
    fn replace_module_rows(
        &self,
        repo_id: &str,
        rows: Vec<ModuleListCacheRow>,
    ) -> Result<(), StoreError>;

    fn delete_module_rows(&self, repo_id: &str) -> Result<(), StoreError> {
        self.replace_module_rows(repo_id, Vec::new())
    }

    /// First cached row for a module id across all repositories
    fn find_module_row(&self, codename: &str) -> Result<Option<ModuleListCacheRow>, StoreError>;

    fn pref(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `None` removes the key
    fn set_pref(&self, key: &str, value: Option<&str>) -> Result<(), StoreError>;

    fn pref_bool(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.pref(key)?.as_deref() == Some("true"))
    }

    fn set_pref_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set_pref(key, Some(if value { "true" } else { "false" }))
    }
}

/// Document shared by both store implementations
#[derive(Debug, Clone, Default)]
struct StoreData {
    repos: Vec<RepositoryConfig>,
    modules: BTreeMap<String, Vec<ModuleListCacheRow>>,
    prefs: BTreeMap<String, String>,
}

impl StoreData {
    fn upsert_repo(&mut self, repo: &RepositoryConfig) {
        match self.repos.iter_mut().find(|r| r.id == repo.id) {
            Some(existing) => *existing = repo.clone(),
            None => self.repos.push(repo.clone()),
        }
    }

    fn delete_repo(&mut self, id: &str) -> bool {
        let before = self.repos.len();
        self.repos.retain(|r| r.id != id);
        before != self.repos.len()
    }

    fn replace_module_rows(&mut self, repo_id: &str, rows: Vec<ModuleListCacheRow>) {
        if rows.is_empty() {
            self.modules.remove(repo_id);
        } else {
            self.modules.insert(repo_id.to_string(), rows);
        }
    }

    fn find_module_row(&self, codename: &str) -> Option<ModuleListCacheRow> {
        self.modules
            .values()
            .flatten()
            .find(|row| row.codename == codename)
            .cloned()
    }

    fn set_pref(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(v) => {
                self.prefs.insert(key.to_string(), v.to_string());
            }
            None => {
                self.prefs.remove(key);
            }
        }
    }
}
