//! Module metadata, catalog entries and local records

use serde::{Deserialize, Serialize};

use super::StatusFlags;

/// Popularity signal reported by a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Quality {
    Stars(u32),
    Downloads(u64),
}

/// Metadata describing one module, as read from a `module.prop` or an index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetadata {
    pub id: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub version_code: i64,
    pub author: Option<String>,
    pub description: Option<String>,
    pub update_json: Option<String>,
    pub support: Option<String>,
    pub donate: Option<String>,
    pub config: Option<String>,
    pub min_api: u32,
    pub max_api: u32,
    pub min_magisk: u32,
    pub need_ramdisk: bool,
    pub change_boot: bool,
    pub mmt_reborn: bool,
    pub safe: bool,
    pub quality: Option<Quality>,
    /// Epoch milliseconds
    pub last_updated: i64,
    pub flags: StatusFlags,
}

impl ModuleMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Name for display, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn has_flag(&self, flag: StatusFlags) -> bool {
        self.flags.intersects(flag)
    }

    /// Debug-only invariant check
    pub fn verify(&self) {
        debug_assert!(
            !self.flags.intersects(StatusFlags::FENCE),
            "fence flag set on module {}",
            self.id
        );
        debug_assert!(self.name.is_some(), "module {} has no name", self.id);
    }
}

/// One module as reported by one repository source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// Id of the owning repository
    pub repo_id: String,
    pub meta: ModuleMetadata,
    pub zip_url: Option<String>,
    pub notes_url: Option<String>,
    pub prop_url: Option<String>,
    pub checksum: Option<String>,
    /// Set during a populate pass; entries left unset are dropped
    #[serde(skip)]
    pub processed: bool,
}

impl CatalogEntry {
    /// Fresh entry named after its id; metadata stays invalid until loaded
    pub fn new(repo_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        let module_id = module_id.into();
        let mut meta = ModuleMetadata::new(module_id.clone());
        meta.name = Some(module_id);
        meta.flags.insert(StatusFlags::METADATA_INVALID);
        Self {
            repo_id: repo_id.into(),
            meta,
            zip_url: None,
            notes_url: None,
            prop_url: None,
            checksum: None,
            processed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }
}

/// Update advertised by a module's `updateJson`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub version: String,
    pub version_code: i64,
    pub zip_url: String,
    pub checksum: Option<String>,
    pub changelog: String,
}

/// A module found on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModuleRecord {
    pub meta: ModuleMetadata,
    pub update: Option<PendingUpdate>,
}

impl LocalModuleRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            meta: ModuleMetadata::new(id),
            update: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn flags(&self) -> StatusFlags {
        self.meta.flags
    }

    /// True when a newer version than the installed one is advertised
    pub fn has_update(&self) -> bool {
        self.update
            .as_ref()
            .map(|u| u.version_code > self.meta.version_code)
            .unwrap_or(false)
    }
}

/// Persisted configuration of one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    pub id: String,
    pub url: String,
    pub enabled: bool,
    pub name: Option<String>,
    pub website: Option<String>,
    pub support: Option<String>,
    pub donate: Option<String>,
    pub submit_module: Option<String>,
    /// Epoch milliseconds of the last successful commit, 0 if never
    #[serde(default)]
    pub last_update: i64,
}

impl RepositoryConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            enabled: true,
            name: None,
            website: None,
            support: None,
            donate: None,
            submit_module: None,
            last_update: 0,
        }
    }
}
