//! Plain JSON feed (`{"name", "last_update", "modules": [...]}`)

use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::source::{opt_i64, opt_string, strip_official, SourceError, SourceInfo};
use crate::compat::CompatTable;
use crate::model::{CatalogEntry, ModuleId, Quality, StatusFlags};
use crate::props::{read_properties, PropMode};

pub struct PlainSource {
    pub info: SourceInfo,
}

impl PlainSource {
    pub fn new(info: SourceInfo) -> Self {
        Self { info }
    }

    fn prop_path(&self, module_id: &str) -> PathBuf {
        self.info.cache_root.join(format!("{module_id}.prop"))
    }

    pub fn populate(&mut self, index: &Value) -> Result<Vec<String>, SourceError> {
        let name = opt_string(index, "name")
            .map(|n| n.trim().to_string())
            .ok_or_else(|| SourceError::InvalidIndex("missing \"name\"".to_string()))?;
        let last_update = opt_i64(index, "last_update")
            .ok_or_else(|| SourceError::InvalidIndex("missing \"last_update\"".to_string()))?;
        let modules = index
            .get("modules")
            .and_then(Value::as_array)
            .ok_or_else(|| SourceError::InvalidIndex("missing \"modules\" array".to_string()))?;

        let name_for_modules = strip_official(&name);
        let repo_id = self.info.id().to_string();
        self.info.begin_populate();

        let mut changed = Vec::new();
        for module in modules {
            let Some(raw_id) = opt_string(module, "id") else {
                continue;
            };
            let module_id = match ModuleId::parse(&raw_id) {
                Ok(id) => id,
                Err(e) => {
                    debug!("Skipping module in {}: {}", repo_id, e);
                    continue;
                }
            };
            let Some(module_last_update) = opt_i64(module, "last_update") else {
                warn!("Module {} in {} has no last_update", module_id, repo_id);
                continue;
            };

            let is_new = !self.info.modules.contains_key(module_id.as_str());
            let entry = self
                .info
                .modules
                .entry(module_id.to_string())
                .or_insert_with(|| CatalogEntry::new(&repo_id, module_id.as_str()));
            if is_new
                || entry.meta.last_updated < module_last_update
                || entry.meta.has_flag(StatusFlags::METADATA_INVALID)
            {
                changed.push(module_id.to_string());
            }

            entry.processed = true;
            entry.meta.last_updated = module_last_update;
            entry.notes_url = opt_string(module, "notes_url");
            entry.prop_url = opt_string(module, "prop_url");
            entry.zip_url = opt_string(module, "zip_url");
            entry.checksum = opt_string(module, "checksum").filter(|c| !c.is_empty());
            entry.meta.quality = parse_quality(module);
        }

        let cache_root = self.info.cache_root.clone();
        self.info.modules.retain(|id, entry| {
            if entry.processed {
                return true;
            }
            let path = cache_root.join(format!("{id}.prop"));
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete module metadata {}: {}", path.display(), e);
                }
            }
            debug!("Module {} disappeared from {}", id, repo_id);
            false
        });

        self.info.module_repo_name = name_for_modules;
        self.info.config.name = Some(name);
        self.info.config.last_update = last_update;
        self.info.apply_index_links(index);
        Ok(changed)
    }

    pub fn store_metadata(&self, module_id: &str, data: &[u8]) -> Result<(), SourceError> {
        let path = self.prop_path(module_id);
        std::fs::create_dir_all(&self.info.cache_root)
            .and_then(|_| std::fs::write(&path, data))
            .map_err(|source| SourceError::Io { path, source })
    }

    /// Load the cached `.prop` for a module; a bad file is deleted
    pub fn try_load_metadata(&mut self, module_id: &str, compat: &CompatTable) -> bool {
        let path = self.prop_path(module_id);
        let repo_name = self.info.module_repo_name.clone();
        let Some(entry) = self.info.modules.get_mut(module_id) else {
            return false;
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let source_name = format!("{}/{}", repo_name, entry.meta.display_name());
                let mut meta = entry.meta.clone();
                match read_properties(&mut meta, &content, &source_name, PropMode::Remote, compat)
                {
                    Ok(()) => {
                        meta.flags.remove(StatusFlags::METADATA_INVALID);
                        if meta.version.is_none() {
                            meta.version = Some(format!("v{}", meta.version_code));
                        }
                        meta.verify();
                        entry.meta = meta;
                        return true;
                    }
                    Err(e) => {
                        warn!("Invalid cached metadata {}: {}", path.display(), e);
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!("Failed to delete {}: {}", path.display(), e);
                        }
                    }
                }
            }
            Err(_) => debug!("Metadata file not found for {}", module_id),
        }
        entry.meta.flags.insert(StatusFlags::METADATA_INVALID);
        false
    }
}

/// Stars win over downloads; downloads fall back to stats
fn parse_quality(module: &Value) -> Option<Quality> {
    let stars = opt_string(module, "stars").unwrap_or_default();
    if !stars.is_empty() {
        return stars.trim().parse().ok().map(Quality::Stars);
    }
    let downloads = opt_string(module, "downloads")
        .filter(|d| !d.is_empty())
        .or_else(|| opt_string(module, "stats"))
        .unwrap_or_default();
    if downloads.is_empty() {
        return None;
    }
    downloads.trim().parse().ok().map(Quality::Downloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepositoryConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn source(dir: &TempDir) -> PlainSource {
        let config = RepositoryConfig::new("repo_test", "https://x.test/modules.json");
        PlainSource::new(SourceInfo::new(config, "Test", dir.path().to_path_buf()))
    }

    fn module(id: &str, last_update: i64) -> Value {
        json!({
            "id": id,
            "last_update": last_update,
            "notes_url": format!("https://x.test/{id}.md"),
            "prop_url": format!("https://x.test/{id}.prop"),
            "zip_url": format!("https://x.test/{id}.zip"),
        })
    }

    fn index(modules: Vec<Value>) -> Value {
        json!({"name": "Test (Official)", "last_update": 100, "modules": modules})
    }

    fn sorted(mut ids: Vec<String>) -> Vec<String> {
        ids.sort();
        ids
    }

    #[test]
    fn test_populate_reports_new_and_changed() {
        let dir = TempDir::new().unwrap();
        let mut source = source(&dir);

        let first = source
            .populate(&index(vec![module("alpha", 1), module("beta", 1)]))
            .unwrap();
        assert_eq!(sorted(first), vec!["alpha", "beta"]);
        assert_eq!(source.info.module_repo_name, "Test");

        // beta metadata loads fine, alpha stays invalid
        source.info.modules.get_mut("beta").unwrap().meta.flags = StatusFlags::empty();
        let second = source
            .populate(&index(vec![module("alpha", 1), module("beta", 1)]))
            .unwrap();
        assert_eq!(second, vec!["alpha"]);

        source.info.modules.get_mut("alpha").unwrap().meta.flags = StatusFlags::empty();
        let third = source
            .populate(&index(vec![module("alpha", 1), module("beta", 2)]))
            .unwrap();
        assert_eq!(third, vec!["beta"]);
    }

    #[test]
    fn test_removed_module_is_collected() {
        let dir = TempDir::new().unwrap();
        let mut source = source(&dir);
        source
            .populate(&index(vec![module("aaa", 1), module("bbb", 1), module("ccc", 1)]))
            .unwrap();
        source.store_metadata("bbb", b"id=bbb\n").unwrap();

        source
            .populate(&index(vec![module("aaa", 1), module("ccc", 1)]))
            .unwrap();
        assert!(!source.info.modules.contains_key("bbb"));
        assert!(!dir.path().join("bbb.prop").exists());
        assert_eq!(source.info.modules.len(), 2);
    }

    #[test]
    fn test_invalid_ids_skipped() {
        let dir = TempDir::new().unwrap();
        let mut source = source(&dir);
        let ids = source
            .populate(&index(vec![
                module("ak3-helper", 1),
                module("1bad", 1),
                module("", 1),
                module("good.id", 1),
            ]))
            .unwrap();
        assert_eq!(ids, vec!["good.id"]);
    }

    #[test]
    fn test_quality_resolution() {
        assert_eq!(
            parse_quality(&json!({"stars": "4", "downloads": "100"})),
            Some(Quality::Stars(4))
        );
        assert_eq!(
            parse_quality(&json!({"downloads": "", "stats": 55})),
            Some(Quality::Downloads(55))
        );
        assert_eq!(parse_quality(&json!({"stars": "lots"})), None);
        assert_eq!(parse_quality(&json!({})), None);
    }

    #[test]
    fn test_missing_name_is_invalid_index() {
        let dir = TempDir::new().unwrap();
        let mut source = source(&dir);
        let result = source.populate(&json!({"last_update": 1, "modules": []}));
        assert!(matches!(result, Err(SourceError::InvalidIndex(_))));
    }

    #[test]
    fn test_load_metadata() {
        let dir = TempDir::new().unwrap();
        let mut source = source(&dir);
        source
            .populate(&index(vec![module("good_mod", 1), module("bad_mod", 1)]))
            .unwrap();
        let compat = CompatTable::new();

        source
            .store_metadata(
                "good_mod",
                b"id=good_mod\nname=Good Module\nversionCode=3\nauthor=me\ndescription=Does things\n",
            )
            .unwrap();
        assert!(source.try_load_metadata("good_mod", &compat));
        let meta = &source.info.modules["good_mod"].meta;
        assert_eq!(meta.name.as_deref(), Some("Good Module"));
        assert_eq!(meta.version.as_deref(), Some("v3"));
        assert!(!meta.has_flag(StatusFlags::METADATA_INVALID));

        source
            .store_metadata("bad_mod", b"id=other\nversionCode=1\n")
            .unwrap();
        assert!(!source.try_load_metadata("bad_mod", &compat));
        assert!(!dir.path().join("bad_mod.prop").exists());
        assert!(source.info.modules["bad_mod"]
            .meta
            .has_flag(StatusFlags::METADATA_INVALID));
    }
}
