//! In-process store for tests and dry runs

use std::sync::Mutex;

use super::{CacheStore, ModuleListCacheRow, StoreData, StoreError};
use crate::model::RepositoryConfig;

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut StoreData) -> R) -> R {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut data)
    }
}

impl CacheStore for MemoryStore {
    fn repos(&self) -> Result<Vec<RepositoryConfig>, StoreError> {
        Ok(self.with(|d| d.repos.clone()))
    }

    fn upsert_repo(&self, repo: &RepositoryConfig) -> Result<(), StoreError> {
        self.with(|d| d.upsert_repo(repo));
        Ok(())
    }

    fn delete_repo(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.with(|d| d.delete_repo(id)))
    }

    fn module_rows(&self, repo_id: &str) -> Result<Vec<ModuleListCacheRow>, StoreError> {
        Ok(self.with(|d| d.modules.get(repo_id).cloned().unwrap_or_default()))
    }

    fn replace_module_rows(
        &self,
        repo_id: &str,
        rows: Vec<ModuleListCacheRow>,
    ) -> Result<(), StoreError> {
        self.with(|d| d.replace_module_rows(repo_id, rows));
        Ok(())
    }

    fn find_module_row(&self, codename: &str) -> Result<Option<ModuleListCacheRow>, StoreError> {
        Ok(self.with(|d| d.find_module_row(codename)))
    }

    fn pref(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with(|d| d.prefs.get(key).cloned()))
    }

    fn set_pref(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        self.with(|d| d.set_pref(key, value));
        Ok(())
    }
}
