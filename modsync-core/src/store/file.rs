//! JSON file backed store
//!
//! Each record space is one JSON document under the data directory. Writes
//! go to a temporary file in the same directory and are renamed over the
//! previous document, so a reader sees either the old or the new state.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{CacheStore, ModuleListCacheRow, StoreData, StoreError};
use crate::model::RepositoryConfig;

const REPOS_FILE: &str = "repos.json";
const MODULES_FILE: &str = "module_cache.json";
const PREFS_FILE: &str = "prefs.json";

pub struct JsonFileStore {
    root: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;

        let data = StoreData {
            repos: read_document(&root.join(REPOS_FILE))?,
            modules: read_document(&root.join(MODULES_FILE))?,
            prefs: read_document(&root.join(PREFS_FILE))?,
        };
        tracing::debug!(
            "Opened store at {} ({} repos, {} cached repos)",
            root.display(),
            data.repos.len(),
            data.modules.len()
        );

        Ok(Self {
            root,
            data: Mutex::new(data),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply `f` to a copy, commit the document it touched, then publish
    /// the copy. A failed write leaves the in-memory state untouched.
    fn mutate<R>(
        &self,
        file: &str,
        f: impl FnOnce(&mut StoreData) -> R,
    ) -> Result<R, StoreError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = data.clone();
        let result = f(&mut next);
        let path = self.root.join(file);
        match file {
            REPOS_FILE => write_document(&path, &next.repos)?,
            MODULES_FILE => write_document(&path, &next.modules)?,
            _ => write_document(&path, &next.prefs)?,
        }
        *data = next;
        Ok(result)
    }

    fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> R {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        f(&data)
    }
}

fn read_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&content).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let content = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
    tmp.write_all(&content).map_err(io_error)?;
    tmp.as_file().sync_all().map_err(io_error)?;
    tmp.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}

impl CacheStore for JsonFileStore {
    fn repos(&self) -> Result<Vec<RepositoryConfig>, StoreError> {
        Ok(self.read(|d| d.repos.clone()))
    }

    fn upsert_repo(&self, repo: &RepositoryConfig) -> Result<(), StoreError> {
        self.mutate(REPOS_FILE, |d| d.upsert_repo(repo))
    }

    fn delete_repo(&self, id: &str) -> Result<bool, StoreError> {
        self.mutate(REPOS_FILE, |d| d.delete_repo(id))
    }

    fn module_rows(&self, repo_id: &str) -> Result<Vec<ModuleListCacheRow>, StoreError> {
        Ok(self.read(|d| d.modules.get(repo_id).cloned().unwrap_or_default()))
    }

    fn replace_module_rows(
        &self,
        repo_id: &str,
        rows: Vec<ModuleListCacheRow>,
    ) -> Result<(), StoreError> {
        self.mutate(MODULES_FILE, |d| d.replace_module_rows(repo_id, rows))
    }

    fn find_module_row(&self, codename: &str) -> Result<Option<ModuleListCacheRow>, StoreError> {
        Ok(self.read(|d| d.find_module_row(codename)))
    }

    fn pref(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read(|d| d.prefs.get(key).cloned()))
    }

    fn set_pref(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        self.mutate(PREFS_FILE, |d| d.set_pref(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PREF_PREMIUM_TOKEN;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = JsonFileStore::open(temp_dir.path()).unwrap();
            let mut repo = RepositoryConfig::new("repo_a", "https://a.example/modules.json");
            repo.name = Some("A".to_string());
            store.upsert_repo(&repo).unwrap();
            store.set_repo_last_update("repo_a", 1234).unwrap();
            store
                .replace_module_rows(
                    "repo_a",
                    vec![ModuleListCacheRow {
                        codename: "foo".to_string(),
                        version_code: 3,
                        repo_id: "repo_a".to_string(),
                        ..Default::default()
                    }],
                )
                .unwrap();
            store.set_pref(PREF_PREMIUM_TOKEN, Some("tok")).unwrap();
        }

        let store = JsonFileStore::open(temp_dir.path()).unwrap();
        let repo = store.repo("repo_a").unwrap().unwrap();
        assert_eq!(repo.name.as_deref(), Some("A"));
        assert_eq!(repo.last_update, 1234);
        assert_eq!(store.module_rows("repo_a").unwrap()[0].version_code, 3);
        assert_eq!(store.pref(PREF_PREMIUM_TOKEN).unwrap().as_deref(), Some("tok"));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).unwrap();
        store.set_pref("a", Some("1")).unwrap();
        store.set_pref("b", Some("2")).unwrap();

        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![PREFS_FILE.to_string()]);
    }

    #[test]
    fn test_failed_write_keeps_memory_in_sync_with_disk() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).unwrap();
        store.set_pref("a", Some("1")).unwrap();

        // A directory in place of the document makes the rename fail
        let prefs = temp_dir.path().join(PREFS_FILE);
        std::fs::remove_file(&prefs).unwrap();
        std::fs::create_dir(&prefs).unwrap();

        assert!(matches!(
            store.set_pref("b", Some("2")),
            Err(StoreError::Io { .. })
        ));
        assert_eq!(store.pref("b").unwrap(), None);
        assert_eq!(store.pref("a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_corrupt_document_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(REPOS_FILE), "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(temp_dir.path()),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
