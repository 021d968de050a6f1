//! On-device module scanner

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::fs::RootFs;
use super::update::{can_check_update, check_update};
use crate::compat::CompatTable;
use crate::config::ModsyncConfig;
use crate::model::{LocalModuleRecord, StatusFlags};
use crate::net::HttpClient;
use crate::props::{make_name_from_id, read_properties, PropMode};
use crate::store::{module_active_key, CacheStore, PREF_FIRST_SCAN_DONE};
use crate::sync::{ProgressListener, SyncManager, SyncOutcome, SyncTarget};

pub type LocalModuleMap = BTreeMap<String, LocalModuleRecord>;

/// Flags that survive the reset at the start of a pass
const KEEP_ON_RESET: StatusFlags = StatusFlags::from_bits(
    StatusFlags::INTERNAL_UNPROCESSED_MARKER.bits()
        | StatusFlags::ACTIVE_ANY.bits()
        | StatusFlags::UPDATE_PENDING_ONLY.bits(),
);

/// Cleared on every record the pass reaches
const RESET_ON_VISIT: StatusFlags = StatusFlags::from_bits(
    StatusFlags::METADATA_INVALID.bits() | StatusFlags::INTERNAL_UNPROCESSED_MARKER.bits(),
);

/// Update feeds queried at once by `check_updates`
const UPDATE_CHECK_CONCURRENCY: usize = 4;

/// Directories whose presence means the module mounts something
const MOUNT_DIRS: [&str; 4] = ["system", "vendor", "zygisk", "riru"];

struct LocalState {
    fs: Arc<dyn RootFs>,
    store: Arc<dyn CacheStore>,
    compat: Arc<CompatTable>,
    settings: Arc<ModsyncConfig>,
    modules: LocalModuleMap,
    updatable: usize,
    snapshot: Arc<RwLock<Arc<LocalModuleMap>>>,
}

impl LocalState {
    fn publish(&self) {
        let map = Arc::new(self.modules.clone());
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = map;
    }

    fn pref_bool(&self, key: &str) -> bool {
        self.store.pref_bool(key).unwrap_or_else(|e| {
            warn!("Failed to read {}: {}", key, e);
            false
        })
    }

    fn mark_active(&self, id: &str) {
        if let Err(e) = self.store.set_pref_bool(&module_active_key(id), true) {
            warn!("Failed to record {} as active: {}", id, e);
        }
    }

    fn list_dirs(&self, root: &Path) -> Vec<String> {
        match self.fs.list(root) {
            Ok(names) => names
                .into_iter()
                .filter(|name| self.fs.is_dir(&root.join(name)))
                .collect(),
            Err(e) => {
                debug!("Cannot list {}: {}", root.display(), e);
                Vec::new()
            }
        }
    }

    fn read_prop(&self, record: &mut LocalModuleRecord, path: &Path) {
        let source_name = path.display().to_string();
        match self.fs.read_to_string(path) {
            Ok(content) => {
                let result = read_properties(
                    &mut record.meta,
                    &content,
                    &source_name,
                    PropMode::Local,
                    &self.compat,
                );
                if let Err(e) = result {
                    debug!("{}", e);
                    record.meta.flags.insert(StatusFlags::METADATA_INVALID);
                }
            }
            Err(e) => {
                debug!("Failed to read {}: {}", source_name, e);
                record.meta.flags.insert(StatusFlags::METADATA_INVALID);
            }
        }
    }

    /// Path listing modules mounted at boot, if the runtime confirms it
    fn active_modules_path(&self) -> Option<PathBuf> {
        let path = self.settings.magisk_path.as_ref()?.join(".magisk").join("modules");
        self.fs.exists(&path).then_some(path)
    }

    fn scan_installed(&mut self, first_scan: bool) {
        let modules_dir = self.settings.modules_dir();
        let active_path = self.active_modules_path();
        let needs_fallback = active_path.is_none();
        if needs_fallback {
            debug!("Active module path unconfirmed, using boot records");
        }

        for name in self.list_dirs(&modules_dir) {
            let dir = modules_dir.join(&name);
            let mut record = self
                .modules
                .remove(&name)
                .unwrap_or_else(|| LocalModuleRecord::new(&name));

            match self.store.find_module_row(&name) {
                Ok(Some(row)) => {
                    debug!("Found cached metadata for {}", name);
                    let meta = &mut record.meta;
                    meta.name = Some(if row.name.is_empty() { name.clone() } else { row.name });
                    if !row.description.is_empty() {
                        meta.description = Some(row.description);
                    }
                    if !row.author.is_empty() {
                        meta.author = Some(row.author);
                    }
                    meta.safe = row.safe;
                    meta.support = (!row.support.is_empty()).then_some(row.support);
                    meta.donate = (!row.donate.is_empty()).then_some(row.donate);
                    meta.flags.insert(StatusFlags::SOURCED_FROM_REMOTE_CACHE);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to read cache row for {}: {}", name, e),
            }

            let flags = &mut record.meta.flags;
            flags.remove(RESET_ON_VISIT);
            if self.fs.exists(&dir.join("disable")) {
                flags.insert(StatusFlags::DISABLED);
            } else if first_scan && needs_fallback {
                flags.insert(StatusFlags::ACTIVE);
                self.mark_active(&name);
            }
            if self.fs.exists(&dir.join("remove")) {
                flags.insert(StatusFlags::UNINSTALLING);
            }

            let mounted_now = first_scan
                && active_path
                    .as_ref()
                    .is_some_and(|path| self.fs.exists(&path.join(&name)));
            if mounted_now || self.pref_bool(&module_active_key(&name)) {
                flags.insert(StatusFlags::ACTIVE);
                if first_scan {
                    self.mark_active(&name);
                }
            } else if !needs_fallback {
                flags.remove(StatusFlags::ACTIVE);
            }

            if flags.is_active() && MOUNT_DIRS.iter().any(|d| self.fs.exists(&dir.join(d))) {
                flags.insert(StatusFlags::HAS_ACTIVE_MOUNT);
            }

            self.read_prop(&mut record, &dir.join("module.prop"));
            self.modules.insert(name, record);
        }
    }

    fn scan_pending(&mut self) {
        let update_dir = self.settings.modules_update_dir();
        for name in self.list_dirs(&update_dir) {
            let mut record = self
                .modules
                .remove(&name)
                .unwrap_or_else(|| LocalModuleRecord::new(&name));
            record.meta.flags.remove(RESET_ON_VISIT);
            record.meta.flags.insert(StatusFlags::UPDATING);
            self.read_prop(&mut record, &update_dir.join(&name).join("module.prop"));
            self.modules.insert(name, record);
        }
    }

    fn finalize(&mut self) {
        self.modules.retain(|id, record| {
            let keep = !record
                .meta
                .has_flag(StatusFlags::INTERNAL_UNPROCESSED_MARKER);
            if !keep {
                debug!("Module {} is gone", id);
            }
            keep
        });

        self.updatable = 0;
        for record in self.modules.values_mut() {
            if can_check_update(record) {
                self.updatable += 1;
            } else {
                record.update = None;
            }
            let meta = &mut record.meta;
            if meta.name.is_none() || meta.name.as_deref() == Some(meta.id.as_str()) {
                meta.name = Some(make_name_from_id(&meta.id));
            }
            if meta.version.as_deref().map_or(true, |v| v.trim().is_empty()) {
                meta.version = Some(format!("v{}", meta.version_code));
            }
            meta.verify();
        }
    }
}

#[async_trait]
impl SyncTarget for LocalState {
    #[instrument(skip_all, name = "local_scan")]
    async fn scan_internal(&mut self, progress: &dyn ProgressListener) {
        progress.on_progress(0, 3);
        let first_scan = !self.pref_bool(PREF_FIRST_SCAN_DONE);

        for record in self.modules.values_mut() {
            let meta = &mut record.meta;
            meta.flags.insert(StatusFlags::INTERNAL_UNPROCESSED_MARKER);
            meta.flags.retain(KEEP_ON_RESET);
            meta.name = Some(meta.id.clone());
            meta.version = None;
            meta.version_code = 0;
            meta.author = None;
            meta.description = Some(String::new());
            meta.support = None;
            meta.config = None;
        }

        self.scan_installed(first_scan);
        progress.on_progress(1, 3);
        self.scan_pending();
        progress.on_progress(2, 3);
        self.finalize();

        if first_scan {
            if let Err(e) = self.store.set_pref_bool(PREF_FIRST_SCAN_DONE, true) {
                warn!("Failed to record first scan: {}", e);
            }
        }
        info!(
            "Found {} local modules ({} updatable)",
            self.modules.len(),
            self.updatable
        );
        self.publish();
        progress.on_progress(3, 3);
    }
}

/// `line` may be deleted by a master clear when it stays inside the root
/// config directory without touching the module tree or the root database.
///
/// Segments are checked on the raw text, so `//`, `.` and `..` never get
/// normalised into an accepted path.
pub fn is_safe_extra_path(line: &str, adb_root: &Path) -> bool {
    if line.contains('*') || line.contains('\0') {
        return false;
    }
    let root = adb_root.to_string_lossy();
    let Some(rest) = line
        .strip_prefix(root.trim_end_matches('/'))
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return false;
    };
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() || rest == "magisk.db" {
        return false;
    }

    let mut segments = rest.split('/');
    if segments.clone().any(|s| s.is_empty() || s == "." || s == "..") {
        return false;
    }
    segments
        .next()
        .is_some_and(|first| !first.starts_with("modules"))
}

/// Local module map maintained by debounced scans
pub struct LocalModuleScanner {
    manager: Arc<SyncManager<LocalState>>,
    snapshot: Arc<RwLock<Arc<LocalModuleMap>>>,
    fs: Arc<dyn RootFs>,
    http: HttpClient,
}

impl LocalModuleScanner {
    pub fn new(
        fs: Arc<dyn RootFs>,
        store: Arc<dyn CacheStore>,
        compat: Arc<CompatTable>,
        settings: Arc<ModsyncConfig>,
        http: HttpClient,
    ) -> Self {
        let snapshot: Arc<RwLock<Arc<LocalModuleMap>>> = Arc::default();
        let state = LocalState {
            fs: Arc::clone(&fs),
            store,
            compat,
            settings,
            modules: LocalModuleMap::new(),
            updatable: 0,
            snapshot: Arc::clone(&snapshot),
        };
        Self {
            manager: Arc::new(SyncManager::new(state)),
            snapshot,
            fs,
            http,
        }
    }

    pub async fn scan(&self) -> SyncOutcome {
        self.manager.scan().await
    }

    pub async fn update(&self, progress: &dyn ProgressListener) -> SyncOutcome {
        self.manager.update(progress).await
    }

    pub fn scan_async(&self) -> Option<JoinHandle<SyncOutcome>> {
        self.manager.scan_async()
    }

    pub async fn after_scan(&self) {
        self.manager.after_scan().await
    }

    /// Module map of the last pass, waiting for one in flight
    pub async fn modules(&self) -> Arc<LocalModuleMap> {
        self.after_scan().await;
        self.snapshot()
    }

    pub fn snapshot(&self) -> Arc<LocalModuleMap> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn updatable_count(&self) -> usize {
        self.manager.run_after_scan(|state| state.updatable).await
    }

    pub async fn is_module_active(&self, id: &str) -> bool {
        self.modules()
            .await
            .get(id)
            .is_some_and(|r| r.flags().is_active())
    }

    /// Toggle the `disable` marker; false leaves the record unchanged
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let fs = Arc::clone(&self.fs);
        self.with_record(id, move |record, dir| {
            let flags = &mut record.meta.flags;
            if flags.intersects(StatusFlags::UPDATING) && !enabled {
                return false;
            }
            let marker = dir.join("disable");
            if enabled {
                if fs.exists(&marker) {
                    if let Err(e) = fs.remove_file(&marker) {
                        error!("Failed to remove {}: {}", marker.display(), e);
                        flags.insert(StatusFlags::DISABLED);
                        return false;
                    }
                }
                flags.remove(StatusFlags::DISABLED);
            } else {
                if !fs.exists(&marker) {
                    if let Err(e) = fs.create_file(&marker) {
                        error!("Failed to create {}: {}", marker.display(), e);
                        return false;
                    }
                }
                flags.insert(StatusFlags::DISABLED);
            }
            true
        })
        .await
    }

    /// Toggle the `remove` marker; false leaves the record unchanged
    pub async fn set_uninstall(&self, id: &str, uninstall: bool) -> bool {
        let fs = Arc::clone(&self.fs);
        self.with_record(id, move |record, dir| {
            let flags = &mut record.meta.flags;
            if uninstall && flags.intersects(StatusFlags::UPDATING) {
                return false;
            }
            let marker = dir.join("remove");
            if uninstall {
                if !fs.exists(&marker) {
                    if let Err(e) = fs.create_file(&marker) {
                        error!("Failed to create {}: {}", marker.display(), e);
                        return false;
                    }
                }
                flags.insert(StatusFlags::UNINSTALLING);
            } else {
                if fs.exists(&marker) {
                    if let Err(e) = fs.remove_file(&marker) {
                        error!("Failed to remove {}: {}", marker.display(), e);
                        flags.insert(StatusFlags::UNINSTALLING);
                        return false;
                    }
                }
                flags.remove(StatusFlags::UNINSTALLING);
            }
            true
        })
        .await
    }

    /// Remove every trace of a module that has no active mount
    pub async fn master_clear(&self, id: &str) -> bool {
        let fs = Arc::clone(&self.fs);
        self.manager
            .run_after_scan(|state| {
                let Some(record) = state.modules.get_mut(id) else {
                    return false;
                };
                if record.meta.has_flag(StatusFlags::HAS_ACTIVE_MOUNT) {
                    warn!("Refusing to clear {} while it has an active mount", id);
                    return false;
                }

                let modules_dir = state.settings.modules_dir();
                let manifest = modules_dir.join(format!(".{id}-files"));
                if let Ok(content) = fs.read_to_string(&manifest) {
                    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                        if !is_safe_extra_path(line, &state.settings.adb_root) {
                            warn!("Skipping unsafe path in {}: {}", manifest.display(), line);
                            continue;
                        }
                        if let Err(e) = fs.remove_all(Path::new(line)) {
                            warn!("Failed to remove {}: {}", line, e);
                        }
                    }
                }

                for path in [
                    modules_dir.join(id),
                    manifest,
                    state.settings.modules_update_dir().join(id),
                ] {
                    if let Err(e) = fs.remove_all(&path) {
                        warn!("Failed to remove {}: {}", path.display(), e);
                    }
                }
                record.meta.flags = StatusFlags::METADATA_INVALID;
                state.publish();
                true
            })
            .await
    }

    /// Check every eligible module for an update, returning how many have one
    pub async fn check_updates(&self) -> usize {
        let candidates: Vec<LocalModuleRecord> = self
            .modules()
            .await
            .values()
            .filter(|r| can_check_update(r))
            .cloned()
            .collect();

        let checked: Vec<LocalModuleRecord> = stream::iter(candidates)
            .map(|mut record| async move {
                check_update(&mut record, &self.http).await;
                record
            })
            .buffer_unordered(UPDATE_CHECK_CONCURRENCY)
            .collect()
            .await;

        self.manager
            .run_after_scan(|state| {
                for record in checked {
                    if let Some(current) = state.modules.get_mut(record.id()) {
                        current.update = record.update;
                    }
                }
                state.publish();
                state.modules.values().filter(|r| r.has_update()).count()
            })
            .await
    }

    async fn with_record<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut LocalModuleRecord, PathBuf) -> bool,
    {
        self.manager
            .run_after_scan(|state| {
                let dir = state.settings.modules_dir().join(id);
                let Some(record) = state.modules.get_mut(id) else {
                    return false;
                };
                let changed = f(record, dir);
                state.publish();
                changed
            })
            .await
    }
}
