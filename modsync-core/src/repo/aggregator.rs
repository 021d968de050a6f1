//! Unified module catalog across every repository source

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::custom::{can_add_custom, CustomRepoError, CustomRepoMeta};
use super::plain::PlainSource;
use super::premium::{DeviceFingerprint, PremiumSource};
use super::source::{RepositorySource, SourceContext, SourceInfo};
use super::updater::RepoUpdater;
use super::{
    internal_id_of_url, is_custom_id, normalize_url, ALT_REPO_HOMEPAGE, ALT_REPO_ID,
    ALT_REPO_NAME, ALT_REPO_SUBMIT, ALT_REPO_URL, PREMIUM_REPO_ID, PREMIUM_REPO_URL,
    PREMIUM_TEST_REPO_URL,
};
use crate::model::{CatalogEntry, RepositoryConfig, StatusFlags};
use crate::props::is_low_quality;
use crate::store::StoreError;
use crate::sync::{ProgressListener, SyncManager, SyncOutcome, SyncTarget};

pub type ModuleMap = BTreeMap<String, CatalogEntry>;

const PROGRESS_STEP1: u32 = 20;
const PROGRESS_STEP2: u32 = 60;
const PROGRESS_STEP3: u32 = 20;
/// Upper bound of the progress reported by a sync pass
pub const PROGRESS_TOTAL: u32 = PROGRESS_STEP1 + PROGRESS_STEP2 + PROGRESS_STEP3;

/// A source whose fetch or commit failed in the last pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub id: String,
    pub name: String,
    /// Resetting the premium credentials is the recovery action
    pub premium: bool,
}

/// Outcome of the last completed pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub offline: bool,
    pub failed_sources: Vec<FailedSource>,
    pub module_count: usize,
    pub completed_at_ms: i64,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        !self.offline && self.failed_sources.is_empty()
    }
}

/// Listing view of one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoSummary {
    pub id: String,
    pub name: String,
    pub url: String,
    pub website: String,
    pub enabled: bool,
    pub forced_hide: bool,
    pub premium: bool,
    pub custom: bool,
    pub last_update: i64,
    pub module_count: usize,
}

impl RepoSummary {
    fn of(source: &RepositorySource) -> Self {
        let info = source.info();
        Self {
            id: info.id().to_string(),
            name: source.name(),
            url: info.url().to_string(),
            website: info.website().to_string(),
            enabled: info.is_enabled(),
            forced_hide: info.forced_hide,
            premium: source.is_premium(),
            custom: is_custom_id(info.id()),
            last_update: info.config.last_update,
            module_count: info.modules.len(),
        }
    }
}

/// Insert `entry` unless the registered entry takes precedence.
///
/// With the premium source enabled, a registered premium entry is kept and a
/// premium challenger replaces whatever is registered. Otherwise the higher
/// versionCode wins and ties keep the registered entry.
pub fn merge_entry(map: &mut ModuleMap, entry: CatalogEntry, premium_enabled: bool) {
    let replace = match map.get(entry.id()) {
        None => true,
        Some(current) if premium_enabled && current.repo_id == PREMIUM_REPO_ID => false,
        Some(_) if premium_enabled && entry.repo_id == PREMIUM_REPO_ID => true,
        Some(current) => current.meta.version_code < entry.meta.version_code,
    };
    if replace {
        map.insert(entry.id().to_string(), entry);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

type Shared<T> = Arc<RwLock<T>>;

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(|e| e.into_inner()) = value;
}

struct RepoState {
    ctx: SourceContext,
    fingerprint: Arc<dyn DeviceFingerprint>,
    /// Registration order: premium, alt, then custom repositories
    sources: Vec<RepositorySource>,
    snapshot: Shared<Arc<ModuleMap>>,
    report: Shared<SyncReport>,
}

impl RepoState {
    fn load(
        ctx: SourceContext,
        fingerprint: Arc<dyn DeviceFingerprint>,
        snapshot: Shared<Arc<ModuleMap>>,
        report: Shared<SyncReport>,
    ) -> Result<Self, StoreError> {
        let mut state = Self {
            ctx,
            fingerprint,
            sources: Vec::new(),
            snapshot,
            report,
        };

        let stored = state.ctx.store.repos()?;
        let premium_url = if state.ctx.settings.premium.test_mode {
            PREMIUM_TEST_REPO_URL
        } else {
            PREMIUM_REPO_URL
        };
        let premium_row = stored
            .iter()
            .find(|r| r.id == PREMIUM_REPO_ID)
            .cloned()
            .unwrap_or_else(|| RepositoryConfig::new(PREMIUM_REPO_ID, premium_url));
        state.register(premium_row)?;

        let alt_row = stored
            .iter()
            .find(|r| r.id == ALT_REPO_ID)
            .cloned()
            .unwrap_or_else(|| RepositoryConfig::new(ALT_REPO_ID, ALT_REPO_URL));
        state.register(alt_row)?;

        for row in stored.into_iter().filter(|r| is_custom_id(&r.id)) {
            state.register(row)?;
        }
        Ok(state)
    }

    /// Build the source for a row, persist the row and append it
    fn register(&mut self, config: RepositoryConfig) -> Result<&RepositorySource, StoreError> {
        let id = config.id.clone();
        let cache_root = self.ctx.settings.repo_cache_dir(&id);
        let mut source = if id == PREMIUM_REPO_ID {
            let info = SourceInfo::new(config, "", cache_root);
            RepositorySource::Premium(PremiumSource::new(
                info,
                self.ctx.settings.premium.test_mode,
                Arc::clone(&self.fingerprint),
            ))
        } else if id == ALT_REPO_ID {
            let mut info = SourceInfo::new(config, ALT_REPO_NAME, cache_root);
            info.config.url = ALT_REPO_URL.to_string();
            info.default_website = ALT_REPO_HOMEPAGE.to_string();
            info.default_submit_module = Some(ALT_REPO_SUBMIT.to_string());
            RepositorySource::Plain(PlainSource::new(info))
        } else {
            let fallback = config.name.clone().unwrap_or_default();
            RepositorySource::Plain(PlainSource::new(SourceInfo::new(
                config, &fallback, cache_root,
            )))
        };
        source.info_mut().forced_hide = self.ctx.compat.should_force_hide(&id);
        self.ctx.store.upsert_repo(&source.info().config)?;

        debug!("Registered repository {} ({})", id, source.info().url());
        self.sources.push(source);
        let last = self.sources.len() - 1;
        Ok(&self.sources[last])
    }

    fn find(&self, id: &str) -> Option<&RepositorySource> {
        self.sources.iter().find(|s| s.id() == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut RepositorySource> {
        self.sources.iter_mut().find(|s| s.id() == id)
    }

    fn premium_enabled(&self) -> bool {
        self.sources.iter().any(|s| s.is_premium() && s.is_enabled())
    }

    fn publish(&self, map: ModuleMap, report: SyncReport) {
        info!(
            "Published {} modules ({} failed sources)",
            map.len(),
            report.failed_sources.len()
        );
        write(&self.snapshot, Arc::new(map));
        write(&self.report, report);
    }
}

fn record_failure(report: &mut SyncReport, source: &RepositorySource) {
    if report.failed_sources.iter().any(|f| f.id == source.id()) {
        return;
    }
    report.failed_sources.push(FailedSource {
        id: source.id().to_string(),
        name: source.name(),
        premium: source.is_premium(),
    });
}

#[async_trait]
impl SyncTarget for RepoState {
    #[instrument(skip_all, name = "repo_sync")]
    async fn scan_internal(&mut self, progress: &dyn ProgressListener) {
        progress.on_progress(0, PROGRESS_TOTAL);
        let ctx = self.ctx.clone();
        let mut report = SyncReport::default();

        if !ctx.http.has_connectivity() {
            info!("No connectivity, publishing an empty catalog");
            report.offline = true;
            report.completed_at_ms = now_ms();
            self.publish(ModuleMap::new(), report);
            progress.on_progress(PROGRESS_TOTAL, PROGRESS_TOTAL);
            return;
        }

        let count = self.sources.len().max(1) as u32;
        let mut updaters: Vec<RepoUpdater> = Vec::with_capacity(self.sources.len());
        let mut pending = 0usize;
        for (i, source) in self.sources.iter_mut().enumerate() {
            let mut updater = RepoUpdater::new();
            pending += updater.fetch_index(source, &ctx, now_ms()).await;
            if updater.failed.is_some() {
                record_failure(&mut report, source);
            }
            updaters.push(updater);
            progress.on_progress(PROGRESS_STEP1 * (i as u32 + 1) / count, PROGRESS_TOTAL);
        }

        let premium_enabled = self.premium_enabled();
        let filter = ctx.settings.low_quality_filter;
        let pending = pending.max(1) as u64;
        let mut done = 0u64;
        let mut map = ModuleMap::new();
        for (source, updater) in self.sources.iter_mut().zip(&updaters) {
            if !source.is_enabled() {
                continue;
            }
            for id in &updater.to_update {
                let prop_url = source
                    .modules()
                    .get(id)
                    .and_then(|e| e.prop_url.clone())
                    .filter(|u| !u.is_empty());
                if let Some(url) = prop_url {
                    match ctx.http.get(&url).await {
                        Ok(data) => {
                            if let Err(e) = source.store_metadata(id, &data) {
                                warn!("Failed to store metadata of {}: {}", id, e);
                            }
                        }
                        Err(e) => warn!("Failed to fetch metadata of {}: {}", id, e),
                    }
                }

                let loaded = source.try_load_metadata(id, &ctx.compat);
                if let Some(entry) = source.info_mut().modules.get_mut(id) {
                    if loaded && !(filter && is_low_quality(&entry.meta, &ctx.compat)) {
                        merge_entry(&mut map, entry.clone(), premium_enabled);
                    } else {
                        entry.meta.flags.insert(StatusFlags::METADATA_INVALID);
                    }
                }

                done += 1;
                let step = (PROGRESS_STEP2 as u64 * done.min(pending) / pending) as u32;
                progress.on_progress(PROGRESS_STEP1 + step, PROGRESS_TOTAL);
            }

            for id in &updater.to_apply {
                match source.modules().get(id) {
                    Some(entry) if !entry.meta.has_flag(StatusFlags::METADATA_INVALID) => {
                        merge_entry(&mut map, entry.clone(), premium_enabled);
                    }
                    _ => {}
                }
            }
        }
        progress.on_progress(PROGRESS_STEP1 + PROGRESS_STEP2, PROGRESS_TOTAL);

        for (i, (source, updater)) in self.sources.iter_mut().zip(&mut updaters).enumerate() {
            if let Err(e) = updater.finish(source, &ctx, now_ms()) {
                error!("Failed to commit {}: {}", source.id(), e);
                record_failure(&mut report, source);
            }
            let step = PROGRESS_STEP3 * (i as u32 + 1) / count;
            progress.on_progress(PROGRESS_STEP1 + PROGRESS_STEP2 + step, PROGRESS_TOTAL);
        }

        report.module_count = map.len();
        report.completed_at_ms = now_ms();
        self.publish(map, report);
        progress.on_progress(PROGRESS_TOTAL, PROGRESS_TOTAL);
    }
}

/// Owns every repository source and publishes the merged catalog
pub struct RepositoryAggregator {
    manager: Arc<SyncManager<RepoState>>,
    ctx: SourceContext,
    snapshot: Shared<Arc<ModuleMap>>,
    report: Shared<SyncReport>,
}

impl RepositoryAggregator {
    /// Register the built-in sources and every custom repository in the store
    pub fn new(
        ctx: SourceContext,
        fingerprint: Arc<dyn DeviceFingerprint>,
    ) -> Result<Self, StoreError> {
        let snapshot: Shared<Arc<ModuleMap>> = Arc::default();
        let report: Shared<SyncReport> = Arc::default();
        let state = RepoState::load(
            ctx.clone(),
            fingerprint,
            Arc::clone(&snapshot),
            Arc::clone(&report),
        )?;
        Ok(Self {
            manager: Arc::new(SyncManager::new(state)),
            ctx,
            snapshot,
            report,
        })
    }

    pub async fn update(&self, progress: &dyn ProgressListener) -> SyncOutcome {
        self.manager.update(progress).await
    }

    pub async fn scan(&self) -> SyncOutcome {
        self.manager.scan().await
    }

    pub fn scan_async(&self) -> Option<JoinHandle<SyncOutcome>> {
        self.manager.scan_async()
    }

    pub fn is_syncing(&self) -> bool {
        self.manager.is_syncing()
    }

    pub async fn after_update(&self) {
        self.manager.after_update().await
    }

    /// Catalog of the last completed pass, waiting for one in flight
    pub async fn modules(&self) -> Arc<ModuleMap> {
        self.after_update().await;
        self.snapshot()
    }

    /// Catalog of the last completed pass, without waiting
    pub fn snapshot(&self) -> Arc<ModuleMap> {
        read(&self.snapshot)
    }

    pub fn last_report(&self) -> SyncReport {
        read(&self.report)
    }

    pub async fn repositories(&self) -> Vec<RepoSummary> {
        self.manager
            .run_after_update(|state| state.sources.iter().map(RepoSummary::of).collect())
            .await
    }

    pub async fn get(&self, id: &str) -> Option<RepositoryConfig> {
        self.manager
            .run_after_update(|state| state.find(id).map(|s| s.info().config.clone()))
            .await
    }

    /// Existing repository for `url`, or a newly registered one.
    ///
    /// Both premium URLs resolve to the single premium source.
    pub async fn add_or_get(
        &self,
        url: &str,
        fallback_name: Option<&str>,
    ) -> Result<RepositoryConfig, StoreError> {
        let url = normalize_url(url).to_string();
        let id = internal_id_of_url(&url);
        let fallback_name = fallback_name.map(str::to_string);
        self.manager
            .run_after_update(move |state| {
                if let Some(source) = state.find(&id) {
                    return Ok(source.info().config.clone());
                }
                let mut config = RepositoryConfig::new(&id, &url);
                config.name = fallback_name;
                Ok(state.register(config)?.info().config.clone())
            })
            .await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        self.manager
            .run_after_update(|state| {
                let source = state
                    .find_mut(id)
                    .ok_or_else(|| StoreError::UnknownRepo(id.to_string()))?;
                source.info_mut().config.enabled = enabled;
                state.ctx.store.set_repo_enabled(id, enabled)
            })
            .await
    }

    /// Validate, fetch the repository name, then register the repository
    pub async fn add_custom(&self, url: &str) -> Result<RepositoryConfig, CustomRepoError> {
        let url = normalize_url(url).to_string();
        let existing = self.ctx.store.repos()?;
        can_add_custom(&url, &existing, self.ctx.settings.max_custom_repos)?;

        let meta = CustomRepoMeta::fetch(&self.ctx.http, &url).await?;
        let id = internal_id_of_url(&url);
        self.manager
            .run_after_update(move |state| {
                if state.find(&id).is_some() {
                    return Err(CustomRepoError::Duplicate(url));
                }
                let mut config = RepositoryConfig::new(&id, &url);
                meta.apply(&mut config);
                info!("Adding custom repository {} ({})", id, url);
                Ok(state.register(config)?.info().config.clone())
            })
            .await
    }

    /// Remove a custom repository, its cached rows and metadata files
    pub async fn remove_custom(&self, id: &str) -> Result<bool, CustomRepoError> {
        if !is_custom_id(id) {
            return Err(CustomRepoError::NotCustom(id.to_string()));
        }
        self.manager
            .run_after_update(|state| {
                let before = state.sources.len();
                state.sources.retain(|s| s.id() != id);
                let removed = state.ctx.store.delete_repo(id)?;
                state.ctx.store.delete_module_rows(id)?;
                let cache = state.ctx.settings.repo_cache_dir(id);
                if let Err(e) = std::fs::remove_dir_all(&cache) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to delete {}: {}", cache.display(), e);
                    }
                }
                Ok(removed || before != state.sources.len())
            })
            .await
    }

    /// Drop the premium token so the next pass registers a fresh one
    pub async fn reset_premium_credentials(&self) {
        self.manager
            .run_after_update(|state| {
                let ctx = state.ctx.clone();
                if let Some(RepositorySource::Premium(source)) = state.find_mut(PREMIUM_REPO_ID) {
                    source.reset_token(&ctx);
                }
            })
            .await
    }

    /// Re-read stored enabled flags and the forced-hide policy
    pub async fn update_enabled_states(&self) -> Result<(), StoreError> {
        self.manager
            .run_after_update(|state| {
                let stored = state.ctx.store.repos()?;
                for source in &mut state.sources {
                    let id = source.id().to_string();
                    if let Some(row) = stored.iter().find(|r| r.id == id) {
                        source.info_mut().config.enabled = row.enabled;
                    }
                    source.info_mut().forced_hide = state.ctx.compat.should_force_hide(&id);
                }
                Ok(())
            })
            .await
    }
}
