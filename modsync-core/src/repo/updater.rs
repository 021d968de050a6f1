//! Per-source fetch and commit for one synchronisation cycle

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::premium::strip_session;
use super::source::{RepositorySource, SourceContext, SourceError};
use crate::model::Quality;
use crate::net::hide_token;
use crate::store::ModuleListCacheRow;

/// Work produced by fetching one source
#[derive(Debug, Default)]
pub struct RepoUpdater {
    /// Raw index bytes; `None` when nothing was fetched this cycle
    index_raw: Option<Vec<u8>>,
    /// New or changed module ids that need metadata
    pub to_update: Vec<String>,
    /// Unchanged module ids that can be merged as they are
    pub to_apply: Vec<String>,
    /// Error message when the fetch failed
    pub failed: Option<String>,
}

impl RepoUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetched(&self) -> bool {
        self.index_raw.is_some()
    }

    /// Fetch and parse the source index, returning the number of ids to update
    pub async fn fetch_index(
        &mut self,
        source: &mut RepositorySource,
        ctx: &SourceContext,
        now_ms: i64,
    ) -> usize {
        if !ctx.http.has_connectivity() {
            debug!("Offline, skipping {}", source.id());
            return 0;
        }
        if !source.is_enabled() {
            self.to_update.clear();
            self.to_apply.clear();
            return 0;
        }

        if source.reads_cached_index() && !source.should_update(ctx, now_ms) {
            match ctx.store.module_rows(source.id()) {
                Ok(rows) if !rows.is_empty() => {
                    debug!("Using {} cached rows for {}", rows.len(), source.id());
                    let index = index_from_rows(&rows);
                    match source.populate(&index, ctx).await {
                        Ok(changed) => {
                            self.split(source, changed);
                            return self.to_update.len();
                        }
                        Err(e) => warn!("Cached rows for {} are unusable: {}", source.id(), e),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read cached rows for {}: {}", source.id(), e),
            }
        }

        if !source.prepare(ctx).await {
            debug!("Source {} not prepared, keeping current entries", source.id());
            self.to_update.clear();
            self.to_apply = source.modules().keys().cloned().collect();
            return 0;
        }

        let url = source.index_url(ctx).await;
        info!("Fetching index of {} from {}", source.id(), hide_token(&url));
        match self.download(source, ctx, &url).await {
            Ok(changed) => {
                self.split(source, changed);
                self.to_update.len()
            }
            Err(e) => {
                error!("Failed to get update of {}: {}", source.id(), e);
                source.info_mut().invalidate_all();
                self.index_raw = None;
                self.to_update.clear();
                self.to_apply = source.modules().keys().cloned().collect();
                self.failed = Some(e.to_string());
                0
            }
        }
    }

    async fn download(
        &mut self,
        source: &mut RepositorySource,
        ctx: &SourceContext,
        url: &str,
    ) -> Result<Vec<String>, SourceError> {
        let raw = ctx.http.get(url).await?;
        let index: Value = serde_json::from_slice(&raw)
            .map_err(|e| SourceError::InvalidIndex(e.to_string()))?;
        let changed = source.populate(&index, ctx).await?;
        self.index_raw = Some(raw);
        Ok(changed)
    }

    fn split(&mut self, source: &RepositorySource, changed: Vec<String>) {
        self.to_apply = source
            .modules()
            .keys()
            .filter(|id| !changed.contains(id))
            .cloned()
            .collect();
        self.to_update = changed;
    }

    /// Commit the fetched index to the store
    pub fn finish(
        &mut self,
        source: &mut RepositorySource,
        ctx: &SourceContext,
        now_ms: i64,
    ) -> Result<(), SourceError> {
        if !source.is_enabled() || self.index_raw.take().is_none() {
            return Ok(());
        }

        let id = source.id().to_string();
        let rows: Vec<ModuleListCacheRow> = source
            .modules()
            .values()
            .map(|entry| {
                let meta = &entry.meta;
                ModuleListCacheRow {
                    codename: meta.id.clone(),
                    name: meta.name.clone().unwrap_or_default(),
                    version: meta.version.clone().unwrap_or_default(),
                    version_code: meta.version_code,
                    author: meta.author.clone().unwrap_or_default(),
                    description: meta.description.clone().unwrap_or_default(),
                    min_api: meta.min_api,
                    max_api: meta.max_api,
                    min_magisk: meta.min_magisk,
                    need_ramdisk: meta.need_ramdisk,
                    support: meta.support.clone().unwrap_or_default(),
                    donate: meta.donate.clone().unwrap_or_default(),
                    config: meta.config.clone().unwrap_or_default(),
                    change_boot: meta.change_boot,
                    mmt_reborn: meta.mmt_reborn,
                    repo_id: id.clone(),
                    last_update: meta.last_updated,
                    stats: match meta.quality {
                        Some(Quality::Downloads(n)) => n,
                        Some(Quality::Stars(n)) => n as u64,
                        None => 0,
                    },
                    safe: meta.safe,
                    zip_url: entry.zip_url.as_deref().map(strip_session).unwrap_or_default(),
                    notes_url: entry
                        .notes_url
                        .as_deref()
                        .map(strip_session)
                        .unwrap_or_default(),
                    checksum: entry.checksum.clone().unwrap_or_default(),
                }
            })
            .collect();

        if rows.is_empty() {
            warn!("Index of {} has no modules, dropping cached rows", id);
            ctx.store.delete_module_rows(&id)?;
            return Err(SourceError::EmptyIndex);
        }

        debug!("Committing {} rows for {}", rows.len(), id);
        ctx.store.replace_module_rows(&id, rows)?;
        ctx.store.set_repo_last_update(&id, now_ms)?;
        source.info_mut().config.last_update = now_ms;
        Ok(())
    }
}

/// Index document equivalent to the cached rows; timestamps go back to seconds
fn index_from_rows(rows: &[ModuleListCacheRow]) -> Value {
    let modules: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "codename": row.codename,
                "name": row.name,
                "version": row.version,
                "versionCode": row.version_code,
                "author": row.author,
                "description": row.description,
                "minApi": row.min_api,
                "maxApi": row.max_api,
                "minMagisk": row.min_magisk,
                "needRamdisk": row.need_ramdisk,
                "support": row.support,
                "donate": row.donate,
                "config": row.config,
                "changeBoot": row.change_boot,
                "mmtReborn": row.mmt_reborn,
                "lastUpdate": row.last_update / 1000,
                "stats": row.stats,
                "safe": row.safe,
                "zipUrl": row.zip_url,
                "notesUrl": row.notes_url,
                "checksum": row.checksum,
            })
        })
        .collect();
    json!({ "modules": modules })
}
