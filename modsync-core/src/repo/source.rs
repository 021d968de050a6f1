//! Repository source capability
//!
//! Plain feeds and the premium API share one [`SourceInfo`] record and differ
//! only in `prepare`, `populate` and metadata persistence. The variant is
//! chosen by the [`RepositorySource`] tag.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use super::plain::PlainSource;
use super::premium::PremiumSource;
use crate::compat::CompatTable;
use crate::config::ModsyncConfig;
use crate::model::{CatalogEntry, RepositoryConfig, StatusFlags};
use crate::net::{HttpClient, HttpError};
use crate::store::{CacheStore, StoreError};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Index has no modules")]
    EmptyIndex,

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Collaborators shared by every source
#[derive(Clone)]
pub struct SourceContext {
    pub http: HttpClient,
    pub store: Arc<dyn CacheStore>,
    pub compat: Arc<CompatTable>,
    pub settings: Arc<ModsyncConfig>,
}

/// State common to every source variant
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Persisted row; `name` and the link fields are overrides
    pub config: RepositoryConfig,
    pub default_name: String,
    pub default_website: String,
    pub default_support: Option<String>,
    pub default_donate: Option<String>,
    pub default_submit_module: Option<String>,
    /// Directory holding per-module `.prop` files
    pub cache_root: PathBuf,
    pub modules: HashMap<String, CatalogEntry>,
    /// Repository name as shown on its modules
    pub module_repo_name: String,
    pub forced_hide: bool,
}

impl SourceInfo {
    pub fn new(config: RepositoryConfig, default_name: &str, cache_root: PathBuf) -> Self {
        let default_website = host_of(&config.url)
            .map(|host| format!("https://{host}/"))
            .unwrap_or_else(|| config.url.clone());
        Self {
            config,
            default_name: default_name.to_string(),
            default_website,
            default_support: None,
            default_donate: None,
            default_submit_module: None,
            cache_root,
            modules: HashMap::new(),
            module_repo_name: default_name.to_string(),
            forced_hide: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn name(&self) -> &str {
        match self.config.name.as_deref() {
            Some(name) if is_non_null(name) => name,
            _ if !self.default_name.is_empty() => &self.default_name,
            _ => &self.config.url,
        }
    }

    pub fn website(&self) -> &str {
        match self.config.website.as_deref() {
            Some(site) if is_non_null(site) => site,
            _ => &self.default_website,
        }
    }

    pub fn support(&self) -> Option<&str> {
        pick(self.config.support.as_deref(), self.default_support.as_deref())
    }

    pub fn donate(&self) -> Option<&str> {
        pick(self.config.donate.as_deref(), self.default_donate.as_deref())
    }

    pub fn submit_module(&self) -> Option<&str> {
        pick(
            self.config.submit_module.as_deref(),
            self.default_submit_module.as_deref(),
        )
    }

    /// Stored flag, overridden by the forced-hide policy
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.forced_hide
    }

    pub(crate) fn begin_populate(&mut self) {
        for entry in self.modules.values_mut() {
            entry.processed = false;
        }
    }

    /// Repository-level links advertised by the index itself
    pub(crate) fn apply_index_links(&mut self, index: &Value) {
        self.config.website = opt_string(index, "website").filter(|s| !s.is_empty());
        self.config.support = opt_string(index, "support").filter(|s| !s.is_empty());
        self.config.donate = opt_string(index, "donate").filter(|s| !s.is_empty());
        self.config.submit_module = opt_string(index, "submitModule").filter(|s| !s.is_empty());
    }

    /// Flag every known entry invalid after a failed refresh
    pub(crate) fn invalidate_all(&mut self) {
        for entry in self.modules.values_mut() {
            entry.meta.flags.insert(StatusFlags::METADATA_INVALID);
        }
    }
}

pub enum RepositorySource {
    Plain(PlainSource),
    Premium(PremiumSource),
}

impl RepositorySource {
    pub fn info(&self) -> &SourceInfo {
        match self {
            Self::Plain(s) => &s.info,
            Self::Premium(s) => &s.info,
        }
    }

    pub fn info_mut(&mut self) -> &mut SourceInfo {
        match self {
            Self::Plain(s) => &mut s.info,
            Self::Premium(s) => &mut s.info,
        }
    }

    pub fn id(&self) -> &str {
        self.info().id()
    }

    pub fn name(&self) -> String {
        match self {
            Self::Plain(s) => s.info.name().to_string(),
            Self::Premium(s) => s.display_name(),
        }
    }

    pub fn is_premium(&self) -> bool {
        matches!(self, Self::Premium(_))
    }

    pub fn is_enabled(&self) -> bool {
        self.info().is_enabled()
    }

    pub fn modules(&self) -> &HashMap<String, CatalogEntry> {
        &self.info().modules
    }

    /// Pre-flight for this cycle; `false` skips the fetch
    pub async fn prepare(&mut self, ctx: &SourceContext) -> bool {
        match self {
            Self::Plain(_) => true,
            Self::Premium(s) => s.prepare(ctx).await,
        }
    }

    /// URL the index is fetched from, credentials included
    pub async fn index_url(&mut self, ctx: &SourceContext) -> String {
        match self {
            Self::Plain(s) => s.info.url().to_string(),
            Self::Premium(s) => s.index_url(ctx).await,
        }
    }

    /// Parse an index, returning the ids of new or changed entries
    pub async fn populate(
        &mut self,
        index: &Value,
        ctx: &SourceContext,
    ) -> Result<Vec<String>, SourceError> {
        match self {
            Self::Plain(s) => s.populate(index),
            Self::Premium(s) => s.populate(index, ctx).await,
        }
    }

    /// Freshness policy: refresh once the last commit is older than the window
    pub fn should_update(&self, ctx: &SourceContext, now_ms: i64) -> bool {
        let id = self.id();
        let repo = match ctx.store.repo(id) {
            Ok(Some(repo)) => repo,
            Ok(None) => return true,
            Err(e) => {
                tracing::warn!("Failed to read repo row for {}: {}", id, e);
                return true;
            }
        };
        let has_rows = ctx
            .store
            .module_rows(id)
            .map(|rows| !rows.is_empty())
            .unwrap_or(false);
        if repo.last_update == 0 || !has_rows {
            tracing::debug!("Repo {} has no cached index", id);
            return true;
        }
        let minutes = (now_ms - repo.last_update) / 60_000;
        tracing::debug!("Repo {} updated {} minutes ago", id, minutes);
        minutes > ctx.settings.repo_refresh_minutes()
    }

    /// Whether a fresh cached index may replace the network fetch
    pub fn reads_cached_index(&self) -> bool {
        self.is_premium()
    }

    pub fn store_metadata(&self, module_id: &str, data: &[u8]) -> Result<(), SourceError> {
        match self {
            Self::Plain(s) => s.store_metadata(module_id, data),
            Self::Premium(_) => Ok(()),
        }
    }

    pub fn try_load_metadata(&mut self, module_id: &str, compat: &CompatTable) -> bool {
        match self {
            Self::Plain(s) => s.try_load_metadata(module_id, compat),
            Self::Premium(s) => s.try_load_metadata(module_id),
        }
    }
}

/// Host part of an absolute URL
pub(crate) fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let host = rest.split(['/', '?', '#']).next()?;
    (!host.is_empty()).then_some(host)
}

/// Drop " (Official)", " [Official]" and bare "Official" from a repo name
pub(crate) fn strip_official(name: &str) -> String {
    let name = name.trim();
    let name = name
        .strip_suffix(" (Official)")
        .or_else(|| name.strip_suffix(" [Official]"))
        .unwrap_or(name);
    if name.contains("Official") {
        name.replace("Official", "").trim().to_string()
    } else {
        name.to_string()
    }
}

/// String value of a key; numbers and booleans are rendered, null is absent
pub(crate) fn opt_string(obj: &Value, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn opt_i64(obj: &Value, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn opt_bool(obj: &Value, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        _ => None,
    }
}

fn is_non_null(value: &str) -> bool {
    !value.is_empty() && value != "null"
}

fn pick<'a>(value: Option<&'a str>, fallback: Option<&'a str>) -> Option<&'a str> {
    match value {
        Some(v) if is_non_null(v) => Some(v),
        _ => fallback,
    }
}
