//! Component wiring shared by every command

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use modsync_core::compat::CompatTable;
use modsync_core::config::ModsyncConfig;
use modsync_core::install::{InstallPipeline, ProcessShell, ShellRunner};
use modsync_core::local::{LocalFs, LocalModuleScanner, RootFs};
use modsync_core::net::HttpClient;
use modsync_core::repo::{HostFingerprint, RepositoryAggregator, SourceContext};
use modsync_core::store::{CacheStore, JsonFileStore};

/// Loaded configuration plus the collaborators every component shares
pub struct App {
    pub settings: Arc<ModsyncConfig>,
    pub store: Arc<dyn CacheStore>,
    pub compat: Arc<CompatTable>,
    pub http: HttpClient,
    pub fs: Arc<dyn RootFs>,
}

impl App {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let settings = match config_path {
            Some(path) => ModsyncConfig::load_from_path(path)?,
            None => ModsyncConfig::load()?,
        };
        debug!(
            "Using data dir {} and cache dir {}",
            settings.data_dir.display(),
            settings.cache_dir.display()
        );

        let store = JsonFileStore::open(&settings.data_dir).with_context(|| {
            format!("Failed to open store in {}", settings.data_dir.display())
        })?;
        let compat = CompatTable::load_from_path(&settings.compat_file())?;
        let http = HttpClient::with_user_agent(&settings.user_agent)
            .context("Failed to build HTTP client")?;

        Ok(Self {
            settings: Arc::new(settings),
            store: Arc::new(store),
            compat: Arc::new(compat),
            http,
            fs: Arc::new(LocalFs),
        })
    }

    pub fn aggregator(&self) -> Result<RepositoryAggregator> {
        let ctx = SourceContext {
            http: self.http.clone(),
            store: Arc::clone(&self.store),
            compat: Arc::clone(&self.compat),
            settings: Arc::clone(&self.settings),
        };
        RepositoryAggregator::new(ctx, Arc::new(HostFingerprint))
            .context("Failed to load repositories")
    }

    pub fn scanner(&self) -> LocalModuleScanner {
        LocalModuleScanner::new(
            Arc::clone(&self.fs),
            Arc::clone(&self.store),
            Arc::clone(&self.compat),
            Arc::clone(&self.settings),
            self.http.clone(),
        )
    }

    /// Rootless test installs run in a plain `sh`, everything else under `su`
    pub fn pipeline(&self, rootless: bool) -> InstallPipeline {
        let shell: Arc<dyn ShellRunner> = if rootless {
            Arc::new(ProcessShell::plain())
        } else {
            Arc::new(ProcessShell::root())
        };
        InstallPipeline::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.compat),
            self.http.clone(),
            Arc::clone(&self.fs),
            shell,
        )
    }
}
