//! Download, validate, patch and install one module archive

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::archive::{self, ArchiveInfo};
use super::controller::{Controller, TerminalEvent, TerminalListener};
use super::error::{
    InstallError, InstallState, MSG_INTEGRITY, MSG_NOT_A_MODULE, MSG_SUCCESS, MSG_TOO_LARGE,
};
use super::monitor::Monitor;
use super::request::{InstallRequest, InstallSource};
use super::shell::{ShellLine, ShellRunner};
use super::strategy::{InstallEnv, InstallPlan, InstallStrategy, Planner};
use crate::checksum;
use crate::compat::CompatTable;
use crate::config::ModsyncConfig;
use crate::local::RootFs;
use crate::net::{hide_token, HttpClient};

/// Largest archive the pipeline will hold in memory
pub const MAX_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;

/// Archive name inside the install directory
const MODULE_ZIP: &str = "module.zip";

/// Last line some busybox builds print when an install that exits non-zero
/// actually succeeded
const BUSYBOX_DONE: &str = "Done!";

/// Receives pipeline progress; may be called from any thread
pub trait InstallObserver: Send + Sync {
    fn on_state(&self, _state: InstallState) {}
    fn on_download_progress(&self, _done: u32, _total: u32) {}
    fn on_terminal(&self, _event: &TerminalEvent) {}
}

/// Ignores everything
pub struct NoObserver;

impl InstallObserver for NoObserver {}

struct ObserverTerminal<'a>(&'a dyn InstallObserver);

impl TerminalListener for ObserverTerminal<'_> {
    fn on_event(&self, event: &TerminalEvent) {
        self.0.on_terminal(event)
    }
}

/// Cooperative cancellation shared with the caller
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How an install ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    /// Always terminal
    pub state: InstallState,
    pub message: String,
    pub support_link: Option<String>,
    pub module_id: Option<String>,
    pub strategy: Option<InstallStrategy>,
    pub warn_reboot: bool,
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        self.state == InstallState::Success
    }

    fn failed(error: InstallError) -> Self {
        warn!("Install failed while {}: {}", error.stage, error.message);
        Self {
            state: InstallState::Failed,
            message: error.message,
            support_link: None,
            module_id: None,
            strategy: None,
            warn_reboot: false,
        }
    }

    fn cancelled() -> Self {
        Self {
            state: InstallState::Cancelled,
            message: "! Install cancelled".to_string(),
            support_link: None,
            module_id: None,
            strategy: None,
            warn_reboot: false,
        }
    }
}

/// Archive ready to hand to the shell
struct Prepared {
    zip: PathBuf,
    plan: InstallPlan,
}

/// Tracks the current state of one run and reports every transition
struct Run<'a> {
    state: InstallState,
    observer: &'a dyn InstallObserver,
}

impl<'a> Run<'a> {
    fn new(observer: &'a dyn InstallObserver) -> Self {
        observer.on_state(InstallState::Downloading);
        Self {
            state: InstallState::Downloading,
            observer,
        }
    }

    fn advance(&mut self, next: InstallState) {
        debug_assert!(!self.state.is_terminal(), "{} is terminal", self.state);
        debug!("Install state {} -> {}", self.state, next);
        self.state = next;
        self.observer.on_state(next);
    }

    fn line(&self, text: impl Into<String>) {
        self.observer.on_terminal(&TerminalEvent::AddLine(text.into()));
    }

    fn finish(mut self, outcome: InstallOutcome) -> InstallOutcome {
        self.advance(outcome.state);
        outcome
    }
}

/// Installs module archives through a privileged shell
pub struct InstallPipeline {
    settings: Arc<ModsyncConfig>,
    compat: Arc<CompatTable>,
    http: HttpClient,
    fs: Arc<dyn RootFs>,
    shell: Arc<dyn ShellRunner>,
    env: InstallEnv,
    cancel: CancelToken,
}

impl InstallPipeline {
    pub fn new(
        settings: Arc<ModsyncConfig>,
        compat: Arc<CompatTable>,
        http: HttpClient,
        fs: Arc<dyn RootFs>,
        shell: Arc<dyn ShellRunner>,
    ) -> Self {
        Self {
            settings,
            compat,
            http,
            fs,
            shell,
            env: InstallEnv::detect(),
            cancel: CancelToken::default(),
        }
    }

    pub fn with_env(mut self, env: InstallEnv) -> Self {
        self.env = env;
        self
    }

    /// Token that cancels the run at its next checkpoint
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the whole pipeline. The outcome is always terminal.
    #[instrument(skip_all, name = "install", fields(target = %hide_token(&request.target)))]
    pub async fn install(
        &self,
        request: &InstallRequest,
        observer: &dyn InstallObserver,
    ) -> InstallOutcome {
        let mut run = Run::new(observer);
        let prepared = match self.prepare(request, &mut run).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return run.finish(InstallOutcome::cancelled()),
            Err(e) => return run.finish(InstallOutcome::failed(e)),
        };
        if self.cancel.is_cancelled() {
            return run.finish(InstallOutcome::cancelled());
        }

        run.advance(InstallState::Installing);
        run.line(format!("- Installing {}", request.display_name()));
        let outcome = match self.execute(&prepared, &run).await {
            Ok(outcome) => outcome,
            Err(e) => InstallOutcome::failed(e),
        };
        if outcome.is_success() {
            info!("Installed {}", request.display_name());
        }
        run.finish(outcome)
    }

    /// Download, validate and patch. `None` when cancelled.
    async fn prepare(
        &self,
        request: &InstallRequest,
        run: &mut Run<'_>,
    ) -> Result<Option<Prepared>, InstallError> {
        let source = request.resolve(&self.settings)?;
        let mut bytes = self.download(&source, request, run).await?;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        run.advance(InstallState::Validating);
        if let Some(expected) = request.checksum.as_deref().filter(|c| !c.trim().is_empty()) {
            run.line("- Checking file integrity");
            if let Err(e) = checksum::verify(&bytes, expected) {
                warn!("{}", e);
                return Err(InstallError::validating(MSG_INTEGRITY));
            }
        }
        if archive::fix_header_quirk(&mut bytes) {
            debug!("Repaired archive header");
        }
        let invalid_zip = |e: archive::ArchiveError| {
            debug!("{}", e);
            InstallError::validating("File is not a valid zip file")
        };
        if let Some(rehomed) = archive::rehome(&bytes).map_err(invalid_zip)? {
            bytes = rehomed;
        }
        let names = archive::entry_names(&bytes).map_err(invalid_zip)?;
        let classification =
            archive::classify(&names).ok_or_else(|| InstallError::validating(MSG_NOT_A_MODULE))?;
        debug!("Archive classified as {:?}", classification);

        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        run.advance(InstallState::Patching);
        if classification.needs_patch {
            run.line(format!("- Patching {}", request.display_name()));
            bytes = archive::patch(&bytes).map_err(|e| {
                error!("{}", e);
                InstallError::patching("Failed to patch module zip")
            })?;
        }

        let work_dir = self.settings.install_dir();
        let zip = work_dir.join(MODULE_ZIP);
        write_file(&zip, &bytes)
            .await
            .map_err(|_| InstallError::patching("Failed to save module zip"))?;

        let info = archive::inspect(&bytes).unwrap_or_else(|e| {
            debug!("Failed to inspect archive: {}", e);
            ArchiveInfo::default()
        });
        let planner = Planner::new(&self.settings, &self.compat, &self.env);
        let plan = if request.test_rootless {
            extract_customize(&bytes, &work_dir).await;
            planner.plan_rootless(&zip, &work_dir)
        } else {
            planner.plan(&info, request, &zip, &work_dir)?
        };
        Ok(Some(Prepared { zip, plan }))
    }

    async fn download(
        &self,
        source: &InstallSource,
        request: &InstallRequest,
        run: &Run<'_>,
    ) -> Result<Vec<u8>, InstallError> {
        const FAILED: &str = "Failed to download module zip";
        let bytes = match source {
            InstallSource::Url(url) => {
                run.line(format!("- Downloading {}", request.display_name()));
                info!("Downloading: {}", hide_token(url));
                let observer = run.observer;
                let progress = |done: u32, total: u32| observer.on_download_progress(done, total);
                self.http
                    .get_with_progress(url, &progress)
                    .await
                    .map_err(|e| {
                        error!("{}", e);
                        InstallError::downloading(FAILED)
                    })?
            }
            InstallSource::Local(path) => {
                info!("Loading: {}", path.display());
                let len = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| {
                        error!("Cannot stat {}: {}", path.display(), e);
                        InstallError::downloading(FAILED)
                    })?
                    .len();
                if len > MAX_ARCHIVE_BYTES {
                    return Err(InstallError::downloading(MSG_TOO_LARGE));
                }
                tokio::fs::read(path).await.map_err(|e| {
                    error!("Cannot read {}: {}", path.display(), e);
                    InstallError::downloading(FAILED)
                })?
            }
        };
        if bytes.len() as u64 > MAX_ARCHIVE_BYTES {
            return Err(InstallError::downloading(MSG_TOO_LARGE));
        }
        Ok(bytes)
    }

    async fn execute(
        &self,
        prepared: &Prepared,
        run: &Run<'_>,
    ) -> Result<InstallOutcome, InstallError> {
        let plan = &prepared.plan;
        if let Some(script) = plan.script {
            let dir = self.settings.install_dir();
            script.extract(&dir).map_err(|e| {
                error!("Failed to extract {}: {}", script.name, e);
                InstallError::installing(format!("! Failed to extract {}", script.name))
            })?;
        }

        let terminal = ObserverTerminal(run.observer);
        let mut controller = Controller::new(&terminal, &prepared.zip, plan.no_extensions);
        if plan.use_recovery {
            controller.use_recovery_ext();
        }
        controller.set_ansi(plan.ansi);
        let mut monitor = Monitor::new(&plan.executable, &self.settings.modules_update_dir());
        monitor.set_for_cleanup(plan.module_id.clone());

        info!("Installing with {:?}", plan.strategy);
        let result = self
            .shell
            .run(&plan.commands, &mut |line| match line {
                ShellLine::Stdout(line) => controller.on_line(&line),
                ShellLine::Stderr(line) => monitor.on_line(&line),
            })
            .await;
        controller.disable();

        let mut success = match result {
            Ok(success) => success,
            Err(e) => {
                error!("Install shell failed: {}", e);
                false
            }
        };
        let mut message = MSG_SUCCESS.to_string();
        if !success {
            if controller.last_line().trim() == BUSYBOX_DONE {
                debug!("Treating busybox \"Done!\" as success");
                success = true;
            } else {
                message = monitor.cleanup(self.fs.as_ref());
            }
        }

        if self.cancel.is_cancelled() {
            return Ok(InstallOutcome {
                module_id: plan.module_id.clone(),
                strategy: Some(plan.strategy),
                ..InstallOutcome::cancelled()
            });
        }
        Ok(InstallOutcome {
            state: if success {
                InstallState::Success
            } else {
                InstallState::Failed
            },
            message,
            support_link: Some(controller.support_link().to_string()).filter(|l| !l.is_empty()),
            module_id: plan.module_id.clone(),
            strategy: Some(plan.strategy),
            warn_reboot: success && plan.warn_reboot,
        })
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await.inspect_err(|e| {
        error!("Failed to write {}: {}", path.display(), e);
    })
}

/// Rootless runs source `customize.sh` from the working directory
async fn extract_customize(bytes: &[u8], work_dir: &Path) {
    let content = {
        let Ok(mut zip) = zip::ZipArchive::new(std::io::Cursor::new(bytes)) else {
            return;
        };
        let Ok(mut entry) = zip.by_name("customize.sh") else {
            return;
        };
        let mut content = Vec::new();
        if std::io::Read::read_to_end(&mut entry, &mut content).is_err() {
            return;
        }
        content
    };
    if let Err(e) = write_file(&work_dir.join("customize.sh"), &content).await {
        debug!("No customize.sh for test install: {}", e);
    }
}
