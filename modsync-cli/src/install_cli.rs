//! `modsync install`

use anyhow::{bail, Context, Result};
use clap::Args;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::app::App;
use modsync_core::config::ModsyncConfig;
use modsync_core::install::{InstallObserver, InstallRequest, InstallState, TerminalEvent};

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Module zip path or https:// URL
    pub target: String,

    /// Name shown while installing
    #[clap(long)]
    pub name: Option<String>,

    /// Expected md5/sha1/sha256/sha512 hex digest of the zip
    #[clap(long)]
    pub checksum: Option<String>,

    /// Ignore installer terminal extension commands
    #[clap(long)]
    pub no_extensions: bool,

    /// Run the bundled test installer without root
    #[clap(long)]
    pub test_rootless: bool,

    /// Request the MMT-Reborn installer runtime
    #[clap(long)]
    pub mmt_reborn: bool,
}

impl InstallArgs {
    pub async fn execute(self, app: &App) -> Result<()> {
        let target = if self.target.contains("://") {
            self.target.clone()
        } else {
            import_local_zip(&app.settings, Path::new(&self.target))?
                .display()
                .to_string()
        };

        let mut request = InstallRequest::new(target, self.name.clone().unwrap_or_default());
        if request.name.is_empty() {
            request.name = self
                .target
                .rsplit('/')
                .find(|s| !s.is_empty())
                .unwrap_or(&self.target)
                .to_string();
        }
        request.checksum = self.checksum;
        request.no_extensions = self.no_extensions;
        request.test_rootless = self.test_rootless;
        request.mmt_reborn = self.mmt_reborn;

        let pipeline = app.pipeline(self.test_rootless);
        let cancel = pipeline.cancel_token();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling install...");
                cancel.cancel();
            }
        });

        let outcome = pipeline.install(&request, &TerminalPrinter).await;
        ctrl_c.abort();

        println!("{}", outcome.message);
        if let Some(link) = &outcome.support_link {
            println!("Support: {link}");
        }
        if outcome.warn_reboot {
            println!("- Reboot to apply the installed module");
        }
        match outcome.state {
            InstallState::Success => Ok(()),
            InstallState::Cancelled => bail!("Install cancelled"),
            _ => bail!("Install failed"),
        }
    }
}

/// Copy a user-supplied zip into the install scratch area so the pipeline
/// only ever reads from directories it owns
fn import_local_zip(settings: &ModsyncConfig, source: &Path) -> Result<PathBuf> {
    let source = source
        .canonicalize()
        .with_context(|| format!("Cannot open {}", source.display()))?;
    if !source.is_file() {
        bail!("{} is not a file", source.display());
    }
    let file_name = source
        .file_name()
        .context("Install target has no file name")?;
    let import_dir = settings.install_dir().join("import");
    std::fs::create_dir_all(&import_dir)
        .with_context(|| format!("Failed to create {}", import_dir.display()))?;
    let dest = import_dir.join(file_name);
    if dest != source {
        std::fs::copy(&source, &dest).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), dest.display())
        })?;
    }
    debug!("Imported {} as {}", source.display(), dest.display());
    Ok(dest)
}

/// Prints installer terminal events to stdout
struct TerminalPrinter;

impl InstallObserver for TerminalPrinter {
    fn on_state(&self, state: InstallState) {
        debug!("Install state: {}", state);
    }

    fn on_download_progress(&self, done: u32, total: u32) {
        if total > 0 {
            eprint!("\rDownloading... {:>3}%", u64::from(done) * 100 / u64::from(total));
            if done >= total {
                eprintln!();
            }
            let _ = std::io::stderr().flush();
        }
    }

    fn on_terminal(&self, event: &TerminalEvent) {
        match event {
            TerminalEvent::AddLine(line) => println!("{line}"),
            TerminalEvent::SetLastLine(line) => println!("{line}"),
            TerminalEvent::Clear => println!(),
            TerminalEvent::SetProgress(value) => debug!("Installer progress {}", value),
            TerminalEvent::ShowProgress(max) => debug!("Installer progress shown, max {:?}", max),
            TerminalEvent::SetAnsi(enabled) => debug!("ANSI output {}", enabled),
            TerminalEvent::ScrollUp | TerminalEvent::ScrollDown | TerminalEvent::HideProgress => {}
        }
        if std::io::stdout().flush().is_err() {
            warn!("Failed to flush installer output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_import_copies_into_install_dir() {
        let dir = TempDir::new().unwrap();
        let settings = ModsyncConfig::rooted_at(dir.path());
        let zip = dir.path().join("downloads").join("module.zip");
        std::fs::create_dir_all(zip.parent().unwrap()).unwrap();
        std::fs::write(&zip, b"PK").unwrap();

        let imported = import_local_zip(&settings, &zip).unwrap();
        assert!(imported.starts_with(settings.install_dir()));
        assert_eq!(std::fs::read(&imported).unwrap(), b"PK");
    }

    #[test]
    fn test_import_missing_file() {
        let dir = TempDir::new().unwrap();
        let settings = ModsyncConfig::rooted_at(dir.path());
        assert!(import_local_zip(&settings, &dir.path().join("nope.zip")).is_err());
    }
}
