//! Install script control protocol
//!
//! Install scripts talk back through their standard output. Once a script
//! prints `#!useExt`, lines of the form `#!<command> [arg]` drive the
//! terminal and progress bar instead of being shown. Kernel packages use
//! the recovery convention `progress <current> <max>` instead.

use serde::Serialize;
use std::path::Path;
use tracing::trace;

/// Scale of the recovery progress bar
const RECOVERY_SCALE: u32 = 256;

/// Something the terminal or progress bar should do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "value", rename_all = "snake_case")]
pub enum TerminalEvent {
    AddLine(String),
    SetLastLine(String),
    Clear,
    ScrollUp,
    ScrollDown,
    /// Show the progress bar; `None` means indeterminate
    ShowProgress(Option<u32>),
    SetProgress(u32),
    HideProgress,
    SetAnsi(bool),
}

/// Receives terminal events; may be called from any thread
pub trait TerminalListener: Send + Sync {
    fn on_event(&self, event: &TerminalEvent);
}

impl<F> TerminalListener for F
where
    F: Fn(&TerminalEvent) + Send + Sync,
{
    fn on_event(&self, event: &TerminalEvent) {
        self(event)
    }
}

/// Interprets one install session's standard output
pub struct Controller<'a> {
    listener: &'a dyn TerminalListener,
    module_path: String,
    module_name: String,
    no_extension: bool,
    enabled: bool,
    use_ext: bool,
    use_recovery: bool,
    recovery_bar: bool,
    support_link: String,
    last_line: String,
}

impl<'a> Controller<'a> {
    pub fn new(listener: &'a dyn TerminalListener, module_file: &Path, no_extension: bool) -> Self {
        let module_name = module_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            listener,
            module_path: module_file.display().to_string(),
            module_name,
            no_extension,
            enabled: true,
            use_ext: false,
            use_recovery: false,
            recovery_bar: false,
            support_link: String::new(),
            last_line: String::new(),
        }
    }

    /// Accept recovery style `progress` lines
    pub fn use_recovery_ext(&mut self) {
        self.use_recovery = true;
    }

    pub fn support_link(&self) -> &str {
        &self.support_link
    }

    /// Last line currently shown on the terminal
    pub fn last_line(&self) -> &str {
        &self.last_line
    }

    /// Show a line that did not come from the script
    pub fn add_line(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.last_line.clone_from(&line);
        self.emit(TerminalEvent::AddLine(line));
    }

    pub fn set_ansi(&self, enabled: bool) {
        self.emit(TerminalEvent::SetAnsi(enabled));
    }

    pub fn on_line(&mut self, line: &str) {
        if !self.enabled {
            return;
        }
        trace!("MSG: {}", line);
        if line.trim() == "#!useExt" && !self.no_extension {
            self.use_ext = true;
            return;
        }

        if self.use_ext {
            if let Some(command) = line.strip_prefix("#!") {
                self.process_command(command);
                return;
            }
        }
        if self.use_recovery {
            if let Some(args) = line.strip_prefix("progress ") {
                self.recovery_progress(args);
                return;
            }
        }
        let shown = line.replace(&self.module_path, &self.module_name);
        self.add_line(shown);
    }

    /// Stop interpreting output, completing a recovery progress bar
    pub fn disable(&mut self) {
        self.enabled = false;
        if self.recovery_bar {
            self.emit(TerminalEvent::SetProgress(RECOVERY_SCALE));
        }
    }

    fn emit(&self, event: TerminalEvent) {
        self.listener.on_event(&event);
    }

    fn recovery_progress(&mut self, args: &str) {
        let mut tokens = args.split(' ').filter(|t| !t.is_empty());
        let (Some(progress), Some(max)) = (tokens.next(), tokens.next()) else {
            return;
        };
        let (Ok(progress), Ok(max)) = (progress.parse::<f32>(), max.parse::<f32>()) else {
            return;
        };
        if max <= 0.0 {
            return;
        }
        let value = if progress >= max {
            RECOVERY_SCALE
        } else {
            (RECOVERY_SCALE as f32 * progress.max(0.0) / max) as u32
        };
        self.emit(TerminalEvent::ShowProgress(Some(RECOVERY_SCALE)));
        self.emit(TerminalEvent::SetProgress(value));
        self.recovery_bar = true;
    }

    fn process_command(&mut self, raw: &str) {
        let (command, arg) = match raw.split_once(' ') {
            Some((command, arg)) if !arg.is_empty() => (command, arg.trim()),
            _ => (raw, ""),
        };
        match command {
            "useRecovery" => self.use_recovery = true,
            "addLine" => self.add_line(arg),
            "setLastLine" => {
                self.last_line = arg.to_string();
                self.emit(TerminalEvent::SetLastLine(arg.to_string()));
            }
            "clearTerminal" => {
                self.last_line.clear();
                self.emit(TerminalEvent::Clear);
            }
            "scrollUp" => self.emit(TerminalEvent::ScrollUp),
            "scrollDown" => self.emit(TerminalEvent::ScrollDown),
            "showLoading" => {
                self.recovery_bar = false;
                let max = arg.parse::<i16>().ok().filter(|m| *m > 0).map(|m| m as u32);
                self.emit(TerminalEvent::ShowProgress(max));
            }
            "setLoading" => {
                self.recovery_bar = false;
                if let Ok(value) = arg.parse::<u16>() {
                    self.emit(TerminalEvent::SetProgress(u32::from(value)));
                }
            }
            "hideLoading" => {
                self.recovery_bar = false;
                self.emit(TerminalEvent::HideProgress);
            }
            "setSupportLink" => {
                if is_valid_support_link(arg) {
                    self.support_link = arg.to_string();
                }
            }
            "disableANSI" => self.emit(TerminalEvent::SetAnsi(false)),
            other => trace!("Unknown install command {}", other),
        }
    }
}

/// Empty, or `https://` with a path after the host
fn is_valid_support_link(link: &str) -> bool {
    link.is_empty()
        || (link.starts_with("https://") && link.get(9..).is_some_and(|rest| rest.contains('/')))
}
