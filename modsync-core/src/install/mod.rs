//! Module installation
//!
//! [`InstallPipeline`] takes an [`InstallRequest`] through
//! `downloading -> validating -> patching -> installing` and always ends in
//! a terminal [`InstallState`]. The install itself runs as one shell session
//! whose standard output drives a [`Controller`] and whose error output is
//! watched by a [`Monitor`].

pub mod archive;
mod controller;
mod error;
mod monitor;
mod pipeline;
mod request;
pub mod scripts;
mod shell;
mod strategy;

pub use controller::{Controller, TerminalEvent, TerminalListener};
pub use error::{
    InstallError, InstallState, MSG_DANGEROUS_ID, MSG_INSTALL_FAILED, MSG_INTEGRITY,
    MSG_MISSING_ID, MSG_NOT_A_MODULE, MSG_NO_MAGISK_PATH, MSG_SUCCESS, MSG_TOO_LARGE,
};
pub use monitor::Monitor;
pub use pipeline::{
    CancelToken, InstallObserver, InstallOutcome, InstallPipeline, NoObserver, MAX_ARCHIVE_BYTES,
};
pub use request::{InstallRequest, InstallSource};
pub use shell::{ProcessShell, ShellLine, ShellRunner};
pub use strategy::{
    InstallEnv, InstallPlan, InstallStrategy, Planner, ANSI_CMD_SUPPORT,
    MAGISK_VER_CODE_INSTALL_COMMAND,
};
