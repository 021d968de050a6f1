//! Install failures and pipeline states

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline state. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Downloading,
    Validating,
    Patching,
    Installing,
    Success,
    Failed,
    Cancelled,
}

impl InstallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Downloading => "downloading",
            Self::Validating => "validating",
            Self::Patching => "patching",
            Self::Installing => "installing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

pub const MSG_SUCCESS: &str = "- Install successful";
pub const MSG_INSTALL_FAILED: &str = "! Install failed";
pub const MSG_DANGEROUS_ID: &str = "! This module contain a dangerous moduleId";
pub const MSG_MISSING_ID: &str = "! Magisk modules require a moduleId";
pub const MSG_NO_MAGISK_PATH: &str = "! Unable to resolve magisk path";
pub const MSG_NOT_A_MODULE: &str = "! File is not a valid Magisk module or AnyKernel3 zip";
pub const MSG_INTEGRITY: &str = "! File integrity check failed";
pub const MSG_TOO_LARGE: &str = "! Module is too large to be loaded on this device";

/// A stage failure with the line shown to the user
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct InstallError {
    /// State the pipeline was in when it failed
    pub stage: InstallState,
    pub message: String,
}

impl InstallError {
    pub fn new(stage: InstallState, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    pub fn downloading(message: impl Into<String>) -> Self {
        Self::new(InstallState::Downloading, message)
    }

    pub fn validating(message: impl Into<String>) -> Self {
        Self::new(InstallState::Validating, message)
    }

    pub fn patching(message: impl Into<String>) -> Self {
        Self::new(InstallState::Patching, message)
    }

    pub fn installing(message: impl Into<String>) -> Self {
        Self::new(InstallState::Installing, message)
    }
}
