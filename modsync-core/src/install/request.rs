//! Install requests and where their archive comes from

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use super::error::InstallError;
use crate::config::ModsyncConfig;

/// Sequences removed from a target before it is resolved
const STRIPPED_SEQUENCES: [&str; 4] = ["%252E%252E", "%2E%2E", "..", "%20"];

/// What the user asked to install
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallRequest {
    /// `https://` URL or a path inside the app's data or cache directory
    pub target: String,
    /// Display name used in terminal lines
    pub name: String,
    /// Optional hex checksum of the archive
    pub checksum: Option<String>,
    pub no_extensions: bool,
    /// Run the bundled test installer without root
    pub test_rootless: bool,
    /// Request the MMT-Reborn runtime
    pub mmt_reborn: bool,
}

/// Resolved archive location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Url(String),
    Local(PathBuf),
}

impl InstallRequest {
    pub fn new(target: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Target with traversal and encoded-space sequences removed
    pub fn sanitized_target(&self) -> String {
        let mut target = self.target.trim().to_string();
        loop {
            let before = target.len();
            for seq in STRIPPED_SEQUENCES {
                target = target.replace(seq, "");
            }
            if target.len() == before {
                break;
            }
        }
        target
    }

    /// Resolve the target, refusing anything outside the allowed locations
    pub fn resolve(&self, settings: &ModsyncConfig) -> Result<InstallSource, InstallError> {
        let target = self.sanitized_target();
        if target.is_empty() {
            return Err(InstallError::downloading("! No install target given"));
        }
        if target.starts_with("https://") {
            return Ok(InstallSource::Url(target));
        }
        if target.contains("://") {
            return Err(InstallError::downloading(format!(
                "! Unsupported install target: {target}"
            )));
        }

        let path = PathBuf::from(&target);
        let allowed = path.is_absolute()
            && path.components().all(|c| c != Component::ParentDir)
            && [&settings.data_dir, &settings.cache_dir]
                .iter()
                .any(|root| is_strictly_under(&path, root));
        if !allowed {
            return Err(InstallError::downloading(format!(
                "! Refusing to install from {target}"
            )));
        }
        Ok(InstallSource::Local(path))
    }

    /// Name shown in terminal lines, falling back to the target's file name
    pub fn display_name(&self) -> &str {
        if !self.name.trim().is_empty() {
            return &self.name;
        }
        self.target
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.target)
    }
}

fn is_strictly_under(path: &Path, root: &Path) -> bool {
    path != root && path.starts_with(root)
}
