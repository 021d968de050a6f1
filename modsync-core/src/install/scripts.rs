//! Installer scripts shipped inside the binary

use std::io;
use std::path::{Path, PathBuf};

/// A bundled script and the file name it is extracted under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundledScript {
    pub name: &'static str,
    content: &'static str,
}

pub const COMPAT: BundledScript = BundledScript {
    name: "module_installer_compat.sh",
    content: include_str!("../../scripts/module_installer_compat.sh"),
};

pub const WRAPPER: BundledScript = BundledScript {
    name: "module_installer_wrapper.sh",
    content: include_str!("../../scripts/module_installer_wrapper.sh"),
};

pub const ANYKERNEL3: BundledScript = BundledScript {
    name: "anykernel3_installer.sh",
    content: include_str!("../../scripts/anykernel3_installer.sh"),
};

pub const TEST: BundledScript = BundledScript {
    name: "module_installer_test.sh",
    content: include_str!("../../scripts/module_installer_test.sh"),
};

impl BundledScript {
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.name)
    }

    /// Write the script into `dir` unless an identical copy is there
    pub fn extract(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = self.path_in(dir);
        if std::fs::read_to_string(&path).is_ok_and(|current| current == self.content) {
            return Ok(path);
        }
        std::fs::create_dir_all(dir)?;
        std::fs::write(&path, self.content)?;
        tracing::debug!("Extracted {} to {}", self.name, path.display());
        Ok(path)
    }
}
