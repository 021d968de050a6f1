//! Failure cleanup for install sessions

use std::path::{Path, PathBuf};
use tracing::{error, trace};

use super::error::MSG_INSTALL_FAILED;
use crate::local::RootFs;
use crate::model::is_dangerous_id;

/// Watches an install session's error output.
///
/// When the installer dies on a shell error inside a module it was
/// unpacking, the last error line names that module's staging directory,
/// which is removed so that no half-installed update is applied at boot.
pub struct Monitor {
    error_prefix: String,
    update_dir: PathBuf,
    last_line: String,
    for_cleanup: Option<String>,
}

impl Monitor {
    pub fn new(executable: &Path, modules_update_dir: &Path) -> Self {
        Self {
            error_prefix: format!(
                "{}: {}/",
                executable.display(),
                modules_update_dir.display()
            ),
            update_dir: modules_update_dir.to_path_buf(),
            last_line: String::new(),
            for_cleanup: None,
        }
    }

    /// Module whose staging directory is removed on a generic failure
    pub fn set_for_cleanup(&mut self, module_id: Option<String>) {
        self.for_cleanup = module_id;
    }

    pub fn on_line(&mut self, line: &str) {
        trace!("Monitor: {}", line);
        self.last_line = line.to_string();
    }

    /// Remove what a failed session left behind and describe the failure
    pub fn cleanup(&self, fs: &dyn RootFs) -> String {
        if let Some(rest) = self.last_line.strip_prefix(self.error_prefix.as_str()) {
            let Some((module, message)) = rest.split_once('/') else {
                return MSG_INSTALL_FAILED.to_string();
            };
            if is_dangerous_id(module) {
                return MSG_INSTALL_FAILED.to_string();
            }
            let staged = self.update_dir.join(module);
            if fs.exists(&staged) {
                remove_staged(fs, &staged);
                return format!("Error: {message}");
            }
        } else if let Some(module) = self.for_cleanup.as_deref() {
            let staged = self.update_dir.join(module);
            if fs.exists(&staged) {
                remove_staged(fs, &staged);
            }
        }
        MSG_INSTALL_FAILED.to_string()
    }
}

fn remove_staged(fs: &dyn RootFs, staged: &Path) {
    if let Err(e) = fs.remove_all(staged) {
        error!("Failed to delete failed update {}: {}", staged.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFs;
    use tempfile::TempDir;

    fn staged(dir: &TempDir, id: &str) -> PathBuf {
        let path = dir.path().join("modules_update").join(id);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn test_script_error_removes_named_module() {
        let dir = TempDir::new().unwrap();
        let broken = staged(&dir, "broken_mod");
        let mut monitor = Monitor::new(
            Path::new("/cache/module_installer_compat.sh"),
            &dir.path().join("modules_update"),
        );
        monitor.on_line("some earlier noise");
        monitor.on_line(&format!(
            "/cache/module_installer_compat.sh: {}/broken_mod/customize.sh: line 3: syntax error",
            dir.path().join("modules_update").display()
        ));

        assert_eq!(
            monitor.cleanup(&LocalFs),
            "Error: customize.sh: line 3: syntax error"
        );
        assert!(!broken.exists());
    }

    #[test]
    fn test_generic_failure_cleans_expected_module() {
        let dir = TempDir::new().unwrap();
        let mine = staged(&dir, "my_mod");
        let other = staged(&dir, "other_mod");
        let mut monitor = Monitor::new(Path::new("/x.sh"), &dir.path().join("modules_update"));
        monitor.set_for_cleanup(Some("my_mod".to_string()));
        monitor.on_line("! Unsupported platform");

        assert_eq!(monitor.cleanup(&LocalFs), MSG_INSTALL_FAILED);
        assert!(!mine.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_traversal_in_error_line_is_ignored() {
        let dir = TempDir::new().unwrap();
        let update_dir = dir.path().join("modules_update");
        std::fs::create_dir_all(&update_dir).unwrap();
        let mut monitor = Monitor::new(Path::new("/x.sh"), &update_dir);
        monitor.on_line(&format!("/x.sh: {}/../oops", update_dir.display()));

        assert_eq!(monitor.cleanup(&LocalFs), MSG_INSTALL_FAILED);
        assert!(update_dir.exists());
    }
}
