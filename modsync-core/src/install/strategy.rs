//! Install strategy selection and command assembly

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::archive::ArchiveInfo;
use super::error::{
    InstallError, MSG_DANGEROUS_ID, MSG_MISSING_ID, MSG_NOT_A_MODULE, MSG_NO_MAGISK_PATH,
};
use super::request::InstallRequest;
use super::scripts::{self, BundledScript};
use crate::compat::{CompatFlags, CompatTable};
use crate::config::ModsyncConfig;
use crate::model::is_dangerous_id;

/// First Magisk version shipping `magisk --install-module`
pub const MAGISK_VER_CODE_INSTALL_COMMAND: u32 = 21200;

/// Tells install scripts that escape sequences will be rendered
pub const ANSI_CMD_SUPPORT: &str = "export ANSI_SUPPORT=true";

/// No-op shell command used where an optional line is absent
const NOOP: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStrategy {
    /// AnyKernel3 package flashed in its own mount namespace
    Kernel,
    /// Recovery flashable run through its update-binary
    Wrapped,
    /// The root manager's own install command
    MagiskCommand,
    /// Generic module install script
    Compat,
    /// Bundled test script without root
    Rootless,
}

/// Device facts the command line depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallEnv {
    /// First 32-bit ABI the device supports, if any
    pub abi32: Option<String>,
    pub language: String,
    pub text_wrap: bool,
}

impl Default for InstallEnv {
    fn default() -> Self {
        Self::detect()
    }
}

impl InstallEnv {
    /// Derive the environment from the running host
    pub fn detect() -> Self {
        let abi32 = match std::env::consts::ARCH {
            "aarch64" | "arm" => Some("armeabi-v7a"),
            "x86_64" | "x86" => Some("x86"),
            _ => None,
        };
        let language = std::env::var("LANG")
            .ok()
            .and_then(|lang| lang.split('.').next().map(|l| l.replace('_', "-")))
            .filter(|lang| !lang.is_empty() && lang != "C" && lang != "POSIX")
            .unwrap_or_else(|| "en-US".to_string());
        Self {
            abi32: abi32.map(str::to_string),
            language,
            text_wrap: false,
        }
    }

    fn arch32_export(&self) -> Option<&'static str> {
        let abi = self.abi32.as_deref()?;
        if abi.contains("x86") {
            Some("export ARCH32=x86")
        } else if abi.contains("arm") {
            Some("export ARCH32=arm")
        } else {
            None
        }
    }
}

/// Everything needed to launch one install session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub strategy: InstallStrategy,
    /// Bundled script to extract before running, if any
    pub script: Option<BundledScript>,
    /// Program whose error lines the monitor recognises
    pub executable: PathBuf,
    /// Shell lines run in one session
    pub commands: Vec<String>,
    pub module_id: Option<String>,
    /// Interpret recovery `progress` lines
    pub use_recovery: bool,
    pub no_extensions: bool,
    pub ansi: bool,
    /// The package may have replaced the kernel; a reflash of root may be needed
    pub warn_reboot: bool,
}

impl InstallPlan {
    pub fn script_text(&self) -> String {
        self.commands.join("\n")
    }
}

/// Chooses how an inspected archive gets installed
pub struct Planner<'a> {
    settings: &'a ModsyncConfig,
    compat: &'a CompatTable,
    env: &'a InstallEnv,
}

impl<'a> Planner<'a> {
    pub fn new(settings: &'a ModsyncConfig, compat: &'a CompatTable, env: &'a InstallEnv) -> Self {
        Self {
            settings,
            compat,
            env,
        }
    }

    /// Plan a privileged install of the archive at `zip`, run from `work_dir`
    pub fn plan(
        &self,
        info: &ArchiveInfo,
        request: &InstallRequest,
        zip: &Path,
        work_dir: &Path,
    ) -> Result<InstallPlan, InstallError> {
        let magisk_path = self
            .settings
            .magisk_path
            .as_ref()
            .ok_or_else(|| InstallError::installing(MSG_NO_MAGISK_PATH))?;
        let ash = format!("{} ash", quoted(&magisk_path.join(".magisk/busybox/busybox")));

        let module_id = info.module_id.clone();
        let compat = self.compat.flags_for(module_id.as_deref().unwrap_or(""));
        let needs_32bit = info.needs_32bit || compat.contains(CompatFlags::NEED_32BIT);
        let no_extensions = request.no_extensions || compat.contains(CompatFlags::NO_EXT);
        let mmt_reborn =
            info.mmt_reborn || request.mmt_reborn || compat.contains(CompatFlags::MMT_REBORN);

        if module_id.as_deref().is_some_and(is_dangerous_id) {
            return Err(InstallError::patching(MSG_DANGEROUS_ID));
        }
        if info.magisk_module && module_id.is_none() && !info.any_kernel3 {
            return Err(InstallError::patching(MSG_MISSING_ID));
        }

        let use_recovery = info.any_kernel3;
        let mut arch32 = None;
        if !use_recovery && (needs_32bit || !compat.contains(CompatFlags::NO_EXT)) {
            arch32 = self.env.arch32_export();
        }

        let zip_arg = quoted(zip);
        let script_command = |script: &BundledScript| {
            format!("{ash} {} 3 1 {zip_arg}", quoted(&script.path_in(work_dir)))
        };

        let (strategy, script, install_command, executable) =
            if info.any_kernel3 && module_id.is_none() {
                let command = format!("unshare -m {}", script_command(&scripts::ANYKERNEL3));
                let exe = scripts::ANYKERNEL3.path_in(work_dir);
                (InstallStrategy::Kernel, Some(scripts::ANYKERNEL3), command, exe)
            } else if info.wrapped_module || compat.contains(CompatFlags::ZIP_WRAPPER) {
                let command = script_command(&scripts::WRAPPER);
                let exe = scripts::WRAPPER.path_in(work_dir);
                (InstallStrategy::Wrapped, Some(scripts::WRAPPER), command, exe)
            } else if self.settings.magisk_version_code >= MAGISK_VER_CODE_INSTALL_COMMAND
                && (compat.contains(CompatFlags::MAGISK_CMD)
                    || no_extensions
                    || self.settings.prefer_install_command)
            {
                let exe = if magisk_path == Path::new("/sbin") {
                    PathBuf::from("/sbin/magisk")
                } else {
                    PathBuf::from("/system/bin/magisk")
                };
                let command = format!("magisk --install-module {zip_arg}");
                (InstallStrategy::MagiskCommand, None, command, exe)
            } else if module_id.is_some() {
                let command = script_command(&scripts::COMPAT);
                let exe = scripts::COMPAT.path_in(work_dir);
                (InstallStrategy::Compat, Some(scripts::COMPAT), command, exe)
            } else {
                return Err(InstallError::patching(MSG_NOT_A_MODULE));
            };

        if mmt_reborn && strategy == InstallStrategy::MagiskCommand {
            warn!("MMT-Reborn modules may not install correctly through the magisk command");
        }

        let arch32 = arch32.unwrap_or(NOOP).to_string();
        let cd = format!("cd {}", quoted(work_dir));
        let (ansi, commands) = if no_extensions {
            let ansi = compat.contains(CompatFlags::FORCE_ANSI);
            let commands = vec![
                arch32,
                "export BOOTMODE=true".to_string(),
                ansi_line(ansi),
                cd,
                install_command,
            ];
            (ansi, commands)
        } else {
            let ansi = !compat.contains(CompatFlags::NO_ANSI);
            let last_env = if info.any_kernel3 {
                format!("export AK3TMPFS={}", quoted(&magisk_path.join("ak3tmpfs")))
            } else {
                cd
            };
            let mut commands = vec![arch32];
            commands.extend(self.extension_exports());
            commands.extend([
                ansi_line(ansi),
                if mmt_reborn {
                    "export MMM_MMT_REBORN=1".to_string()
                } else {
                    NOOP.to_string()
                },
                "export BOOTMODE=true".to_string(),
                last_env,
                install_command,
            ]);
            (ansi, commands)
        };

        debug!(
            "Install plan: strategy={:?} module={:?} no_ext={} ansi={}",
            strategy, module_id, no_extensions, ansi
        );
        Ok(InstallPlan {
            strategy,
            script,
            executable,
            commands,
            module_id,
            use_recovery,
            no_extensions,
            ansi,
            warn_reboot: strategy == InstallStrategy::Kernel,
        })
    }

    /// Plan a dry run through the bundled test script
    pub fn plan_rootless(&self, zip: &Path, work_dir: &Path) -> InstallPlan {
        let executable = scripts::TEST.path_in(work_dir);
        let mut commands = self.extension_exports();
        commands.extend([
            ANSI_CMD_SUPPORT.to_string(),
            format!("cd {}", quoted(work_dir)),
            format!("sh {} 3 0 {}", quoted(&executable), quoted(zip)),
        ]);
        InstallPlan {
            strategy: InstallStrategy::Rootless,
            script: Some(scripts::TEST),
            executable,
            commands,
            module_id: None,
            use_recovery: false,
            no_extensions: false,
            ansi: true,
            warn_reboot: false,
        }
    }

    fn extension_exports(&self) -> Vec<String> {
        vec![
            "export MMM_EXT_SUPPORT=1".to_string(),
            format!("export MMM_USER_LANGUAGE={}", self.env.language),
            format!("export MMM_APP_VERSION={}", self.settings.app_version_name),
            format!(
                "export MMM_TEXT_WRAP={}",
                if self.env.text_wrap { "1" } else { "0" }
            ),
        ]
    }
}

/// Shell-quote a path, leaving plain paths untouched
fn quoted(path: &Path) -> String {
    shell_words::quote(&path.to_string_lossy()).into_owned()
}

fn ansi_line(enabled: bool) -> String {
    let line = if enabled { ANSI_CMD_SUPPORT } else { NOOP };
    line.to_string()
}
