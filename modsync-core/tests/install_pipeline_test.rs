//! Install pipeline runs against a scripted shell

mod common;

use common::{init_test_logging, module_zip, zip_of, Routes, ScriptedShell};
use modsync_core::compat::CompatTable;
use modsync_core::config::ModsyncConfig;
use modsync_core::install::{
    InstallEnv, InstallObserver, InstallPipeline, InstallRequest, InstallState, InstallStrategy,
    ShellLine, TerminalEvent, MSG_INSTALL_FAILED, MSG_INTEGRITY, MSG_NOT_A_MODULE, MSG_SUCCESS,
};
use modsync_core::local::LocalFs;
use modsync_core::net::HttpClient;
use pretty_assertions::assert_eq;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const ZIP_URL: &str = "https://dl.test/demo.zip";

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<InstallState>>,
    lines: Mutex<Vec<String>>,
}

impl Recorder {
    fn states(&self) -> Vec<InstallState> {
        self.states.lock().unwrap().clone()
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl InstallObserver for Recorder {
    fn on_state(&self, state: InstallState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_terminal(&self, event: &TerminalEvent) {
        if let TerminalEvent::AddLine(line) = event {
            self.lines.lock().unwrap().push(line.clone());
        }
    }
}

struct Fixture {
    dir: TempDir,
    settings: Arc<ModsyncConfig>,
    routes: Arc<Routes>,
}

impl Fixture {
    fn new() -> Self {
        init_test_logging();
        let dir = TempDir::new().unwrap();
        let settings = ModsyncConfig {
            magisk_path: Some(PathBuf::from("/debug_ramdisk")),
            magisk_version_code: 26400,
            ..ModsyncConfig::rooted_at(dir.path())
        };
        Self {
            dir,
            settings: Arc::new(settings),
            routes: Routes::new(),
        }
    }

    fn pipeline(&self, shell: Arc<ScriptedShell>) -> InstallPipeline {
        InstallPipeline::new(
            Arc::clone(&self.settings),
            Arc::new(CompatTable::new()),
            HttpClient::new(self.routes.clone()),
            Arc::new(LocalFs),
            shell,
        )
        .with_env(InstallEnv {
            abi32: None,
            language: "en-US".to_string(),
            text_wrap: false,
        })
    }

    fn staged(&self, id: &str) -> PathBuf {
        let path = self.settings.modules_update_dir().join(id);
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}

fn request() -> InstallRequest {
    InstallRequest::new(ZIP_URL, "Demo")
}

#[tokio::test]
async fn test_successful_install_walks_every_state() {
    let fixture = Fixture::new();
    fixture.routes.bytes(ZIP_URL, module_zip("demo"));
    let shell = ScriptedShell::succeeding(&[
        "#!useExt",
        "- Extracting module files",
        "#!setSupportLink https://example.com/support",
    ]);
    let pipeline = fixture.pipeline(shell.clone());
    let recorder = Recorder::default();

    let outcome = pipeline.install(&request(), &recorder).await;

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(outcome.message, MSG_SUCCESS);
    assert_eq!(outcome.module_id.as_deref(), Some("demo"));
    assert_eq!(outcome.strategy, Some(InstallStrategy::Compat));
    assert_eq!(
        outcome.support_link.as_deref(),
        Some("https://example.com/support")
    );
    assert_eq!(
        recorder.states(),
        vec![
            InstallState::Downloading,
            InstallState::Validating,
            InstallState::Patching,
            InstallState::Installing,
            InstallState::Success,
        ]
    );
    assert!(recorder
        .lines()
        .contains(&"- Extracting module files".to_string()));

    let install_dir = fixture.settings.install_dir();
    assert!(install_dir.join("module.zip").exists());
    assert!(install_dir.join("module_installer_compat.sh").exists());
    let sessions = shell.sessions();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0]
        .last()
        .unwrap()
        .contains("module_installer_compat.sh 3 1"));
}

#[tokio::test]
async fn test_local_archive_with_matching_checksum() {
    let fixture = Fixture::new();
    let zip = module_zip("demo");
    let path = fixture.settings.cache_dir.join("imports").join("demo.zip");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, &zip).unwrap();

    let checksum = hex::encode(Sha256::digest(&zip));
    let request = InstallRequest::new(path.display().to_string(), "").with_checksum(checksum);
    let outcome = fixture
        .pipeline(ScriptedShell::succeeding(&[]))
        .install(&request, &Recorder::default())
        .await;

    assert!(outcome.is_success(), "{outcome:?}");
    assert!(fixture.routes.hits().is_empty());
}

#[tokio::test]
async fn test_checksum_mismatch_fails_before_shell() {
    let fixture = Fixture::new();
    fixture.routes.bytes(ZIP_URL, module_zip("demo"));
    let shell = ScriptedShell::succeeding(&[]);
    let recorder = Recorder::default();

    let outcome = fixture
        .pipeline(shell.clone())
        .install(&request().with_checksum("0".repeat(64)), &recorder)
        .await;

    assert_eq!(outcome.state, InstallState::Failed);
    assert_eq!(outcome.message, MSG_INTEGRITY);
    assert_eq!(
        recorder.states(),
        vec![
            InstallState::Downloading,
            InstallState::Validating,
            InstallState::Failed,
        ]
    );
    assert!(shell.sessions().is_empty());
}

#[tokio::test]
async fn test_archive_without_markers_is_rejected() {
    let fixture = Fixture::new();
    fixture
        .routes
        .bytes(ZIP_URL, zip_of(&[("README.md", "just docs")]));
    let shell = ScriptedShell::succeeding(&[]);

    let outcome = fixture
        .pipeline(shell.clone())
        .install(&request(), &Recorder::default())
        .await;

    assert_eq!(outcome.state, InstallState::Failed);
    assert_eq!(outcome.message, MSG_NOT_A_MODULE);
    assert!(shell.sessions().is_empty());
}

#[tokio::test]
async fn test_download_failure() {
    let fixture = Fixture::new();
    let recorder = Recorder::default();

    let outcome = fixture
        .pipeline(ScriptedShell::succeeding(&[]))
        .install(&request(), &recorder)
        .await;

    assert_eq!(outcome.state, InstallState::Failed);
    assert_eq!(outcome.message, "Failed to download module zip");
    assert_eq!(
        recorder.states(),
        vec![InstallState::Downloading, InstallState::Failed]
    );
}

#[tokio::test]
async fn test_local_target_outside_app_dirs_is_refused() {
    let fixture = Fixture::new();
    let outside = fixture.dir.path().join("elsewhere.zip");
    std::fs::write(&outside, module_zip("demo")).unwrap();

    let request = InstallRequest::new(outside.display().to_string(), "");
    let outcome = fixture
        .pipeline(ScriptedShell::succeeding(&[]))
        .install(&request, &Recorder::default())
        .await;

    assert_eq!(outcome.state, InstallState::Failed);
    assert!(outcome.message.starts_with("! Refusing to install"));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let fixture = Fixture::new();
    fixture.routes.bytes(ZIP_URL, module_zip("demo"));
    let shell = ScriptedShell::succeeding(&[]);
    let pipeline = fixture.pipeline(shell.clone());
    pipeline.cancel_token().cancel();
    let recorder = Recorder::default();

    let outcome = pipeline.install(&request(), &recorder).await;

    assert_eq!(outcome.state, InstallState::Cancelled);
    assert_eq!(
        recorder.states(),
        vec![InstallState::Downloading, InstallState::Cancelled]
    );
    assert!(shell.sessions().is_empty());
}

#[tokio::test]
async fn test_cancel_during_shell_session() {
    let fixture = Fixture::new();
    fixture.routes.bytes(ZIP_URL, module_zip("demo"));
    let shell = ScriptedShell::succeeding(&["- Installing"]);
    let pipeline = fixture.pipeline(shell.clone());
    shell.cancel_during_run(pipeline.cancel_token());
    let recorder = Recorder::default();

    let outcome = pipeline.install(&request(), &recorder).await;

    assert_eq!(outcome.state, InstallState::Cancelled);
    assert_eq!(outcome.module_id.as_deref(), Some("demo"));
    assert_eq!(recorder.states().last(), Some(&InstallState::Cancelled));
    assert_eq!(shell.sessions().len(), 1);
}

#[tokio::test]
async fn test_busybox_done_line_counts_as_success() {
    let fixture = Fixture::new();
    fixture.routes.bytes(ZIP_URL, module_zip("demo"));
    let shell = ScriptedShell::new(
        vec![
            ShellLine::Stdout("- Copying files".to_string()),
            ShellLine::Stdout("Done!".to_string()),
        ],
        false,
    );

    let outcome = fixture
        .pipeline(shell)
        .install(&request(), &Recorder::default())
        .await;

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(outcome.message, MSG_SUCCESS);
}

#[tokio::test]
async fn test_script_error_removes_staged_module() {
    let fixture = Fixture::new();
    fixture.routes.bytes(ZIP_URL, module_zip("demo"));
    let staged = fixture.staged("demo");
    let untouched = fixture.staged("other");
    let exe = fixture
        .settings
        .install_dir()
        .join("module_installer_compat.sh");
    let shell = ScriptedShell::new(
        vec![
            ShellLine::Stdout("- Extracting".to_string()),
            ShellLine::Stderr(format!(
                "{}: {}/demo/customize.sh: line 7: unexpected EOF",
                exe.display(),
                fixture.settings.modules_update_dir().display()
            )),
        ],
        false,
    );

    let outcome = fixture
        .pipeline(shell)
        .install(&request(), &Recorder::default())
        .await;

    assert_eq!(outcome.state, InstallState::Failed);
    assert_eq!(outcome.message, "Error: customize.sh: line 7: unexpected EOF");
    assert!(!staged.exists());
    assert!(untouched.exists());
}

#[tokio::test]
async fn test_generic_failure_cleans_expected_module() {
    let fixture = Fixture::new();
    fixture.routes.bytes(ZIP_URL, module_zip("demo"));
    let staged = fixture.staged("demo");
    let shell = ScriptedShell::new(
        vec![ShellLine::Stderr("! Unsupported platform".to_string())],
        false,
    );

    let outcome = fixture
        .pipeline(shell)
        .install(&request(), &Recorder::default())
        .await;

    assert_eq!(outcome.state, InstallState::Failed);
    assert_eq!(outcome.message, MSG_INSTALL_FAILED);
    assert!(!staged.exists());
}

#[tokio::test]
async fn test_nested_module_is_rehomed_and_installed() {
    let fixture = Fixture::new();
    fixture.routes.bytes(
        ZIP_URL,
        zip_of(&[
            ("demo-main/", ""),
            (
                "demo-main/module.prop",
                "id=demo\nname=Demo\nversion=1\nversionCode=1\nauthor=me\ndescription=Nested\n",
            ),
            ("demo-main/customize.sh", "ui_print hi\n"),
        ]),
    );

    let outcome = fixture
        .pipeline(ScriptedShell::succeeding(&[]))
        .install(&request(), &Recorder::default())
        .await;

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(outcome.module_id.as_deref(), Some("demo"));
    let saved = std::fs::read(fixture.settings.install_dir().join("module.zip")).unwrap();
    let names = modsync_core::install::archive::entry_names(&saved).unwrap();
    assert!(names.iter().any(|n| n == "module.prop"));
}
