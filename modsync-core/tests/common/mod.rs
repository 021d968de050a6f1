//! Test helpers shared by the integration tests
//!
//! Each test binary compiles this module separately, so not every helper is
//! used by every binary.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex, Once};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use modsync_core::install::{CancelToken, ShellLine, ShellRunner};
use modsync_core::net::{HttpError, HttpResponse, HttpTransport};
use modsync_core::repo::DeviceFingerprint;
use modsync_core::sync::ProgressListener;

static INIT: Once = Once::new();

/// Initialize logging for tests (only once per test run)
pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// HTTP transport answering from a table of URL prefixes.
///
/// The longest matching prefix wins; unknown URLs get a 404. Every request
/// URL is recorded.
#[derive(Default)]
pub struct Routes {
    routes: Mutex<BTreeMap<String, HttpResponse>>,
    hits: Mutex<Vec<String>>,
}

impl Routes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, prefix: &str, response: HttpResponse) {
        self.routes
            .lock()
            .unwrap()
            .insert(prefix.to_string(), response);
    }

    pub fn json(&self, prefix: &str, body: serde_json::Value) {
        self.respond(prefix, HttpResponse::ok(body.to_string()));
    }

    pub fn text(&self, prefix: &str, body: &str) {
        self.respond(prefix, HttpResponse::ok(body));
    }

    pub fn bytes(&self, prefix: &str, body: Vec<u8>) {
        self.respond(prefix, HttpResponse::ok(body));
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    pub fn hit_count(&self, prefix: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl HttpTransport for Routes {
    async fn get(
        &self,
        url: &str,
        progress: &dyn ProgressListener,
    ) -> Result<HttpResponse, HttpError> {
        self.hits.lock().unwrap().push(url.to_string());
        let routes = self.routes.lock().unwrap();
        let response = routes
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| HttpResponse::with_status(404));
        let len = response.body.len() as u32;
        progress.on_progress(len, len);
        Ok(response)
    }
}

/// Fixed device identity so premium URLs are predictable
pub struct FixedFingerprint(pub &'static str);

#[async_trait]
impl DeviceFingerprint for FixedFingerprint {
    async fn fingerprint(&self) -> Option<String> {
        Some(self.0.to_string())
    }
}

/// Shell that replays canned output instead of running anything
pub struct ScriptedShell {
    output: Vec<ShellLine>,
    success: bool,
    cancel_with: Mutex<Option<CancelToken>>,
    sessions: Mutex<Vec<Vec<String>>>,
}

impl ScriptedShell {
    pub fn new(output: Vec<ShellLine>, success: bool) -> Arc<Self> {
        Arc::new(Self {
            output,
            success,
            cancel_with: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Installer that prints the given lines and exits 0
    pub fn succeeding(stdout: &[&str]) -> Arc<Self> {
        Self::new(
            stdout.iter().map(|l| ShellLine::Stdout(l.to_string())).collect(),
            true,
        )
    }

    /// Cancel `token` while the session is running
    pub fn cancel_during_run(&self, token: CancelToken) {
        *self.cancel_with.lock().unwrap() = Some(token);
    }

    /// Commands of every session run so far
    pub fn sessions(&self) -> Vec<Vec<String>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShellRunner for ScriptedShell {
    async fn run(
        &self,
        commands: &[String],
        on_line: &mut (dyn FnMut(ShellLine) + Send),
    ) -> io::Result<bool> {
        self.sessions.lock().unwrap().push(commands.to_vec());
        if let Some(token) = self.cancel_with.lock().unwrap().as_ref() {
            token.cancel();
        }
        for line in &self.output {
            on_line(line.clone());
        }
        Ok(self.success)
    }
}

/// Build an in-memory zip; names ending in `/` become directories
pub fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Minimal native module archive
pub fn module_zip(id: &str) -> Vec<u8> {
    let prop = format!(
        "id={id}\nname=Module {id}\nversion=1.0\nversionCode=1\nauthor=tester\ndescription=Test module\n"
    );
    zip_of(&[
        ("module.prop", prop.as_str()),
        ("customize.sh", "ui_print hello\n"),
        ("system/", ""),
    ])
}
