//! Debounced single-flight synchronisation
//!
//! [`SyncManager`] owns some state `T` behind one async lock and runs
//! `T::scan_internal` on it. Passes never overlap, a pass that finished less
//! than [`DEBOUNCE_WINDOW`] ago is not repeated, and callers arriving while a
//! pass is in flight wait for it instead of starting another.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Minimum spacing between two completed passes
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// Receives progress from a running pass; may be called from any thread
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, value: u32, max: u32);
}

impl<F> ProgressListener for F
where
    F: Fn(u32, u32) + Send + Sync,
{
    fn on_progress(&self, value: u32, max: u32) {
        self(value, max)
    }
}

/// Discards progress
pub struct NoProgress;

impl ProgressListener for NoProgress {
    fn on_progress(&self, _value: u32, _max: u32) {}
}

/// State that knows how to refresh itself
#[async_trait]
pub trait SyncTarget: Send {
    /// One synchronisation pass. Never runs concurrently with itself.
    ///
    /// Implementations contain their own errors; nothing is reported back.
    async fn scan_internal(&mut self, progress: &dyn ProgressListener);
}

/// How an `update` call was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This call ran a pass
    Completed,
    /// A pass completed within the debounce window; nothing ran
    Debounced,
    /// Another caller's pass was in flight and this call waited for it
    Joined,
}

struct SyncState<T> {
    target: T,
    last_sync: Option<Instant>,
}

/// Clears the in-flight marker however the pass ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn begin(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncManager<T> {
    state: Mutex<SyncState<T>>,
    syncing: AtomicBool,
}

impl<T: SyncTarget> SyncManager<T> {
    pub fn new(target: T) -> Self {
        Self {
            state: Mutex::new(SyncState {
                target,
                last_sync: None,
            }),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub async fn scan(&self) -> SyncOutcome {
        self.update(&NoProgress).await
    }

    /// Run a pass unless one is running or just finished
    pub async fn update(&self, progress: &dyn ProgressListener) -> SyncOutcome {
        if self.is_syncing() {
            tracing::trace!("Sync already running, waiting for it");
            drop(self.state.lock().await);
            return SyncOutcome::Joined;
        }

        let mut state = self.state.lock().await;
        if let Some(last) = state.last_sync {
            if last.elapsed() < DEBOUNCE_WINDOW {
                tracing::trace!("Sync debounced ({:?} since last pass)", last.elapsed());
                return SyncOutcome::Debounced;
            }
        }

        let _in_flight = InFlight::begin(&self.syncing);
        state.target.scan_internal(progress).await;
        state.last_sync = Some(Instant::now());
        SyncOutcome::Completed
    }

    /// Wait for an in-flight pass, if any
    pub async fn after_scan(&self) {
        if self.is_syncing() {
            drop(self.state.lock().await);
        }
    }

    pub async fn after_update(&self) {
        self.after_scan().await
    }

    /// Run `task` with exclusive access to the state
    pub async fn run_after_scan<R>(&self, task: impl FnOnce(&mut T) -> R) -> R {
        let mut state = self.state.lock().await;
        task(&mut state.target)
    }

    pub async fn run_after_update<R>(&self, task: impl FnOnce(&mut T) -> R) -> R {
        self.run_after_scan(task).await
    }
}

impl<T: SyncTarget + 'static> SyncManager<T> {
    /// Start a pass on the runtime; `None` if one is already running
    pub fn scan_async(self: &Arc<Self>) -> Option<JoinHandle<SyncOutcome>> {
        if self.is_syncing() {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.scan().await }))
    }
}
