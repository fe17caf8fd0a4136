//! Engine lifecycle framework.
//!
//! An [`Engine`] is a resumable, cancellable, long-running activity: a data
//! collection, an automation sequence, a hardware mode change. Each running
//! engine owns a dedicated worker task executing its [`Runnable::run`] body;
//! lifecycle commands (`pause`, `resume`, `stop`) are cooperative flags the
//! worker observes at safe checkpoints, never thread interrupts.
//!
//! # State machine
//!
//! ```text
//! IDLE ──start()──> RUNNING ──pause()──> PAUSED
//!   ▲                  │   ▲               │
//!   │                  │   └───resume()────┘
//!   └──done/stopped────┘
//! ```
//!
//! The worker signals its outcome through the engine's state object: `busy`,
//! `paused`, `progress` during the run, then exactly one of `done`, `stopped`
//! or `error`. Errors and panics escaping the body are caught at the task
//! boundary and surfaced as an `error` transition; the engine always returns
//! to IDLE and can be restarted. A worker must never vanish silently.

pub mod automation;
pub mod collector;
pub mod script;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::signals::{StateObject, StateValue};

/// How a worker finished.
#[derive(Debug)]
pub enum Outcome {
    /// Completed normally, with a result payload.
    Done(serde_json::Value),
    /// Unwound cleanly after a stop request.
    Stopped,
    /// Released the worker after a pause request; a later `resume` restarts
    /// the activity from recomputed state.
    Paused,
}

/// Shared cancellation and suspension flags for one activity.
///
/// Cloneable so nested sub-engines inherit cancellation from their parent.
/// `stopped` and `paused` are mutually exclusive intents: a stop always
/// clears pause so a paused worker can unwind.
#[derive(Clone, Default)]
pub struct EngineControl {
    stopped: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    reason: Arc<RwLock<String>>,
}

impl EngineControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.write() {
            *r = reason.into();
        }
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            r.clear();
        }
    }

    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// True when the worker should leave its acquisition loop.
    pub fn interrupted(&self) -> bool {
        self.is_stopped() || self.is_paused()
    }

    pub fn pause_reason(&self) -> String {
        self.reason.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Block (poll with short sleep) while paused. Returns once the pause is
    /// lifted or a stop arrives, so a paused worker can still abort.
    pub async fn hold_while_paused(&self) {
        while self.is_paused() && !self.is_stopped() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Observable lifecycle core embedded in every engine.
pub struct Engine {
    state: StateObject,
    control: EngineControl,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: StateObject::new(name),
            control: EngineControl::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &StateObject {
        &self.state
    }

    pub fn control(&self) -> &EngineControl {
        &self.control
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn is_busy(&self) -> bool {
        self.state.get_bool("busy")
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Request suspension. The worker blocks at its next safe checkpoint.
    pub fn pause(&self, reason: &str) {
        info!(engine = %self.name(), reason, "pause requested");
        self.control.pause(reason);
        self.state
            .set_state("paused", StateValue::flag(true, reason));
    }

    pub fn resume(&self) {
        if self.control.is_paused() {
            info!(engine = %self.name(), "resuming");
            self.control.resume();
            self.state.set_state("paused", StateValue::flag(false, ""));
        }
    }

    /// Request cancellation. A no-op on an idle engine.
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn emit_progress(&self, fraction: f64, message: impl Into<String>) {
        self.state
            .set_state("progress", StateValue::progress(fraction, message));
    }

    /// Block until the engine leaves the busy state.
    pub async fn wait(&self) {
        while self.is_busy() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Like [`Engine::wait`] with an absolute deadline. Returns whether the
    /// engine went idle in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_busy() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    fn store_worker(&self, handle: JoinHandle<()>) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        *worker = Some(handle);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name())
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

/// The overridable body of an engine.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    fn engine(&self) -> &Engine;

    /// The activity itself. Checked for `stop`/`pause` at safe checkpoints by
    /// the implementation; the framework handles everything around it.
    async fn run(self: Arc<Self>) -> Result<Outcome>;
}

/// Launch an activity on its own worker task.
///
/// Returns `false` (with a log entry) when the engine is already busy.
pub fn start(activity: Arc<dyn Runnable>) -> bool {
    let engine = activity.engine();
    if engine.is_busy() {
        warn!(engine = %engine.name(), "already running, start ignored");
        return false;
    }
    engine.control.reset();
    engine.state.set_state("busy", true);
    let handle = tokio::spawn(run_to_completion(Arc::clone(&activity)));
    engine.store_worker(handle);
    true
}

async fn run_to_completion(activity: Arc<dyn Runnable>) {
    let name = activity.engine().name().to_string();
    let result = AssertUnwindSafe(Arc::clone(&activity).run())
        .catch_unwind()
        .await;
    let engine = activity.engine();
    match result {
        Ok(Ok(Outcome::Done(value))) => {
            info!(engine = %name, "run complete");
            engine.state.set_state("done", StateValue::Json(value));
        }
        Ok(Ok(Outcome::Stopped)) => {
            info!(engine = %name, "run stopped");
            engine.state.force_state("stopped", StateValue::Trigger);
        }
        Ok(Ok(Outcome::Paused)) => {
            info!(engine = %name, "run paused, worker released");
        }
        Ok(Err(err)) => {
            error!(engine = %name, error = %format!("{err:#}"), "run failed");
            engine
                .state
                .force_state("error", StateValue::Text(format!("{err:#}")));
        }
        Err(_) => {
            error!(engine = %name, "run panicked");
            engine.state.force_state(
                "error",
                StateValue::Text("internal error: run panicked".to_string()),
            );
        }
    }
    engine.state.set_state("busy", false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicUsize;

    struct CountingActivity {
        engine: Engine,
        iterations: usize,
        completed: AtomicUsize,
        fail: bool,
    }

    impl CountingActivity {
        fn new(iterations: usize, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                engine: Engine::new("counting"),
                iterations,
                completed: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Runnable for CountingActivity {
        fn engine(&self) -> &Engine {
            &self.engine
        }

        async fn run(self: Arc<Self>) -> Result<Outcome> {
            for i in 0..self.iterations {
                if self.engine.control().is_stopped() {
                    return Ok(Outcome::Stopped);
                }
                self.engine.control().hold_while_paused().await;
                if self.engine.control().is_stopped() {
                    return Ok(Outcome::Stopped);
                }
                if self.fail && i == 1 {
                    bail!("failure at iteration {i}");
                }
                self.completed.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(Outcome::Done(serde_json::json!({
                "iterations": self.iterations
            })))
        }
    }

    #[tokio::test]
    async fn test_run_to_done() {
        let activity = CountingActivity::new(3, false);
        assert!(start(activity.clone()));
        activity.engine.wait().await;
        assert_eq!(activity.completed.load(Ordering::SeqCst), 3);
        assert!(matches!(
            activity.engine.state().get_state("done"),
            Some(StateValue::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_on_idle_engine_is_noop() {
        let activity = CountingActivity::new(3, false);
        activity.engine.stop();
        activity.engine.stop();
        assert!(!activity.engine.is_busy());

        // The stale stop flag must not poison a later start.
        assert!(start(activity.clone()));
        activity.engine.wait().await;
        assert_eq!(activity.completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let activity = CountingActivity::new(10, false);
        assert!(start(activity.clone()));
        assert!(!start(activity.clone()));
        activity.engine.stop();
        activity.engine.wait().await;
    }

    #[tokio::test]
    async fn test_error_surfaces_and_engine_restarts() {
        let activity = CountingActivity::new(3, true);
        start(activity.clone());
        activity.engine.wait().await;
        let error = activity.engine.state().get_state("error");
        assert!(matches!(error, Some(StateValue::Text(ref m)) if m.contains("iteration 1")));

        // Back to IDLE: a new start must be accepted.
        assert!(!activity.engine.is_busy());
        assert!(start(activity.clone()));
        activity.engine.stop();
        activity.engine.wait().await;
    }

    #[tokio::test]
    async fn test_pause_blocks_and_resume_releases() {
        let activity = CountingActivity::new(50, false);
        start(activity.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        activity.engine.pause("operator request");
        tokio::time::sleep(Duration::from_millis(150)).await;
        let frozen = activity.completed.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(activity.completed.load(Ordering::SeqCst), frozen);

        activity.engine.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(activity.completed.load(Ordering::SeqCst) > frozen);
        activity.engine.stop();
        activity.engine.wait().await;
    }

    #[tokio::test]
    async fn test_stop_clears_pause() {
        let control = EngineControl::new();
        control.pause("hold");
        assert!(control.is_paused());
        control.stop();
        assert!(control.is_stopped());
        assert!(!control.is_paused());
    }
}
