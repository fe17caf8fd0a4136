//! Observable state framework shared by devices and engines.
//!
//! Every hardware device and every long-running activity in the system holds a
//! [`StateObject`]: a named map of state values with change notification. The
//! framework guarantees that notifications are delivered on one designated
//! coordination thread regardless of which thread or task produced the change,
//! and that per-key delivery order matches submission order.
//!
//! # Architecture
//!
//! ```text
//! worker task ──set_state()──┐
//! worker task ──set_state()──┤──> unbounded queue ──> dispatcher thread ──> observers
//! UI / CLI    ──set_state()──┘                         (one consumer)
//! ```
//!
//! A single dispatcher thread owns the delivery loop. Calls made *from* the
//! dispatcher thread itself (an observer reacting to a notification) are
//! delivered synchronously to avoid re-queueing behind unrelated work;
//! everything else is marshalled through the queue. Observer panics are caught
//! and logged, never propagated to the caller of `set_state`.
//!
//! # Change detection
//!
//! A `set_state` call schedules a notification when the key has never been
//! set, when the new value differs from the stored one, or when `force` is
//! requested. Composite values (flags, progress, health, JSON containers) are
//! always treated as changed: content mutation inside a container cannot be
//! detected reliably by comparison, so short-circuiting them would drop real
//! transitions.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::ThreadId;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::health::Severity;

/// A single state value.
///
/// Scalar variants participate in equality short-circuiting; composite
/// variants always signal (see module docs).
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// A boolean condition with an attached human-readable reason,
    /// e.g. `paused = (true, "beam lost")`.
    Flag { on: bool, message: String },
    /// Fractional progress with a description of the current step.
    Progress { fraction: f64, message: String },
    /// Combined health severity and message.
    Health { severity: Severity, message: String },
    /// Arbitrary structured payload (results, completion maps).
    Json(serde_json::Value),
    /// A payload-less event. Always signals.
    Trigger,
}

impl StateValue {
    pub fn flag(on: bool, message: impl Into<String>) -> Self {
        StateValue::Flag {
            on,
            message: message.into(),
        }
    }

    pub fn progress(fraction: f64, message: impl Into<String>) -> Self {
        StateValue::Progress {
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        }
    }

    pub fn health(severity: Severity, message: impl Into<String>) -> Self {
        StateValue::Health {
            severity,
            message: message.into(),
        }
    }

    /// Composite values bypass the equality short-circuit.
    pub fn always_signals(&self) -> bool {
        matches!(
            self,
            StateValue::Flag { .. }
                | StateValue::Progress { .. }
                | StateValue::Health { .. }
                | StateValue::Json(_)
                | StateValue::Trigger
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            StateValue::Flag { on, .. } => Some(*on),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Float(f) => Some(*f),
            StateValue::Int(i) => Some(*i as f64),
            StateValue::Progress { fraction, .. } => Some(*fraction),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::Text(value)
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        StateValue::Json(value)
    }
}

/// A delivered state transition.
#[derive(Debug, Clone)]
pub struct StateEvent {
    /// Name of the emitting object.
    pub source: Arc<str>,
    /// State key that changed.
    pub key: Arc<str>,
    /// The new value.
    pub value: StateValue,
}

type Callback = Arc<dyn Fn(&StateEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

type SubscriberTable = Mutex<HashMap<String, Vec<Subscriber>>>;

struct Notification {
    table: Arc<SubscriberTable>,
    event: StateEvent,
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

static HUB: Lazy<SignalHub> = Lazy::new(SignalHub::start);

/// The process-wide notification dispatcher.
///
/// Owns the coordination thread. All [`StateObject`]s share it, which is what
/// makes the ordering guarantee global rather than per-object.
pub struct SignalHub {
    tx: mpsc::UnboundedSender<Notification>,
    thread: ThreadId,
}

impl SignalHub {
    #[allow(clippy::expect_used)]
    fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let handle = std::thread::Builder::new()
            .name("signal-dispatch".to_string())
            .spawn(move || {
                while let Some(note) = rx.blocking_recv() {
                    Self::deliver(&note);
                }
            })
            .expect("failed to spawn signal dispatch thread");
        let thread = handle.thread().id();
        Self { tx, thread }
    }

    /// The shared dispatcher instance.
    pub fn global() -> &'static SignalHub {
        &HUB
    }

    /// True when the caller is already on the coordination thread.
    pub fn on_dispatch_thread(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    fn dispatch(&self, note: Notification) {
        if self.on_dispatch_thread() {
            Self::deliver(&note);
        } else if self.tx.send(note).is_err() {
            warn!("signal dispatcher unavailable, notification dropped");
        }
    }

    fn deliver(note: &Notification) {
        let callbacks: Vec<Callback> = {
            let table = note
                .table
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            table
                .get(note.event.key.as_ref())
                .map(|subs| subs.iter().map(|s| s.callback.clone()).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            // An observer must never take the dispatcher down with it.
            if catch_unwind(AssertUnwindSafe(|| callback(&note.event))).is_err() {
                error!(
                    source = %note.event.source,
                    key = %note.event.key,
                    "state observer panicked, notification skipped"
                );
            }
        }
    }
}

/// Handle to one registered observer. Detach with [`Subscription::disconnect`].
///
/// Dropping the handle does *not* detach the observer; subscriptions follow
/// the lifetime of the observed object unless explicitly disconnected.
pub struct Subscription {
    table: Weak<SubscriberTable>,
    key: String,
    id: u64,
}

impl Subscription {
    pub fn disconnect(self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(subs) = table.get_mut(&self.key) {
                subs.retain(|s| s.id != self.id);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StateEntry {
    value: StateValue,
    last_set: DateTime<Utc>,
}

/// An observable entity holding a mapping of named state values.
///
/// Cheap to clone; clones share the same state map and subscribers.
#[derive(Clone)]
pub struct StateObject {
    inner: Arc<StateInner>,
}

struct StateInner {
    name: Arc<str>,
    values: Mutex<HashMap<String, StateEntry>>,
    table: Arc<SubscriberTable>,
}

impl StateObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StateInner {
                name: name.into().into(),
                values: Mutex::new(HashMap::new()),
                table: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Record a new value for `key` and notify observers if it changed.
    pub fn set_state(&self, key: &str, value: impl Into<StateValue>) {
        self.apply(key, value.into(), false);
    }

    /// Record a new value for `key` and notify observers unconditionally.
    pub fn force_state(&self, key: &str, value: impl Into<StateValue>) {
        self.apply(key, value.into(), true);
    }

    /// Apply several updates at once, in order.
    pub fn set_many(&self, entries: Vec<(&str, StateValue)>) {
        for (key, value) in entries {
            self.apply(key, value, false);
        }
    }

    fn apply(&self, key: &str, value: StateValue, force: bool) {
        let changed = {
            let mut values = self
                .inner
                .values
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = force
                || value.always_signals()
                || values.get(key).map_or(true, |entry| entry.value != value);
            if changed {
                values.insert(
                    key.to_string(),
                    StateEntry {
                        value: value.clone(),
                        last_set: Utc::now(),
                    },
                );
            }
            changed
        };
        if changed {
            SignalHub::global().dispatch(Notification {
                table: Arc::clone(&self.inner.table),
                event: StateEvent {
                    source: Arc::clone(&self.inner.name),
                    key: Arc::from(key),
                    value,
                },
            });
        }
    }

    /// Last stored value for `key`, or `None` if the key was never emitted.
    pub fn get_state(&self, key: &str) -> Option<StateValue> {
        let values = self
            .inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        values.get(key).map(|entry| entry.value.clone())
    }

    /// When `key` was last set, or `None` if never emitted.
    pub fn last_set(&self, key: &str) -> Option<DateTime<Utc>> {
        let values = self
            .inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        values.get(key).map(|entry| entry.last_set)
    }

    /// Boolean convenience accessor; unset keys read as `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get_state(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Register an observer for transitions of `key`.
    pub fn connect<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self
                .inner
                .table
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            table.entry(key.to_string()).or_default().push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        }
        Subscription {
            table: Arc::downgrade(&self.inner.table),
            key: key.to_string(),
            id,
        }
    }
}

impl std::fmt::Debug for StateObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateObject")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_last_write_wins() {
        let obj = StateObject::new("dev");
        obj.set_state("target", 1.0);
        obj.set_state("target", 2.0);
        obj.force_state("target", 2.0);
        assert_eq!(obj.get_state("target"), Some(StateValue::Float(2.0)));
        assert_eq!(obj.get_state("never"), None);
    }

    #[test]
    fn test_equal_values_do_not_renotify() {
        let obj = StateObject::new("dev");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _sub = obj.connect("busy", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        obj.set_state("busy", true);
        obj.set_state("busy", true);
        obj.set_state("busy", true);
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));

        obj.force_state("busy", true);
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_composite_values_always_notify() {
        let obj = StateObject::new("dev");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _sub = obj.connect("progress", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        obj.set_state("progress", StateValue::progress(0.5, "frame 5"));
        obj.set_state("progress", StateValue::progress(0.5, "frame 5"));
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_delivery_on_dispatch_thread_in_order() {
        let obj = StateObject::new("dev");
        let values: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = values.clone();
        let _sub = obj.connect("count", move |event| {
            assert!(SignalHub::global().on_dispatch_thread());
            if let StateValue::Int(n) = event.value {
                sink.lock().unwrap_or_else(PoisonError::into_inner).push(n);
            }
        });

        for n in 0..20 {
            obj.set_state("count", n);
        }
        assert!(wait_until(|| {
            values.lock().unwrap_or_else(PoisonError::into_inner).len() == 20
        }));
        let seen = values.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(*seen, (0..20).collect::<Vec<i64>>());
    }

    #[test]
    fn test_observer_panic_is_contained() {
        let obj = StateObject::new("dev");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _bad = obj.connect("active", |_| {
            panic!("broken observer");
        });
        let _good = obj.connect("active", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        obj.set_state("active", true);
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_disconnect_stops_delivery() {
        let obj = StateObject::new("dev");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sub = obj.connect("busy", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        obj.set_state("busy", true);
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));

        sub.disconnect();
        obj.set_state("busy", false);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_set_state_from_observer() {
        let obj = StateObject::new("dev");
        let echo = StateObject::new("echo");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _relay = {
            let echo = echo.clone();
            obj.connect("busy", move |event| {
                // Runs on the dispatch thread; this nested call must deliver
                // synchronously rather than deadlock or reorder.
                echo.set_state("busy", event.value.clone());
            })
        };
        let _sink = echo.connect("busy", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        obj.set_state("busy", true);
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));
    }
}
