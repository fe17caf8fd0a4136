//! Base device housekeeping.
//!
//! A [`Device`] represents a controllable hardware unit. It owns a
//! [`StateObject`] for observable state (`active`, `busy`, `health`,
//! `message`), a [`HealthManager`] aggregating fault conditions, and a set of
//! *pending* child components: children that have not yet reported themselves
//! active. A device is active exactly when that set is empty.
//!
//! Concrete devices embed a `Device` and implement [`Component`], which is how
//! composite devices (and engines watching hardware) reach a child's state.
//!
//! A periodic liveness monitor inspects the pending set on a fixed interval
//! and raises a `DISABLED` health entry naming the stuck components. This is
//! the primary stuck-dependency detector: it fires even when no state change
//! ever arrives from the child.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::health::{HealthManager, Severity};
use crate::signals::{StateObject, StateValue};

/// Anything that exposes device state to a parent.
///
/// Implemented by `Device` itself and by every concrete hardware wrapper, so
/// composites can register children without knowing their concrete types.
pub trait Component: Send + Sync {
    fn device(&self) -> &Device;

    fn name(&self) -> &str {
        self.device().state().name()
    }

    fn state(&self) -> &StateObject {
        self.device().state()
    }

    fn is_active(&self) -> bool {
        self.device().state().get_bool("active")
    }
}

/// Generic device object. All devices are built around one of these.
///
/// Cheap to clone; clones share state, health and pending set.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    state: StateObject,
    health: Mutex<HealthManager>,
    pending: Mutex<BTreeSet<String>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                state: StateObject::new(name),
                health: Mutex::new(HealthManager::new()),
                pending: Mutex::new(BTreeSet::new()),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> &StateObject {
        &self.inner.state
    }

    pub fn name(&self) -> &str {
        self.inner.state.name()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.get_bool("active")
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.get_bool("busy")
    }

    /// Mark a leaf device active/inactive directly.
    pub fn set_active(&self, active: bool) {
        self.inner.state.set_state("active", active);
    }

    pub fn set_busy(&self, busy: bool) {
        self.inner.state.set_state("busy", busy);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.inner.state.set_state("message", message.into());
    }

    /// Register a health condition and emit the combined health state.
    ///
    /// `Severity::OK` clears the context instead of storing a record.
    pub fn set_health(&self, severity: Severity, context: &str, message: Option<String>) {
        let combined = {
            let mut health = self
                .inner
                .health
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if severity.is_ok() {
                health.remove(context);
            } else {
                health.add(severity, context, message);
            }
            health.get_health()
        };
        self.inner
            .state
            .set_state("health", StateValue::health(combined.0, combined.1));
    }

    /// Current combined health over all active conditions.
    pub fn health(&self) -> (Severity, String) {
        self.inner
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_health()
    }

    /// Names of children not yet reporting active.
    pub fn pending(&self) -> Vec<String> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Register child components and track their readiness.
    ///
    /// Each child not yet active joins the pending set; a listener on the
    /// child's `active` signal keeps membership current from then on.
    pub fn add_components(&self, components: Vec<Arc<dyn Component>>) {
        for component in components {
            let child_name = component.name().to_string();
            if !component.is_active() {
                self.inner
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(child_name.clone());
            }
            let parent = self.clone();
            let name = child_name.clone();
            // Subscriptions live as long as the child's state object.
            let _ = component.state().connect("active", move |event| {
                let active = event.value.as_bool().unwrap_or(false);
                parent.on_component_active(&name, active);
            });
        }
        self.refresh_active();
    }

    fn on_component_active(&self, name: &str, active: bool) {
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if active {
                pending.remove(name);
            } else {
                pending.insert(name.to_string());
            }
        }
        debug!(device = %self.name(), component = name, active, "component transition");
        self.refresh_active();
    }

    fn refresh_active(&self) {
        let count = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        if count == 0 {
            self.inner.state.set_state("active", true);
            self.set_health(Severity::OK, "active", None);
        } else {
            self.inner.state.set_state("active", false);
            self.set_health(
                Severity::MARGINAL,
                "active",
                Some(format!("[{}] inactive components", count)),
            );
        }
    }

    /// Start the periodic liveness check.
    ///
    /// Must be called from within a tokio runtime. Each tick inspects the
    /// pending set; stuck components raise a `DISABLED` health entry that
    /// clears once the set empties.
    pub fn start_monitor(&self, interval: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a device still
            // wiring up its children is not flagged at once.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.check_pending();
            }
        });
        let mut monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = monitor.replace(handle) {
            old.abort();
        }
    }

    pub fn stop_monitor(&self) {
        let mut monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = monitor.take() {
            handle.abort();
        }
    }

    fn check_pending(&self) {
        let stuck = self.pending();
        if stuck.is_empty() {
            self.set_health(Severity::OK, "stuck", None);
        } else {
            warn!(device = %self.name(), components = ?stuck, "components stuck inactive");
            self.set_health(
                Severity::DISABLED,
                "stuck",
                Some(format!("components not ready: {}", stuck.join(", "))),
            );
        }
    }
}

impl Component for Device {
    fn device(&self) -> &Device {
        self
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Log a device's activity transitions. Used by the CLI to narrate runs.
pub fn log_transitions(device: &Device) {
    let name = device.name().to_string();
    let _ = device.state().connect("active", move |event| {
        let state = if event.value.as_bool().unwrap_or(false) {
            "active"
        } else {
            "inactive"
        };
        info!("({}) is now {}", name, state);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

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

    fn as_component(device: &Device) -> Arc<dyn Component> {
        Arc::new(device.clone())
    }

    #[test]
    fn test_active_iff_pending_empty() {
        let parent = Device::new("beamline");
        let gonio = Device::new("goniometer");
        let detector = Device::new("detector");
        detector.set_active(true);

        parent.add_components(vec![as_component(&gonio), as_component(&detector)]);
        assert_eq!(parent.pending(), vec!["goniometer".to_string()]);
        assert!(!parent.is_active());

        gonio.set_active(true);
        assert!(wait_until(|| parent.is_active() && parent.pending().is_empty()));

        // Regression: a child dropping out must re-open the pending set.
        detector.set_active(false);
        assert!(wait_until(|| {
            !parent.is_active() && parent.pending() == vec!["detector".to_string()]
        }));
        let (severity, message) = parent.health();
        assert_eq!(severity, Severity::MARGINAL);
        assert!(message.contains("inactive components"));

        detector.set_active(true);
        assert!(wait_until(|| parent.is_active()));
        assert_eq!(parent.health().0, Severity::OK);
    }

    #[test]
    fn test_all_children_initially_active() {
        let parent = Device::new("shutters");
        let a = Device::new("a");
        let b = Device::new("b");
        a.set_active(true);
        b.set_active(true);
        parent.add_components(vec![as_component(&a), as_component(&b)]);
        assert!(parent.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_monitor_flags_stuck_components() {
        let parent = Device::new("beamline");
        let child = Device::new("cryo");
        parent.add_components(vec![as_component(&child)]);
        parent.start_monitor(Duration::from_secs(10));

        // Two intervals with no state change at all: the monitor alone must
        // raise the condition.
        tokio::time::sleep(Duration::from_secs(25)).await;
        let (severity, message) = parent.health();
        assert!(severity.contains(Severity::DISABLED));
        assert!(message.contains("cryo"));

        child.set_active(true);
        // Give the dispatch thread real time to deliver before advancing the
        // paused clock past the next monitor tick.
        std::thread::sleep(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!parent.health().0.contains(Severity::DISABLED));
        parent.stop_monitor();
    }
}
