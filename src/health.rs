//! Health aggregation for devices and engines.
//!
//! Hardware rarely fails one condition at a time. A cryo stream can be warm
//! while a motor is stalled and a vacuum readback is marginal, and each of
//! those conditions clears independently of the others. `HealthManager`
//! aggregates simultaneously-active conditions, each tagged by a severity and
//! a context key, into one combined severity and a human-readable message.
//!
//! Severities are bit flags so that independent fault categories can coexist
//! in a single scalar without losing any of them: the combined severity is the
//! bitwise OR of every active record. Callers test readiness with
//! [`Severity::is_usable`].

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Bitmask severity for a single health condition.
///
/// Individual flags combine with `|`; `OK` is the empty mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Severity(pub u32);

impl Severity {
    /// No issues.
    pub const OK: Severity = Severity(0);
    /// No impact to functionality.
    pub const MINOR: Severity = Severity(1);
    /// No immediate impact, attention may soon be needed.
    pub const MARGINAL: Severity = Severity(2);
    /// Functionality impacted but recovery is possible.
    pub const SERIOUS: Severity = Severity(4);
    /// Functionality broken, recovery is not possible.
    pub const CRITICAL: Severity = Severity(8);
    /// Manually or automatically disabled.
    pub const DISABLED: Severity = Severity(16);

    /// Whether this combined severity still permits normal operation.
    ///
    /// Anything up to and including `MARGINAL` is treated as usable.
    pub fn is_usable(self) -> bool {
        self.0 <= Self::MARGINAL.0 | Self::MINOR.0
    }

    /// Whether any condition at all is registered.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// True if all bits of `flag` are present in this severity.
    pub fn contains(self, flag: Severity) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl BitOr for Severity {
    type Output = Severity;

    fn bitor(self, rhs: Severity) -> Severity {
        Severity(self.0 | rhs.0)
    }
}

impl BitOrAssign for Severity {
    fn bitor_assign(&mut self, rhs: Severity) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "ok");
        }
        let names = [
            (Self::MINOR, "minor"),
            (Self::MARGINAL, "marginal"),
            (Self::SERIOUS, "serious"),
            (Self::CRITICAL, "critical"),
            (Self::DISABLED, "disabled"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Registry of currently-active health conditions.
///
/// At most one record exists per context key; adding to an existing context
/// overwrites it. Removing a context clears it entirely. The combined view is
/// produced by [`HealthManager::get_health`].
#[derive(Debug, Default)]
pub struct HealthManager {
    records: HashMap<String, (Severity, Option<String>)>,
}

impl HealthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a condition for `context`, overwriting any previous record.
    ///
    /// `Severity::OK` is rejected as a no-op: clearing a context is done with
    /// [`HealthManager::remove`], not by adding an empty condition.
    pub fn add(&mut self, severity: Severity, context: impl Into<String>, message: Option<String>) {
        if severity.is_ok() {
            return;
        }
        self.records.insert(context.into(), (severity, message));
    }

    /// Clear all records for `context`.
    pub fn remove(&mut self, context: &str) {
        self.records.remove(context);
    }

    /// Combined severity and message over all active records.
    ///
    /// The severity is the bitwise OR of every record; the message is the
    /// deduplicated, space-joined set of per-context messages, falling back to
    /// the context name when no explicit message was registered.
    pub fn get_health(&self) -> (Severity, String) {
        let mut severity = Severity::OK;
        let mut messages: Vec<&str> = Vec::new();
        for (context, (sev, message)) in &self.records {
            severity |= *sev;
            let text = message.as_deref().unwrap_or(context.as_str());
            if !messages.contains(&text) {
                messages.push(text);
            }
        }
        messages.sort_unstable();
        (severity, messages.join(" "))
    }

    /// Whether no conditions are registered at all.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_combination() {
        let combined = Severity::CRITICAL | Severity::MARGINAL;
        assert_eq!(combined, Severity(10));
        assert!(combined.contains(Severity::CRITICAL));
        assert!(combined.contains(Severity::MARGINAL));
        assert!(!combined.contains(Severity::SERIOUS));
    }

    #[test]
    fn test_usable_threshold() {
        assert!(Severity::OK.is_usable());
        assert!(Severity::MINOR.is_usable());
        assert!(Severity::MARGINAL.is_usable());
        assert!(!(Severity::MARGINAL | Severity::SERIOUS).is_usable());
        assert!(!Severity::DISABLED.is_usable());
    }

    #[test]
    fn test_bitwise_or_aggregation() {
        let mut health = HealthManager::new();
        health.add(Severity::CRITICAL, "x", Some("detector offline".into()));
        health.add(Severity::MARGINAL, "y", Some("cryo warming".into()));

        let (severity, message) = health.get_health();
        assert_eq!(severity, Severity(10));
        assert!(message.contains("detector offline"));
        assert!(message.contains("cryo warming"));

        health.remove("x");
        let (severity, message) = health.get_health();
        assert_eq!(severity, Severity::MARGINAL);
        assert_eq!(message, "cryo warming");
    }

    #[test]
    fn test_ok_is_rejected() {
        let mut health = HealthManager::new();
        health.add(Severity::OK, "x", Some("should not register".into()));
        assert!(health.is_empty());
    }

    #[test]
    fn test_context_fallback_message() {
        let mut health = HealthManager::new();
        health.add(Severity::SERIOUS, "vacuum", None);
        let (severity, message) = health.get_health();
        assert_eq!(severity, Severity::SERIOUS);
        assert_eq!(message, "vacuum");
    }

    #[test]
    fn test_one_record_per_context() {
        let mut health = HealthManager::new();
        health.add(Severity::MINOR, "beam", Some("low flux".into()));
        health.add(Severity::SERIOUS, "beam", Some("no beam".into()));
        let (severity, message) = health.get_health();
        assert_eq!(severity, Severity::SERIOUS);
        assert_eq!(message, "no beam");
    }
}
