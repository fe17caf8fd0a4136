//! Integration tests for mode-change scripts.

use std::sync::Arc;
use std::time::Duration;

use beamctl::beamline::{GonioMode, Shutter};
use beamctl::dataset::Run;
use beamctl::engine::collector::DataCollector;
use beamctl::engine::script::{self, Script};
use beamctl::hardware::mock::sim_beamline;
use beamctl::signals::StateValue;
use tempfile::TempDir;

#[tokio::test]
async fn test_mount_mode_script_drives_hardware() {
    let sim = sim_beamline("SIM-1", true);
    let script = script::mount_mode(Arc::clone(&sim.beamline));

    assert!(script.start());
    script.wait().await;

    assert_eq!(sim.goniometer.mode(), Some(GonioMode::Mount));
    assert!(!sim.shutter.is_open());
    assert!(matches!(
        script.engine().state().get_state("done"),
        Some(StateValue::Json(_))
    ));
}

#[tokio::test]
async fn test_disabled_script_does_not_start() {
    let sim = sim_beamline("SIM-1", true);
    let script = script::collect_mode(Arc::clone(&sim.beamline));

    script.disable();
    assert!(!script.start());
    assert!(!script.engine().is_busy());
    assert_eq!(sim.goniometer.mode(), None);

    script.enable();
    assert!(script.start());
    script.wait().await;
    assert_eq!(sim.goniometer.mode(), Some(GonioMode::Collect));
}

#[tokio::test]
async fn test_interlock_follows_external_busy_signal() {
    let sim = sim_beamline("SIM-1", true);
    let script = script::center_mode(Arc::clone(&sim.beamline));
    let source = beamctl::signals::StateObject::new("robot");
    let _interlock = script.bind_interlock(&source, "busy");

    source.set_state("busy", true);
    wait_until(|| !script.is_enabled()).await;
    assert!(!script.start());

    // Level-triggered: clearing the signal re-enables new starts.
    source.set_state("busy", false);
    wait_until(|| script.is_enabled()).await;
    assert!(script.start());
    script.wait().await;
}

#[tokio::test]
async fn test_script_serializes_against_collection() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", false);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));
    collector.configure(
        vec![Run {
            name: "busy".to_string(),
            directory: dir.path().to_path_buf(),
            range: 20.0,
            delta: 1.0,
            exposure: 0.01,
            ..Run::default()
        }],
        false,
    );
    assert!(collector.start());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The script cannot take the hardware lock while collection holds it.
    let script = script::mount_mode(Arc::clone(&sim.beamline));
    assert!(script.start());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(script.engine().is_busy());
    assert_ne!(sim.goniometer.mode(), Some(GonioMode::Mount));

    collector.engine().wait().await;
    script.wait().await;
    assert_eq!(sim.goniometer.mode(), Some(GonioMode::Mount));
}

#[tokio::test]
async fn test_stub_script_surfaces_programming_error() {
    let sim = sim_beamline("SIM-1", true);
    let script = Script::stub("Unwritten", "not yet implemented", Arc::clone(&sim.beamline));

    assert!(script.start());
    script.wait().await;

    let error = script.engine().state().get_state("error");
    assert!(
        matches!(error, Some(StateValue::Text(ref m)) if m.contains("run() not implemented")),
        "unexpected error state: {error:?}"
    );
}

async fn wait_until(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tokio::time::Instant::now() < deadline, "condition timed out");
    }
}
