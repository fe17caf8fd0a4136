//! Integration tests for the data collection engine against mock hardware.

use std::sync::Arc;
use std::time::Duration;

use beamctl::beamline::{GonioMode, Positioner, Shutter};
use beamctl::dataset::{scan_existing, DatasetSummary, Run};
use beamctl::engine::collector::DataCollector;
use beamctl::hardware::mock::sim_beamline;
use beamctl::signals::StateValue;
use tempfile::TempDir;

fn test_run(dir: &TempDir, name: &str, frames: u32) -> Run {
    Run {
        name: name.to_string(),
        directory: dir.path().to_path_buf(),
        range: f64::from(frames),
        delta: 1.0,
        exposure: 0.005,
        wedge: 180.0,
        ..Run::default()
    }
}

async fn wait_idle(collector: &Arc<DataCollector>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let busy = collector.engine().is_busy();
        let paused = collector.engine().control().is_paused();
        if !busy && !paused {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "collector did not go idle in time"
        );
    }
}

#[tokio::test]
async fn test_full_shutterless_collection() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", true);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    sim.attenuator
        .move_to(12.5, true)
        .await
        .expect("preset attenuation");

    collector.configure(vec![test_run(&dir, "native", 6)], false);
    let results = collector.execute().await.expect("collection");

    assert_eq!(scan_existing(dir.path(), "native", "img"), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].frames, "1-6");
    assert_eq!(results[0].num_frames, 6);

    // Cleanup guarantees: shutter closed, attenuation restored, cover closed,
    // endstation left in collect mode.
    assert!(!sim.shutter.is_open());
    assert!((sim.attenuator.position().await - 12.5).abs() < 1e-9);
    assert!(!sim.detector.cover_is_open());
    assert_eq!(sim.goniometer.mode(), Some(GonioMode::Collect));

    // Reporting is fire-and-forget but must have been attempted once.
    let uploads = sim.lims.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "SIM-1");

    // The summary file on disk matches what was returned.
    let summary =
        DatasetSummary::load(&DatasetSummary::path(dir.path(), "native")).expect("summary");
    assert_eq!(summary.frames, "1-6");
}

#[tokio::test]
async fn test_stepped_collection_acquires_frame_by_frame() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", false);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    collector.configure(vec![test_run(&dir, "stepped", 4)], false);
    collector.execute().await.expect("collection");

    assert_eq!(sim.detector.frames_written(), vec![1, 2, 3, 4]);
    assert_eq!(scan_existing(dir.path(), "stepped", "img"), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_configure_skips_frames_already_on_disk() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", true);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    // A previous run got through frames 1..4 before being interrupted.
    for frame in 1..=4u32 {
        std::fs::write(dir.path().join(format!("resumed_{frame:04}.img")), b"")
            .expect("seed frame");
    }

    collector.configure(vec![test_run(&dir, "resumed", 10)], false);
    let results = collector.execute().await.expect("collection");

    // Only the missing frames were acquired: no duplicates, no gaps.
    assert_eq!(sim.detector.frames_written(), vec![5, 6, 7, 8, 9, 10]);
    assert_eq!(
        scan_existing(dir.path(), "resumed", "img"),
        (1..=10).collect::<Vec<u32>>()
    );
    assert_eq!(results[0].frames, "1-10");
}

#[tokio::test]
async fn test_summary_merge_preserves_lims_identifier_across_resume() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", true);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    // First half of the dataset; the reporting service assigns an id.
    collector.configure(vec![test_run(&dir, "split", 4)], false);
    collector.execute().await.expect("first half");
    let path = DatasetSummary::path(dir.path(), "split");
    let mut summary = DatasetSummary::load(&path).expect("summary");
    summary.id = Some("lims-7".to_string());
    std::fs::write(&path, serde_json::to_string_pretty(&summary).expect("json"))
        .expect("write back");

    // Second half, as a resume would configure it.
    collector.configure(vec![test_run(&dir, "split", 8)], false);
    collector.execute().await.expect("second half");

    let merged = DatasetSummary::load(&path).expect("merged");
    assert_eq!(merged.id.as_deref(), Some("lims-7"));
    assert_eq!(merged.frames, "1-8");
    assert_eq!(sim.detector.frames_written(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn test_beam_loss_pauses_and_recovery_resumes() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", false);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    collector.configure(vec![test_run(&dir, "beamloss", 40)], false);
    assert!(collector.start());

    // Let a few frames land, then drop the beam.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while scan_existing(dir.path(), "beamloss", "img").len() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(tokio::time::Instant::now() < deadline, "no frames acquired");
    }
    sim.synchrotron.set_available(false);

    // The run must transition to paused and release its worker.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !(collector.engine().control().is_paused() && !collector.engine().is_busy()) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tokio::time::Instant::now() < deadline, "pause never landed");
    }
    let frozen = scan_existing(dir.path(), "beamloss", "img").len();
    assert!(frozen < 40, "run finished before the beam dropped");

    // Beam back: auto-resume recomputes remaining work and finishes the run.
    sim.synchrotron.set_available(true);
    wait_idle(&collector).await;

    assert_eq!(
        scan_existing(dir.path(), "beamloss", "img"),
        (1..=40).collect::<Vec<u32>>()
    );
    // Exactly-once acquisition across the pause boundary.
    let mut written = sim.detector.frames_written();
    written.sort_unstable();
    written.dedup();
    assert_eq!(written.len(), sim.detector.frames_written().len());
}

#[tokio::test]
async fn test_stop_closes_shutter_and_reports_stopped() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", false);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    collector.configure(vec![test_run(&dir, "halted", 50)], false);
    assert!(collector.start());
    tokio::time::sleep(Duration::from_millis(60)).await;
    collector.stop().await;
    collector.engine().wait().await;

    assert!(matches!(
        collector.engine().state().get_state("stopped"),
        Some(StateValue::Trigger)
    ));
    assert!(!sim.shutter.is_open());
    assert!(scan_existing(dir.path(), "halted", "img").len() < 50);
}

#[tokio::test]
async fn test_detector_start_retry_then_success() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", true);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    // One failure is absorbed by the retry.
    sim.detector.fail_next_starts(1);
    collector.configure(vec![test_run(&dir, "retry", 3)], false);
    collector.execute().await.expect("collection with retry");
    assert_eq!(scan_existing(dir.path(), "retry", "img"), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_detector_start_failure_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", true);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    sim.detector.fail_next_starts(2);
    collector.configure(vec![test_run(&dir, "broken", 3)], false);
    let result = collector.execute().await;
    assert!(result.is_err());

    // Cleanup still ran.
    assert!(!sim.shutter.is_open());

    // The engine is restartable after the failure.
    sim.detector.fail_next_starts(0);
    collector.configure(vec![test_run(&dir, "broken", 3)], false);
    collector.execute().await.expect("second attempt");
    assert_eq!(scan_existing(dir.path(), "broken", "img"), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_progress_reaches_completion() {
    let dir = TempDir::new().expect("tempdir");
    let sim = sim_beamline("SIM-1", true);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    let progress: Arc<std::sync::Mutex<Vec<f64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    let sub = collector.engine().state().connect("progress", move |event| {
        if let StateValue::Progress { fraction, .. } = event.value {
            if let Ok(mut seen) = sink.lock() {
                seen.push(fraction);
            }
        }
    });

    collector.configure(vec![test_run(&dir, "tracked", 5)], false);
    collector.execute().await.expect("collection");
    // Delivery is asynchronous; give the dispatch thread a moment to drain.
    tokio::time::sleep(Duration::from_millis(200)).await;
    sub.disconnect();

    let seen = progress.lock().expect("progress");
    assert!(!seen.is_empty(), "no progress events at all");
    assert!(seen.iter().all(|f| (0.0..=1.0).contains(f)));
    assert!((seen.last().copied().unwrap_or(0.0) - 1.0).abs() < 1e-9);
}
