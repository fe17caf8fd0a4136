//! Mock hardware for testing without physical devices.
//!
//! Each mock honours the timing shape of the real thing at a compressed
//! scale: motions take a few milliseconds, exposures take their configured
//! time, and the detector writes real (empty) frame files to disk so that
//! the collector's disk-truth resume logic can be exercised for real.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::beamline::{
    Beamline, BeamlineOptions, Centerer, Detector, FrameParameters, GonioMode, Goniometer, Lims,
    MountedSample, Mounter, Positioner, SampleCamera, Shutter,
};
use crate::dataset::DatasetSummary;
use crate::device::{Component, Device};

fn jitter() -> Duration {
    Duration::from_micros(rand::thread_rng().gen_range(200..1500))
}

// =============================================================================
// Positioner
// =============================================================================

/// Instantly-settling motorized setpoint.
pub struct MockPositioner {
    device: Device,
    position: Mutex<f64>,
}

impl MockPositioner {
    pub fn new(name: &str, initial: f64) -> Arc<Self> {
        let device = Device::new(name);
        device.set_active(true);
        Arc::new(Self {
            device,
            position: Mutex::new(initial),
        })
    }
}

impl Component for MockPositioner {
    fn device(&self) -> &Device {
        &self.device
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    async fn move_to(&self, position: f64, wait: bool) -> Result<()> {
        self.device.set_busy(true);
        if wait {
            tokio::time::sleep(jitter()).await;
        }
        {
            let mut current = self.position.lock().unwrap_or_else(PoisonError::into_inner);
            *current = position;
        }
        self.device.set_busy(false);
        debug!(device = %self.device.name(), position, "moved");
        Ok(())
    }

    async fn position(&self) -> f64 {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait_motion(&self, _start: bool, _stop: bool, _timeout: Duration) -> bool {
        true
    }

    async fn stop(&self) {
        self.device.set_busy(false);
    }
}

// =============================================================================
// Shutter
// =============================================================================

pub struct MockShutter {
    device: Device,
    open: AtomicBool,
}

impl MockShutter {
    pub fn new(name: &str) -> Arc<Self> {
        let device = Device::new(name);
        device.set_active(true);
        Arc::new(Self {
            device,
            open: AtomicBool::new(false),
        })
    }
}

impl Component for MockShutter {
    fn device(&self) -> &Device {
        &self.device
    }
}

#[async_trait]
impl Shutter for MockShutter {
    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        self.device.state().set_state("changed", true);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.device.state().set_state("changed", false);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Detector
// =============================================================================

/// Area detector that writes empty frame files to disk.
pub struct MockDetector {
    device: Device,
    shutterless: bool,
    extension: String,
    params: Mutex<Option<FrameParameters>>,
    /// Remaining number of start() calls to fail, for retry-path tests.
    fail_starts: AtomicU32,
    stopping: AtomicBool,
    cover_open: AtomicBool,
    written: Mutex<Vec<u32>>,
}

impl MockDetector {
    pub fn new(name: &str, shutterless: bool) -> Arc<Self> {
        let device = Device::new(name);
        device.set_active(true);
        Arc::new(Self {
            device,
            shutterless,
            extension: "img".to_string(),
            params: Mutex::new(None),
            fail_starts: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
            cover_open: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `count` start() calls report failure.
    pub fn fail_next_starts(&self, count: u32) {
        self.fail_starts.store(count, Ordering::SeqCst);
    }

    pub fn cover_is_open(&self) -> bool {
        self.cover_open.load(Ordering::SeqCst)
    }

    /// Every frame number this detector has acquired, in order.
    pub fn frames_written(&self) -> Vec<u32> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Component for MockDetector {
    fn device(&self) -> &Device {
        &self.device
    }
}

#[async_trait]
impl Detector for MockDetector {
    fn shutterless(&self) -> bool {
        self.shutterless
    }

    fn file_extension(&self) -> &str {
        &self.extension
    }

    async fn set_parameters(&self, params: FrameParameters) -> Result<()> {
        let mut stored = self.params.lock().unwrap_or_else(PoisonError::into_inner);
        *stored = Some(params);
        Ok(())
    }

    async fn start(&self, _first: bool) -> bool {
        let remaining = self.fail_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_starts.store(remaining - 1, Ordering::SeqCst);
            return false;
        }
        self.stopping.store(false, Ordering::SeqCst);
        true
    }

    async fn save(&self) -> Result<()> {
        let params = {
            let stored = self.params.lock().unwrap_or_else(PoisonError::into_inner);
            stored.clone()
        };
        let Some(params) = params else {
            return Ok(());
        };
        tokio::fs::create_dir_all(&params.directory)
            .await
            .context("creating frame directory")?;
        for index in 0..params.num_frames {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            let frame = params.start_frame + index;
            let file = params.directory.join(format!(
                "{}_{:04}.{}",
                params.file_prefix, frame, self.extension
            ));
            tokio::fs::write(&file, b"").await.context("writing frame")?;
            {
                let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
                written.push(frame);
            }
            self.device
                .state()
                .force_state("frames", i64::from(index + 1));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    async fn set_cover(&self, open: bool) -> Result<()> {
        self.cover_open.store(open, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Goniometer
// =============================================================================

struct ScanSetup {
    time: f64,
    delta: f64,
    angle: f64,
}

pub struct MockGoniometer {
    device: Device,
    mode: Mutex<Option<GonioMode>>,
    setup: Mutex<Option<ScanSetup>>,
    stopping: AtomicBool,
}

impl MockGoniometer {
    pub fn new(name: &str) -> Arc<Self> {
        let device = Device::new(name);
        device.set_active(true);
        Arc::new(Self {
            device,
            mode: Mutex::new(None),
            setup: Mutex::new(None),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> Option<GonioMode> {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Component for MockGoniometer {
    fn device(&self) -> &Device {
        &self.device
    }
}

#[async_trait]
impl Goniometer for MockGoniometer {
    async fn configure(&self, exposure: f64, delta: f64, angle: f64) -> Result<()> {
        let mut setup = self.setup.lock().unwrap_or_else(PoisonError::into_inner);
        *setup = Some(ScanSetup {
            time: exposure,
            delta,
            angle,
        });
        Ok(())
    }

    async fn scan(&self, wait: bool, timeout: Duration) -> bool {
        let time = {
            let setup = self.setup.lock().unwrap_or_else(PoisonError::into_inner);
            setup.as_ref().map(|s| s.time).unwrap_or(0.0)
        };
        self.stopping.store(false, Ordering::SeqCst);
        self.device.set_busy(true);
        let result = if wait {
            let total = Duration::from_secs_f64(time.max(0.0));
            let deadline = tokio::time::Instant::now() + timeout;
            let mut spent = Duration::ZERO;
            let mut in_time = true;
            while spent < total {
                if self.stopping.load(Ordering::SeqCst) {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    in_time = false;
                    break;
                }
                let step = Duration::from_millis(2).min(total - spent);
                tokio::time::sleep(step).await;
                spent += step;
            }
            in_time
        } else {
            true
        };
        self.device.set_busy(false);
        result
    }

    async fn set_mode(&self, mode: GonioMode, wait: bool) -> Result<()> {
        if wait {
            tokio::time::sleep(jitter()).await;
        }
        {
            let mut current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
            *current = Some(mode);
        }
        self.device.state().set_state("mode", mode.to_string());
        Ok(())
    }

    async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Mounter
// =============================================================================

pub struct MockMounter {
    device: Device,
    mounted: Mutex<Option<MountedSample>>,
    barcodes: Mutex<HashMap<String, String>>,
    failing_ports: Mutex<HashSet<String>>,
    mounts: AtomicU32,
    standby: Mutex<Option<Duration>>,
}

impl MockMounter {
    pub fn new(name: &str) -> Arc<Self> {
        let device = Device::new(name);
        device.set_active(true);
        Arc::new(Self {
            device,
            mounted: Mutex::new(None),
            barcodes: Mutex::new(HashMap::new()),
            failing_ports: Mutex::new(HashSet::new()),
            mounts: AtomicU32::new(0),
            standby: Mutex::new(None),
        })
    }

    /// Assign the barcode physically present on a pin.
    pub fn set_barcode(&self, port: &str, barcode: &str) {
        let mut barcodes = self.barcodes.lock().unwrap_or_else(PoisonError::into_inner);
        barcodes.insert(port.to_string(), barcode.to_string());
    }

    /// Make mounts of `port` fail.
    pub fn fail_port(&self, port: &str) {
        let mut failing = self
            .failing_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        failing.insert(port.to_string());
    }

    pub fn mount_count(&self) -> u32 {
        self.mounts.load(Ordering::SeqCst)
    }
}

impl Component for MockMounter {
    fn device(&self) -> &Device {
        &self.device
    }
}

#[async_trait]
impl Mounter for MockMounter {
    fn is_mounted(&self, port: &str) -> bool {
        self.mounted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|m| m.port == port)
            .unwrap_or(false)
    }

    fn is_mountable(&self, port: &str) -> bool {
        !self
            .failing_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(port)
    }

    fn mounted(&self) -> Option<MountedSample> {
        self.mounted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn auto_mount(&self, port: &str) -> Result<bool> {
        self.device.set_busy(true);
        tokio::time::sleep(jitter()).await;
        self.device.set_busy(false);
        self.mounts.fetch_add(1, Ordering::SeqCst);
        if !self.is_mountable(port) {
            return Ok(false);
        }
        let barcode = self
            .barcodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port)
            .cloned();
        let mut mounted = self.mounted.lock().unwrap_or_else(PoisonError::into_inner);
        *mounted = Some(MountedSample {
            port: port.to_string(),
            barcode,
        });
        Ok(true)
    }

    async fn auto_dismount(&self) -> Result<bool> {
        tokio::time::sleep(jitter()).await;
        let mut mounted = self.mounted.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(mounted.take().is_some())
    }

    fn standby(&self, duration: Duration) {
        let mut standby = self.standby.lock().unwrap_or_else(PoisonError::into_inner);
        *standby = Some(duration);
    }
}

// =============================================================================
// Synchrotron, centering, camera, LIMS
// =============================================================================

/// Facility beam status source; emits a boolean `ready` state.
pub struct MockSynchrotron {
    device: Device,
}

impl MockSynchrotron {
    pub fn new() -> Arc<Self> {
        let device = Device::new("synchrotron");
        device.set_active(true);
        device.state().set_state("ready", true);
        Arc::new(Self { device })
    }

    pub fn set_available(&self, available: bool) {
        self.device.state().set_state("ready", available);
    }
}

impl Component for MockSynchrotron {
    fn device(&self) -> &Device {
        &self.device
    }
}

/// Centering collaborator returning scripted quality scores.
pub struct MockCenterer {
    scores: Mutex<VecDeque<f64>>,
    default_score: Mutex<f64>,
}

impl MockCenterer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scores: Mutex::new(VecDeque::new()),
            default_score: Mutex::new(95.0),
        })
    }

    /// Queue a score for the next centering attempt.
    pub fn push_score(&self, score: f64) {
        self.scores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(score);
    }

    pub fn set_default_score(&self, score: f64) {
        let mut default = self
            .default_score
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *default = score;
    }
}

#[async_trait]
impl Centerer for MockCenterer {
    async fn center(&self, _method: &str) -> Result<f64> {
        tokio::time::sleep(jitter()).await;
        let queued = self
            .scores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(queued.unwrap_or(*self
            .default_score
            .lock()
            .unwrap_or_else(PoisonError::into_inner)))
    }
}

pub struct MockCamera;

#[async_trait]
impl SampleCamera for MockCamera {
    async fn save_frame(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, b"PNG").await.context("saving snapshot")?;
        Ok(())
    }
}

/// Recording LIMS client.
pub struct MockLims {
    uploads: Mutex<Vec<(String, Vec<DatasetSummary>)>>,
}

impl MockLims {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub fn uploads(&self) -> Vec<(String, Vec<DatasetSummary>)> {
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Lims for MockLims {
    async fn upload_datasets(&self, beamline: &str, datasets: &[DatasetSummary]) -> Result<()> {
        let mut uploads = self.uploads.lock().unwrap_or_else(PoisonError::into_inner);
        uploads.push((beamline.to_string(), datasets.to_vec()));
        Ok(())
    }
}

// =============================================================================
// Assembled simulation beamline
// =============================================================================

/// A fully mocked beamline plus handles for poking it from tests.
pub struct SimBeamline {
    pub beamline: Arc<Beamline>,
    pub detector: Arc<MockDetector>,
    pub goniometer: Arc<MockGoniometer>,
    pub shutter: Arc<MockShutter>,
    pub energy: Arc<MockPositioner>,
    pub distance: Arc<MockPositioner>,
    pub attenuator: Arc<MockPositioner>,
    pub mounter: Arc<MockMounter>,
    pub synchrotron: Arc<MockSynchrotron>,
    pub centerer: Arc<MockCenterer>,
    pub lims: Arc<MockLims>,
}

/// Build a simulated beamline with timing compressed for tests.
pub fn sim_beamline(name: &str, shutterless: bool) -> SimBeamline {
    let detector = MockDetector::new("detector", shutterless);
    let goniometer = MockGoniometer::new("goniometer");
    let shutter = MockShutter::new("fast-shutter");
    let energy = MockPositioner::new("energy", 12.658);
    let distance = MockPositioner::new("distance", 250.0);
    let attenuator = MockPositioner::new("attenuator", 0.0);
    let mounter = MockMounter::new("automounter");
    let synchrotron = MockSynchrotron::new();
    let centerer = MockCenterer::new();
    let lims = MockLims::new();

    let components: Vec<Arc<dyn Component>> = vec![
        detector.clone(),
        goniometer.clone(),
        shutter.clone(),
        energy.clone(),
        distance.clone(),
        attenuator.clone(),
        mounter.clone(),
        synchrotron.clone(),
    ];

    let beamline = Arc::new(Beamline {
        name: name.to_string(),
        lock: AsyncMutex::new(()),
        detector: detector.clone(),
        goniometer: goniometer.clone(),
        fast_shutter: shutter.clone(),
        energy: energy.clone(),
        distance: distance.clone(),
        attenuator: attenuator.clone(),
        mounter: mounter.clone(),
        synchrotron: synchrotron.clone(),
        sample_camera: Arc::new(MockCamera),
        lims: lims.clone(),
        components,
        options: BeamlineOptions {
            beam_settle: Duration::from_millis(50),
            scan_overhead: Duration::from_secs(5),
            ..BeamlineOptions::default()
        },
    });

    SimBeamline {
        beamline,
        detector,
        goniometer,
        shutter,
        energy,
        distance,
        attenuator,
        mounter,
        synchrotron,
        centerer,
        lims,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detector_writes_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let detector = MockDetector::new("det", true);
        detector
            .set_parameters(FrameParameters {
                file_prefix: "xtal".to_string(),
                directory: dir.path().to_path_buf(),
                start_frame: 1,
                num_frames: 3,
                exposure: 0.01,
                start_angle: 0.0,
                delta: 1.0,
                energy: 12.658,
                distance: 250.0,
            })
            .await
            .expect("set_parameters");
        assert!(detector.start(true).await);
        detector.save().await.expect("save");
        let frames = crate::dataset::scan_existing(dir.path(), "xtal", "img");
        assert_eq!(frames, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_detector_start_failure_injection() {
        let detector = MockDetector::new("det", false);
        detector.fail_next_starts(1);
        assert!(!detector.start(true).await);
        assert!(detector.start(false).await);
    }

    #[tokio::test]
    async fn test_mounter_round_trip() {
        let mounter = MockMounter::new("robot");
        mounter.set_barcode("1A", "CLS-0001");
        assert!(mounter.auto_mount("1A").await.expect("mount"));
        assert!(mounter.is_mounted("1A"));
        assert_eq!(
            mounter.mounted().and_then(|m| m.barcode),
            Some("CLS-0001".to_string())
        );
        assert!(mounter.auto_dismount().await.expect("dismount"));
        assert!(!mounter.is_mounted("1A"));
    }

    #[tokio::test]
    async fn test_goniometer_scan_times_out() {
        let gonio = MockGoniometer::new("gonio");
        gonio.configure(5.0, 1.0, 0.0).await.expect("configure");
        assert!(!gonio.scan(true, Duration::from_millis(20)).await);
    }
}
