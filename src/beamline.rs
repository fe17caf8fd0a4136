//! Hardware collaborator interfaces.
//!
//! Engines never talk to concrete hardware types. Each collaborator role is an
//! explicit capability trait ([`Detector`], [`Goniometer`], [`Mounter`], ...),
//! and a [`Beamline`] bundles one implementation of each together with the
//! single hardware exclusion lock. Collaborators are injected by constructor;
//! there is no global registry, which keeps test doubles trivial.
//!
//! Hardware wait operations take absolute deadlines and return a boolean
//! success instead of raising, so the caller decides whether a timeout is
//! fatal.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::dataset::DatasetSummary;
use crate::device::{Component, Device};

/// Detector exposure parameters for one frame or one whole wedge.
#[derive(Debug, Clone)]
pub struct FrameParameters {
    /// Dataset name; file name prefix.
    pub file_prefix: String,
    pub directory: PathBuf,
    pub start_frame: u32,
    pub num_frames: u32,
    /// Exposure per frame in seconds.
    pub exposure: f64,
    pub start_angle: f64,
    pub delta: f64,
    pub energy: f64,
    pub distance: f64,
}

/// Motorized setpoint (energy, detector distance, attenuation).
#[async_trait]
pub trait Positioner: Component {
    /// Begin motion towards `position`; block for completion when `wait`.
    async fn move_to(&self, position: f64, wait: bool) -> Result<()>;

    /// Current readback. May be approximate during motion.
    async fn position(&self) -> f64;

    /// Wait for motion to start and/or stop before the deadline.
    async fn wait_motion(&self, start: bool, stop: bool, timeout: Duration) -> bool;

    /// Halt motion in place.
    async fn stop(&self);
}

/// Fast exposure shutter or any open/close element.
#[async_trait]
pub trait Shutter: Component {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_open(&self) -> bool;
}

/// Area detector.
///
/// Emits an `Int` `frames` state on its device while acquiring, which is how
/// collectors track frame-count progress during a wedge.
#[async_trait]
pub trait Detector: Component {
    /// Whether the detector captures a whole wedge in one continuous motion.
    fn shutterless(&self) -> bool;

    /// File extension of frames written to disk.
    fn file_extension(&self) -> &str;

    async fn set_parameters(&self, params: FrameParameters) -> Result<()>;

    /// Arm for acquisition. Returns `false` on failure; the collector retries
    /// once before declaring the run failed.
    async fn start(&self, first: bool) -> bool;

    /// Flush acquired frames to disk.
    async fn save(&self) -> Result<()>;

    /// Stop in place, leaving no partial frame ambiguous.
    async fn stop(&self);

    async fn set_cover(&self, open: bool) -> Result<()>;
}

/// End-station mode the goniometer can be asked to assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GonioMode {
    /// Sample exchange position.
    Mount,
    /// Optical centering position.
    Center,
    /// Data collection position.
    Collect,
}

impl fmt::Display for GonioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GonioMode::Mount => write!(f, "MOUNT"),
            GonioMode::Center => write!(f, "CENTER"),
            GonioMode::Collect => write!(f, "COLLECT"),
        }
    }
}

#[async_trait]
pub trait Goniometer: Component {
    /// Stage the next scan: exposure per frame, oscillation and start angle.
    async fn configure(&self, exposure: f64, delta: f64, angle: f64) -> Result<()>;

    /// Execute the staged scan. Returns whether it completed in time.
    async fn scan(&self, wait: bool, timeout: Duration) -> bool;

    async fn set_mode(&self, mode: GonioMode, wait: bool) -> Result<()>;

    async fn stop(&self);
}

/// Sample currently on the goniometer, as reported by the robot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountedSample {
    pub port: String,
    pub barcode: Option<String>,
}

/// Sample exchange robot.
#[async_trait]
pub trait Mounter: Component {
    fn is_mounted(&self, port: &str) -> bool;
    fn is_mountable(&self, port: &str) -> bool;
    fn mounted(&self) -> Option<MountedSample>;

    /// Mount the sample at `port`, blocking until done. `Ok(false)` means the
    /// robot completed but the sample did not end up on the goniometer.
    async fn auto_mount(&self, port: &str) -> Result<bool>;

    async fn auto_dismount(&self) -> Result<bool>;

    /// Advisory: no exchanges will be requested for roughly this long.
    fn standby(&self, duration: Duration);
}

/// Optical loop-centering collaborator.
#[async_trait]
pub trait Centerer: Send + Sync {
    /// Center the mounted sample and return a quality score in percent.
    async fn center(&self, method: &str) -> Result<f64>;
}

/// Camera looking at the sample position.
#[async_trait]
pub trait SampleCamera: Send + Sync {
    async fn save_frame(&self, path: &Path) -> Result<()>;
}

/// Laboratory information system client.
#[async_trait]
pub trait Lims: Send + Sync {
    /// Report acquired datasets. Fire-and-forget from the collector's
    /// perspective; failures are logged, not retried.
    async fn upload_datasets(&self, beamline: &str, datasets: &[DatasetSummary]) -> Result<()>;
}

/// Motion tolerances and timing for a beamline.
#[derive(Debug, Clone)]
pub struct BeamlineOptions {
    /// Energy moves below this delta (keV) are skipped between wedges.
    pub energy_tolerance: f64,
    /// Distance moves below this delta (mm) are skipped between wedges.
    pub distance_tolerance: f64,
    /// Settle delay between beam recovery and acquisition restart.
    pub beam_settle: Duration,
    /// Ceiling for a single goniometer scan beyond its raw exposure time.
    pub scan_overhead: Duration,
}

impl Default for BeamlineOptions {
    fn default() -> Self {
        Self {
            energy_tolerance: 0.0005,
            distance_tolerance: 0.1,
            beam_settle: Duration::from_secs(30),
            scan_overhead: Duration::from_secs(30),
        }
    }
}

/// One beamline's collaborators, bundled for injection into engines.
pub struct Beamline {
    pub name: String,
    /// Single mutual-exclusion point for physical hardware. At most one
    /// hardware-critical section (any script, any collector) holds it.
    pub lock: Mutex<()>,
    pub detector: Arc<dyn Detector>,
    pub goniometer: Arc<dyn Goniometer>,
    pub fast_shutter: Arc<dyn Shutter>,
    pub energy: Arc<dyn Positioner>,
    pub distance: Arc<dyn Positioner>,
    pub attenuator: Arc<dyn Positioner>,
    pub mounter: Arc<dyn Mounter>,
    /// Facility beam status; emits a boolean `ready` state.
    pub synchrotron: Arc<dyn Component>,
    pub sample_camera: Arc<dyn SampleCamera>,
    pub lims: Arc<dyn Lims>,
    /// Child components tracked for aggregate readiness.
    pub components: Vec<Arc<dyn Component>>,
    pub options: BeamlineOptions,
}

impl Beamline {
    /// Build the aggregate readiness device over all registered components
    /// and start its liveness monitor.
    pub fn assemble(&self, liveness_interval: Duration) -> Device {
        let device = Device::new(format!("beamline:{}", self.name));
        device.add_components(self.components.clone());
        device.start_monitor(liveness_interval);
        device
    }
}

impl fmt::Debug for Beamline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Beamline")
            .field("name", &self.name)
            .field("components", &self.components.len())
            .finish_non_exhaustive()
    }
}
