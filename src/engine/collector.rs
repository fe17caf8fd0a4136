//! Diffraction data collection engine.
//!
//! [`DataCollector`] executes a multi-wedge exposure sequence against the
//! detector, goniometer, shutter and attenuator. A run is configured from
//! user [`Run`] parameters, expanded into wedges with already-collected
//! frames carved out, then executed strictly in angular order under the
//! beamline hardware lock.
//!
//! Two acquisition paths exist: a shutterless detector captures a whole wedge
//! during one continuous goniometer motion; anything else iterates
//! move-expose-save one frame at a time. Between wedges only setpoints that
//! actually changed beyond tolerance are re-applied.
//!
//! Beam loss pauses the run automatically (stopping detector and goniometer
//! in place) and beam recovery resumes it. Resume recomputes completed frames
//! from a disk scan rather than trusting in-memory state, so it survives
//! manual intervention between pause and resume.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::beamline::{Beamline, FrameParameters, GonioMode};
use crate::dataset::{self, DatasetSummary, Run, Wedge};
use crate::engine::{self, Engine, Outcome, Runnable};
use crate::error::BeamlineError;
use crate::signals::{StateValue, Subscription};

/// How the acquisition loops exited.
enum Flow {
    Completed,
    Stopped,
    Paused,
}

#[derive(Default)]
struct CollectorConfig {
    runs: Vec<Run>,
    wedges: Vec<Wedge>,
    take_snapshots: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

/// Exposure sequencing engine.
pub struct DataCollector {
    engine: Engine,
    beamline: Arc<Beamline>,
    config: Mutex<CollectorConfig>,
    results: Mutex<Vec<DatasetSummary>>,
    /// Frames completed in already-finished wedges/frames of this run.
    progress_base: AtomicU32,
    total_frames: AtomicU32,
    frame_watch: Mutex<Option<Subscription>>,
}

impl DataCollector {
    /// Create a collector bound to a beamline.
    ///
    /// Must be called within a tokio runtime so the beam-availability
    /// subscription can marshal its reactions back onto it.
    pub fn new(beamline: Arc<Beamline>) -> Arc<Self> {
        let collector = Arc::new(Self {
            engine: Engine::new("data-collector"),
            beamline,
            config: Mutex::new(CollectorConfig::default()),
            results: Mutex::new(Vec::new()),
            progress_base: AtomicU32::new(0),
            total_frames: AtomicU32::new(0),
            frame_watch: Mutex::new(None),
        });
        collector.watch_beam();
        collector
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Summaries produced by the most recent run.
    pub fn results(&self) -> Vec<DatasetSummary> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Expand runs into wedges, skipping frames already on disk.
    pub fn configure(&self, runs: Vec<Run>, take_snapshots: bool) {
        let extension = self.beamline.detector.file_extension();
        let mut prepared = Vec::with_capacity(runs.len());
        for mut run in runs {
            let found = dataset::scan_existing(&run.directory, &run.name, extension);
            if !found.is_empty() {
                run.existing = dataset::summarize_frames(&found);
                info!(
                    run = %run.name,
                    existing = %run.existing,
                    "frames already on disk will be skipped"
                );
            } else {
                run.existing.clear();
            }
            prepared.push(run);
        }
        let wedges: Vec<Wedge> = prepared.iter().flat_map(dataset::make_wedges).collect();
        let total: u32 = wedges.iter().map(|w| w.num_frames).sum();
        self.total_frames.store(total, Ordering::SeqCst);
        self.progress_base.store(0, Ordering::SeqCst);

        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        config.runs = prepared;
        config.wedges = wedges;
        config.take_snapshots = take_snapshots;
    }

    /// Launch the configured sequence on its own worker.
    pub fn start(self: &Arc<Self>) -> bool {
        engine::start(Arc::clone(self) as Arc<dyn Runnable>)
    }

    /// Run the configured sequence to completion and return its summaries.
    ///
    /// Blocks across automatic beam-loss pauses; returns once the sequence
    /// finishes, is stopped, or fails.
    pub async fn execute(self: &Arc<Self>) -> Result<Vec<DatasetSummary>> {
        let error_mark = self.engine.state().last_set("error");
        if !self.start() {
            bail!("collector is already running");
        }
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.engine.is_busy() || self.engine.control().is_paused() {
                continue;
            }
            break;
        }
        if self.engine.state().last_set("error") != error_mark {
            let message = self
                .engine
                .state()
                .get_state("error")
                .and_then(|v| v.as_text().map(String::from))
                .unwrap_or_else(|| "collection failed".to_string());
            bail!(message);
        }
        Ok(self.results())
    }

    /// Suspend acquisition and stop hardware in place.
    pub async fn pause(&self, reason: &str) {
        self.engine.pause(reason);
        self.beamline.detector.stop().await;
        self.beamline.goniometer.stop().await;
    }

    /// Resume a paused run by recomputing remaining work from disk.
    pub async fn resume(self: &Arc<Self>) {
        if !self.engine.control().is_paused() {
            return;
        }
        info!("beam available, resuming collection shortly");
        self.engine.state().set_state(
            "paused",
            StateValue::flag(false, "Beam restored, resuming shortly"),
        );
        tokio::time::sleep(self.beamline.options.beam_settle).await;
        // The old worker unwinds at its next checkpoint; wait for it so the
        // restart below is not refused as a double start.
        self.engine.wait().await;
        // The pause flag stays up until start() resets it together with
        // raising busy, so observers never see a resumed-but-idle window.
        let control = self.engine.control();
        if control.is_stopped() || !control.is_paused() {
            return;
        }
        self.resume_sequence();
    }

    fn resume_sequence(self: &Arc<Self>) {
        let runs = {
            let config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            config.runs.clone()
        };
        // Disk truth: whatever is on disk now is what counts as collected.
        self.configure(runs, false);
        self.start();
    }

    /// Cancel the run and stop hardware in place.
    pub async fn stop(&self) {
        self.engine.stop();
        self.beamline.detector.stop().await;
        self.beamline.goniometer.stop().await;
    }

    fn watch_beam(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            debug!("no runtime available, beam watching disabled");
            return;
        };
        let weak = Arc::downgrade(self);
        let _ = self
            .beamline
            .synchrotron
            .state()
            .connect("ready", move |event| {
                let Some(collector) = weak.upgrade() else {
                    return;
                };
                let available = event.value.as_bool().unwrap_or(false);
                handle.spawn(async move {
                    collector.on_beam_change(available).await;
                });
            });
    }

    async fn on_beam_change(self: Arc<Self>, available: bool) {
        let control = self.engine.control();
        if !available && self.engine.is_busy() && !control.interrupted() {
            self.pause(
                "Data acquisition has paused due to beam loss. \
                 It will resume automatically once the beam becomes available.",
            )
            .await;
        } else if available && control.is_paused() {
            self.resume().await;
        }
    }

    fn watch_frames(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let subscription = self
            .beamline
            .detector
            .state()
            .connect("frames", move |event| {
                let Some(collector) = weak.upgrade() else {
                    return;
                };
                if let StateValue::Int(frames) = event.value {
                    collector.on_frames(frames.max(0) as u32);
                }
            });
        let mut watch = self
            .frame_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *watch = Some(subscription);
    }

    fn unwatch_frames(&self) {
        let mut watch = self
            .frame_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(subscription) = watch.take() {
            subscription.disconnect();
        }
    }

    fn on_frames(&self, frames_in_wedge: u32) {
        if self.engine.control().interrupted() {
            return;
        }
        let done = self.progress_base.load(Ordering::SeqCst) + frames_in_wedge;
        let total = self.total_frames.load(Ordering::SeqCst).max(1);
        self.engine.emit_progress(
            f64::from(done) / f64::from(total),
            format!("{done}/{total} frames"),
        );
    }

    async fn take_snapshot(&self) {
        let first = {
            let config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            config.runs.first().cloned()
        };
        let Some(run) = first else { return };
        if let Err(err) = tokio::fs::create_dir_all(&run.directory).await {
            warn!(error = %err, "snapshot directory unavailable");
            return;
        }
        let path = run.directory.join(format!("{}.png", run.name));
        info!(path = %path.display(), "taking sample snapshot");
        if let Err(err) = self.beamline.sample_camera.save_frame(&path).await {
            warn!(error = %format!("{err:#}"), "snapshot failed");
        }
    }

    /// Re-apply only the setpoints that actually changed beyond tolerance.
    async fn prepare_for_wedge(&self, wedge: &Wedge) -> Result<()> {
        debug!(wedge = %wedge.name, first = wedge.first, "preparing for wedge");
        let beamline = &self.beamline;
        tokio::fs::create_dir_all(&wedge.directory)
            .await
            .context("creating wedge directory")?;

        // Shutter must be closed before any motion.
        beamline.fast_shutter.close().await?;

        let energy = beamline.energy.position().await;
        if (energy - wedge.energy).abs() >= beamline.options.energy_tolerance {
            beamline
                .energy
                .move_to(wedge.energy, true)
                .await
                .context("moving energy")?;
        }
        let distance = beamline.distance.position().await;
        if (distance - wedge.distance).abs() >= beamline.options.distance_tolerance {
            beamline
                .distance
                .move_to(wedge.distance, true)
                .await
                .context("moving detector distance")?;
        }
        beamline
            .attenuator
            .move_to(wedge.attenuation, true)
            .await
            .context("moving attenuator")?;
        debug!("ready for acquisition");
        Ok(())
    }

    async fn start_detector(&self, first: bool) -> bool {
        if self.beamline.detector.start(first).await {
            return true;
        }
        warn!("detector did not arm, retrying once");
        self.beamline.detector.start(false).await
    }

    async fn run_default(&self, wedges: &[Wedge]) -> Result<Flow> {
        let beamline = &self.beamline;
        let control = self.engine.control();
        let mut first = true;
        'wedges: for wedge in wedges {
            if control.interrupted() {
                break;
            }
            self.prepare_for_wedge(wedge).await?;
            self.engine
                .state()
                .force_state("started", StateValue::Json(json!(wedge)));
            beamline
                .mounter
                .standby(Duration::from_secs_f64(wedge.total_exposure().max(0.0)));

            for index in 0..wedge.num_frames {
                if control.interrupted() {
                    break 'wedges;
                }
                let angle = wedge.frame_angle(index);
                beamline
                    .detector
                    .set_parameters(FrameParameters {
                        file_prefix: wedge.name.clone(),
                        directory: wedge.directory.clone(),
                        start_frame: wedge.frame_number(index),
                        num_frames: 1,
                        exposure: wedge.exposure,
                        start_angle: angle,
                        delta: wedge.delta,
                        energy: wedge.energy,
                        distance: wedge.distance,
                    })
                    .await?;
                if !self.start_detector(first).await {
                    return Err(BeamlineError::DetectorStart.into());
                }
                beamline
                    .goniometer
                    .configure(wedge.exposure, wedge.delta, angle)
                    .await?;
                let timeout = Duration::from_secs_f64(wedge.exposure.max(0.0))
                    + beamline.options.scan_overhead;
                if !beamline.goniometer.scan(true, timeout).await {
                    warn!(frame = wedge.frame_number(index), "scan did not complete in time");
                }
                beamline.detector.save().await?;
                self.progress_base.fetch_add(1, Ordering::SeqCst);
                first = false;
            }
        }
        Ok(self.flow_state())
    }

    async fn run_shutterless(&self, wedges: &[Wedge]) -> Result<Flow> {
        let beamline = &self.beamline;
        let control = self.engine.control();
        let mut first = true;
        for wedge in wedges {
            if control.interrupted() {
                break;
            }
            self.prepare_for_wedge(wedge).await?;
            self.engine
                .state()
                .force_state("started", StateValue::Json(json!(wedge)));

            info!(
                wedge = %wedge.name,
                frames = wedge.num_frames,
                "collecting shutterless wedge"
            );
            beamline
                .detector
                .set_parameters(FrameParameters {
                    file_prefix: wedge.name.clone(),
                    directory: wedge.directory.clone(),
                    start_frame: wedge.first,
                    num_frames: wedge.num_frames,
                    exposure: wedge.exposure,
                    start_angle: wedge.start,
                    delta: wedge.delta,
                    energy: wedge.energy,
                    distance: wedge.distance,
                })
                .await?;
            if !self.start_detector(first).await {
                return Err(BeamlineError::DetectorStart.into());
            }
            beamline
                .mounter
                .standby(Duration::from_secs_f64(wedge.total_exposure().max(0.0)));

            // One continuous motion spanning the whole wedge.
            beamline
                .goniometer
                .configure(wedge.total_exposure(), wedge.angle_range(), wedge.start)
                .await?;
            let timeout = Duration::from_secs_f64(wedge.total_exposure().max(0.0))
                + beamline.options.scan_overhead;
            if !beamline.goniometer.scan(true, timeout).await {
                warn!(wedge = %wedge.name, "scan did not complete in time");
            }
            beamline.detector.save().await?;
            self.progress_base
                .fetch_add(wedge.num_frames, Ordering::SeqCst);
            first = false;
        }
        Ok(self.flow_state())
    }

    fn flow_state(&self) -> Flow {
        let control = self.engine.control();
        if control.is_stopped() {
            Flow::Stopped
        } else if control.is_paused() {
            Flow::Paused
        } else {
            Flow::Completed
        }
    }

    /// Summarize every dataset from disk and merge with prior summaries.
    async fn summarize(&self) -> Result<Vec<DatasetSummary>> {
        let (runs, start_time, end_time) = {
            let config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            (config.runs.clone(), config.start_time, config.end_time)
        };
        let extension = self.beamline.detector.file_extension();
        let mut summaries = Vec::new();
        for run in runs {
            let found = dataset::scan_existing(&run.directory, &run.name, extension);
            if found.is_empty() {
                continue;
            }
            let summary = DatasetSummary {
                id: None,
                name: run.name.clone(),
                directory: run.directory.clone(),
                frames: dataset::summarize_frames(&found),
                num_frames: found.len() as u32,
                energy: run.energy,
                distance: run.distance,
                attenuation: run.attenuation,
                exposure: run.exposure,
                start_angle: run.start,
                delta: run.delta,
                beamline: self.beamline.name.clone(),
                start_time,
                end_time,
            };
            summaries.push(
                summary
                    .save_merged()
                    .with_context(|| format!("saving summary for {}", run.name))?,
            );
        }
        Ok(summaries)
    }
}

#[async_trait]
impl Runnable for DataCollector {
    fn engine(&self) -> &Engine {
        &self.engine
    }

    async fn run(self: Arc<Self>) -> Result<Outcome> {
        let beamline = Arc::clone(&self.beamline);
        let (wedges, take_snapshots) = {
            let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            config.start_time = Some(Utc::now());
            config.end_time = None;
            (config.wedges.clone(), config.take_snapshots)
        };
        {
            let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
            results.clear();
        }

        // Serializes against scripts and other collectors.
        let _hardware = beamline.lock.lock().await;

        if take_snapshots {
            self.take_snapshot().await;
        }
        beamline
            .goniometer
            .set_mode(GonioMode::Collect, true)
            .await
            .context("entering collect mode")?;
        let saved_attenuation = beamline.attenuator.position().await;

        self.watch_frames();
        let flow = if beamline.detector.shutterless() {
            self.run_shutterless(&wedges).await
        } else {
            self.run_default(&wedges).await
        };
        self.unwatch_frames();

        // Cleanup runs no matter how the loops exited: close the exposure
        // shutter, restore attenuation, close the detector cover.
        if let Err(err) = beamline.fast_shutter.close().await {
            warn!(error = %format!("{err:#}"), "failed to close fast shutter");
        }
        if let Err(err) = beamline.attenuator.move_to(saved_attenuation, true).await {
            warn!(error = %format!("{err:#}"), "failed to restore attenuation");
        }
        if let Err(err) = beamline.detector.set_cover(false).await {
            warn!(error = %format!("{err:#}"), "failed to close detector cover");
        }
        {
            let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            config.end_time = Some(Utc::now());
        }

        let flow = flow?;

        match self.summarize().await {
            Ok(summaries) => {
                if !summaries.is_empty() {
                    if let Err(err) = beamline
                        .lims
                        .upload_datasets(&beamline.name, &summaries)
                        .await
                    {
                        warn!(error = %format!("{err:#}"), "dataset reporting failed");
                    }
                }
                let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
                *results = summaries;
            }
            Err(err) => warn!(error = %format!("{err:#}"), "failed to summarize datasets"),
        }

        match flow {
            Flow::Completed => {
                let names: Vec<String> = self.results().iter().map(|s| s.name.clone()).collect();
                Ok(Outcome::Done(json!({ "datasets": names })))
            }
            Flow::Stopped => Ok(Outcome::Stopped),
            Flow::Paused => Ok(Outcome::Paused),
        }
    }
}
