//! Multi-sample automation sequencer.
//!
//! [`Automator`] walks a list of samples through a list of tasks (mount,
//! center, pause, acquire, analyse), delegating the heavy lifting to the
//! mounting robot, the centering collaborator and the [`DataCollector`].
//! Failure semantics are deliberately uneven, mirroring what an operator
//! needs overnight:
//!
//! - a port/barcode mismatch is reported (`mismatch` event) but not fatal;
//! - a centering score below threshold pauses the run for manual help;
//! - a mount failure, a missing sample at acquisition time, or analysis
//!   without prior results stops the whole run with an error.
//!
//! In unattended mode the fatal cases degrade to skipping the sample. When
//! the sample list completes without a stop, the last sample is dismounted
//! automatically.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::beamline::{Beamline, Centerer};
use crate::dataset::{DatasetSummary, Run};
use crate::engine::collector::DataCollector;
use crate::engine::{self, Engine, Outcome, Runnable};
use crate::error::BeamlineError;

/// Default acceptance threshold for centering quality scores, in percent.
pub const CENTERING_THRESHOLD: f64 = 70.0;

/// The kinds of work the automator can schedule per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Mount,
    Center,
    Pause,
    Acquire,
    Analyse,
    Dismount,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Mount => "Mount",
            TaskKind::Center => "Center",
            TaskKind::Pause => "Pause",
            TaskKind::Acquire => "Acquire",
            TaskKind::Analyse => "Analyse",
            TaskKind::Dismount => "Dismount",
        };
        write!(f, "{name}")
    }
}

/// One scheduled operation with free-form options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }
}

/// A sample known to the automation run, identified by its robot port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub group: String,
    pub port: String,
    #[serde(default)]
    pub barcode: Option<String>,
    /// Where frames land; derived from the data root when absent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Populated by Acquire, read by Analyse. Never persisted by the
    /// automator beyond the run.
    #[serde(default, skip)]
    pub results: Option<Vec<DatasetSummary>>,
}

impl Sample {
    pub fn new(name: impl Into<String>, group: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            port: port.into(),
            barcode: None,
            directory: None,
            results: None,
        }
    }
}

enum TaskFlow {
    Continue,
    SampleFailed(String),
    Fatal(anyhow::Error),
}

struct AutomationConfig {
    samples: Vec<Sample>,
    tasks: Vec<Task>,
    unattended: bool,
    centering_threshold: f64,
    data_root: PathBuf,
}

/// The multi-sample task sequencer.
pub struct Automator {
    engine: Engine,
    beamline: Arc<Beamline>,
    collector: Arc<DataCollector>,
    centerer: Arc<dyn Centerer>,
    config: Mutex<AutomationConfig>,
}

impl Automator {
    pub fn new(
        beamline: Arc<Beamline>,
        collector: Arc<DataCollector>,
        centerer: Arc<dyn Centerer>,
        data_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine: Engine::new("automator"),
            beamline,
            collector,
            centerer,
            config: Mutex::new(AutomationConfig {
                samples: Vec::new(),
                tasks: Vec::new(),
                unattended: false,
                centering_threshold: CENTERING_THRESHOLD,
                data_root,
            }),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Set the samples and the per-sample task list for the next run.
    pub fn configure(&self, samples: Vec<Sample>, tasks: Vec<Task>) {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        config.samples = samples;
        let data_root = config.data_root.clone();
        for sample in &mut config.samples {
            if sample.directory.is_none() {
                sample.directory = Some(
                    data_root
                        .join(slugify(&sample.group))
                        .join(slugify(&sample.name)),
                );
            }
            sample.results = None;
        }
        config.tasks = tasks;
    }

    /// Skip operator interventions and fail samples instead of stopping.
    pub fn set_unattended(&self, unattended: bool) {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        config.unattended = unattended;
    }

    pub fn set_centering_threshold(&self, threshold: f64) {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        config.centering_threshold = threshold;
    }

    /// Results acquired for the sample at `port` during this run.
    pub fn sample_results(&self, port: &str) -> Option<Vec<DatasetSummary>> {
        let config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        config
            .samples
            .iter()
            .find(|s| s.port == port)
            .and_then(|s| s.results.clone())
    }

    pub fn start(self: &Arc<Self>) -> bool {
        engine::start(Arc::clone(self) as Arc<dyn Runnable>)
    }

    pub fn pause(&self, reason: &str) {
        self.engine.pause(reason);
    }

    /// Resume both the sequencer and any paused acquisition beneath it.
    pub async fn resume(self: &Arc<Self>) {
        self.engine.resume();
        self.collector.resume().await;
    }

    /// Stop the run, cascading into the collector.
    pub async fn stop(&self) {
        self.collector.stop().await;
        self.engine.stop();
    }

    pub async fn wait(&self) {
        self.engine.wait().await;
    }

    /// Block while paused, allowing a stop to abort the wait.
    async fn intervene(&self, message: &str) {
        if !message.is_empty() || !self.engine.control().is_paused() {
            self.engine.pause(message);
        }
        self.engine.control().hold_while_paused().await;
        self.engine.resume();
    }

    async fn run_task(&self, task: &Task, sample_index: usize) -> TaskFlow {
        let (sample, unattended, threshold) = {
            let config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            (
                config.samples[sample_index].clone(),
                config.unattended,
                config.centering_threshold,
            )
        };
        match task.kind {
            TaskKind::Pause => {
                self.intervene(
                    "As requested, automation has been paused for manual intervention. \
                     Please resume after intervening to continue the sequence.",
                )
                .await;
                TaskFlow::Continue
            }
            TaskKind::Mount => self.mount_sample(&sample, unattended).await,
            TaskKind::Center => self.center_sample(&sample, task, unattended, threshold).await,
            TaskKind::Acquire => self.acquire_sample(task, sample_index, &sample, unattended).await,
            TaskKind::Analyse => self.analyse_sample(&sample),
            TaskKind::Dismount => match self.beamline.mounter.auto_dismount().await {
                Ok(_) => TaskFlow::Continue,
                Err(err) => TaskFlow::Fatal(err.context("dismount failed")),
            },
        }
    }

    async fn mount_sample(&self, sample: &Sample, unattended: bool) -> TaskFlow {
        let mounter = &self.beamline.mounter;
        let outcome = mounter.auto_mount(&sample.port).await;
        let mounted = matches!(outcome, Ok(true)) && mounter.is_mounted(&sample.port);
        if mounted {
            if let Some(on_gonio) = mounter.mounted() {
                if let (Some(expected), Some(found)) = (&sample.barcode, &on_gonio.barcode) {
                    if expected != found {
                        // Operator-actionable, not fatal: the right port can
                        // carry a mislabelled pin.
                        error!(
                            port = %sample.port,
                            %expected,
                            %found,
                            "barcode mismatch"
                        );
                        self.engine.state().force_state(
                            "mismatch",
                            format!(
                                "Barcode mismatch on {}: expected {expected}, read {found}",
                                sample.port
                            ),
                        );
                    }
                }
            }
            return TaskFlow::Continue;
        }
        if let Err(err) = outcome {
            warn!(port = %sample.port, error = %format!("{err:#}"), "mount attempt errored");
        }
        if unattended {
            TaskFlow::SampleFailed(format!("mounting failed for {}", sample.port))
        } else {
            TaskFlow::Fatal(BeamlineError::MountFailed(sample.port.clone()).into())
        }
    }

    async fn center_sample(
        &self,
        sample: &Sample,
        task: &Task,
        unattended: bool,
        threshold: f64,
    ) -> TaskFlow {
        if !self.beamline.mounter.is_mounted(&sample.port) {
            return if unattended {
                TaskFlow::SampleFailed(format!("sample {} not mounted", sample.port))
            } else {
                TaskFlow::Fatal(BeamlineError::NotMounted(sample.port.clone()).into())
            };
        }
        let method = task
            .options
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("loop");
        let score = match self.centerer.center(method).await {
            Ok(score) => score,
            Err(err) => return TaskFlow::Fatal(err.context("centering failed")),
        };
        info!(sample = %sample.name, score, "centering finished");
        if score < threshold {
            if unattended {
                return TaskFlow::SampleFailed(format!(
                    "poor centering score {score:.0} for {}",
                    sample.name
                ));
            }
            self.intervene(&format!(
                "Centering score: {score:.0}. Not confident about the centering, \
                 automation has been paused. Please resume after manual centering."
            ))
            .await;
        }
        TaskFlow::Continue
    }

    async fn acquire_sample(
        &self,
        task: &Task,
        sample_index: usize,
        sample: &Sample,
        unattended: bool,
    ) -> TaskFlow {
        if !self.beamline.mounter.is_mounted(&sample.port) {
            return if unattended {
                TaskFlow::SampleFailed(format!("sample {} not mounted", sample.port))
            } else {
                TaskFlow::Fatal(BeamlineError::NotMounted(sample.port.clone()).into())
            };
        }
        let run = run_for_sample(sample, &task.options);
        info!(
            sample = %sample.name,
            directory = %run.directory.display(),
            "acquiring frames"
        );
        self.collector.configure(vec![run], true);
        match self.collector.execute().await {
            Ok(results) => {
                let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
                config.samples[sample_index].results = Some(results);
                TaskFlow::Continue
            }
            Err(err) => TaskFlow::Fatal(err.context("acquisition failed")),
        }
    }

    fn analyse_sample(&self, sample: &Sample) -> TaskFlow {
        let results = {
            let config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            config
                .samples
                .iter()
                .find(|s| s.port == sample.port)
                .and_then(|s| s.results.clone())
        };
        match results {
            Some(results) if !results.is_empty() => {
                let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
                info!(sample = %sample.name, datasets = ?names, "submitting datasets for analysis");
                self.engine.state().force_state(
                    "analysis-requested",
                    json!({ "sample": sample.port, "datasets": names }),
                );
                TaskFlow::Continue
            }
            _ => TaskFlow::Fatal(BeamlineError::MissingResults(sample.name.clone()).into()),
        }
    }
}

#[async_trait]
impl Runnable for Automator {
    fn engine(&self) -> &Engine {
        &self.engine
    }

    async fn run(self: Arc<Self>) -> Result<Outcome> {
        let (samples, tasks) = {
            let config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
            (config.samples.clone(), config.tasks.clone())
        };
        let control = self.engine.control();
        let total = (samples.len() * tasks.len()).max(1);
        let mut position = 0usize;
        let mut completed = 0usize;

        'samples: for (sample_index, sample) in samples.iter().enumerate() {
            if control.is_stopped() {
                break;
            }
            self.engine
                .state()
                .force_state("sample-started", sample.port.as_str());
            info!(sample = %sample.name, group = %sample.group, port = %sample.port, "processing sample");

            for task in &tasks {
                if control.is_paused() {
                    self.intervene("").await;
                }
                if control.is_stopped() {
                    break 'samples;
                }
                info!(sample = %sample.name, task = %task.kind, "executing task");

                match self.run_task(task, sample_index).await {
                    TaskFlow::Continue => {}
                    TaskFlow::SampleFailed(reason) => {
                        warn!(sample = %sample.name, %reason, "sample failed, moving on");
                        self.engine
                            .state()
                            .force_state("sample-failed", sample.port.as_str());
                        continue 'samples;
                    }
                    TaskFlow::Fatal(err) => {
                        self.collector.stop().await;
                        self.engine.control().stop();
                        return Err(err);
                    }
                }

                position += 1;
                self.engine.emit_progress(
                    position as f64 / total as f64,
                    format!("{}: {}/{}", task.kind, sample.group, sample.name),
                );
            }

            completed += 1;
            self.engine
                .state()
                .force_state("sample-done", sample.port.as_str());
        }

        if control.is_stopped() {
            info!("automation stopped");
            return Ok(Outcome::Stopped);
        }

        // The final sample comes off automatically once the list completes.
        if let Err(err) = self.beamline.mounter.auto_dismount().await {
            warn!(error = %format!("{err:#}"), "final dismount failed");
        }
        info!(samples = completed, "automation complete");
        Ok(Outcome::Done(json!({ "samples": completed })))
    }
}

/// Build the acquisition run for one sample from task options.
fn run_for_sample(sample: &Sample, options: &serde_json::Map<String, serde_json::Value>) -> Run {
    let defaults = Run::default();
    let number = |key: &str, fallback: f64| options.get(key).and_then(|v| v.as_f64()).unwrap_or(fallback);
    Run {
        name: sample.name.clone(),
        directory: sample
            .directory
            .clone()
            .unwrap_or_else(|| defaults.directory.clone()),
        energy: number("energy", defaults.energy),
        distance: number("distance", defaults.distance),
        attenuation: number("attenuation", defaults.attenuation),
        exposure: number("exposure", defaults.exposure),
        delta: number("delta", defaults.delta),
        start: number("start", defaults.start),
        range: number("range", defaults.range),
        wedge: number("wedge", defaults.wedge),
        first: options
            .get("first")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(defaults.first),
        skip: options
            .get("skip")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        existing: String::new(),
    }
}

fn slugify(text: &str) -> String {
    let mut slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    slug.trim_matches('-').to_string()
}
