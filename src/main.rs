//! CLI entry point for beamctl.
//!
//! Provides command-line access to the orchestration core:
//! - validating configuration files
//! - running a simulated data collection against mock hardware
//! - running a simulated multi-sample automation sequence
//!
//! Real deployments embed the library behind a control GUI; the CLI exists
//! for commissioning, development and smoke testing without hardware.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use beamctl::config::Settings;
use beamctl::dataset::Run;
use beamctl::device::Component;
use beamctl::engine::automation::{Automator, Sample, Task, TaskKind};
use beamctl::engine::collector::DataCollector;
use beamctl::engine::script;
use beamctl::hardware::mock;
use beamctl::logging;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "beamctl")]
#[command(about = "Beamline acquisition and automation control", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "beamctl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file and print the effective settings
    CheckConfig,

    /// Run a simulated data collection against mock hardware
    Collect {
        /// Dataset name
        #[arg(long, default_value = "test")]
        name: String,

        /// Output directory (defaults under the configured data root)
        #[arg(long)]
        directory: Option<PathBuf>,

        /// Total angular range in degrees
        #[arg(long, default_value_t = 10.0)]
        range: f64,

        /// Exposure time per frame in seconds
        #[arg(long, default_value_t = 0.05)]
        exposure: f64,

        /// Use frame-by-frame acquisition instead of shutterless
        #[arg(long)]
        stepped: bool,
    },

    /// Run a simulated automation sequence over mock samples
    Automate {
        /// Number of samples to process
        #[arg(long, default_value_t = 2)]
        samples: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = if cli.config.exists() {
        Settings::load_from(&cli.config)?
    } else {
        Settings::default()
    };
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::CheckConfig => check_config(&cli.config),
        Commands::Collect {
            name,
            directory,
            range,
            exposure,
            stepped,
        } => collect(&settings, name, directory, range, exposure, !stepped).await,
        Commands::Automate { samples } => automate(&settings, samples).await,
    }
}

fn check_config(path: &std::path::Path) -> Result<()> {
    let settings = Settings::load_from(path)?;
    println!("Configuration OK: {}", path.display());
    println!("  beamline:    {}", settings.beamline.name);
    println!("  data root:   {}", settings.beamline.data_root.display());
    println!("  log level:   {}", settings.application.log_level);
    println!(
        "  automation:  unattended={} centering_threshold={}",
        settings.automation.unattended, settings.automation.centering_threshold
    );
    Ok(())
}

async fn collect(
    settings: &Settings,
    name: String,
    directory: Option<PathBuf>,
    range: f64,
    exposure: f64,
    shutterless: bool,
) -> Result<()> {
    let sim = mock::sim_beamline(&settings.beamline.name, shutterless);
    let _readiness = sim.beamline.assemble(settings.beamline.liveness_interval);
    let collector = DataCollector::new(Arc::clone(&sim.beamline));

    let directory =
        directory.unwrap_or_else(|| settings.beamline.data_root.join("simulated").join(&name));
    println!(
        "Collecting {range}\u{b0} of '{name}' into {} ({})",
        directory.display(),
        if shutterless { "shutterless" } else { "stepped" }
    );

    collector.configure(
        vec![Run {
            name,
            directory,
            range,
            exposure,
            ..Run::default()
        }],
        true,
    );
    let results = collector.execute().await?;
    for summary in &results {
        println!(
            "  dataset {}: frames {} ({} total)",
            summary.name, summary.frames, summary.num_frames
        );
    }
    let uploads = sim.lims.uploads();
    println!("Done. {} dataset report(s) submitted.", uploads.len());
    Ok(())
}

async fn automate(settings: &Settings, count: usize) -> Result<()> {
    if count == 0 {
        bail!("at least one sample is required");
    }
    let sim = mock::sim_beamline(&settings.beamline.name, true);
    let _readiness = sim.beamline.assemble(settings.beamline.liveness_interval);

    // Mode-change scripts are interlocked against robot activity, the same
    // wiring a control GUI would do.
    let scripts = script::standard_scripts(&sim.beamline);
    for item in &scripts {
        let _ = item.bind_interlock(sim.mounter.device().state(), "busy");
    }

    let collector = DataCollector::new(Arc::clone(&sim.beamline));
    let automator = Automator::new(
        Arc::clone(&sim.beamline),
        Arc::clone(&collector),
        sim.centerer.clone(),
        settings.beamline.data_root.join("automation"),
    );
    automator.set_unattended(settings.automation.unattended);
    automator.set_centering_threshold(settings.automation.centering_threshold);

    let samples: Vec<Sample> = (0..count)
        .map(|i| {
            let port = format!("{}A", i + 1);
            sim.mounter.set_barcode(&port, &format!("SIM-{:04}", i + 1));
            let mut sample = Sample::new(format!("sample{}", i + 1), "simulated", &port);
            sample.barcode = Some(format!("SIM-{:04}", i + 1));
            sample
        })
        .collect();
    let tasks = vec![
        Task::new(TaskKind::Mount),
        Task::new(TaskKind::Center),
        Task::new(TaskKind::Acquire)
            .with_option("range", serde_json::json!(2.0))
            .with_option("exposure", serde_json::json!(0.02)),
        Task::new(TaskKind::Analyse),
    ];

    let progress = automator.engine().state().connect("progress", |event| {
        if let beamctl::signals::StateValue::Progress { fraction, message } = &event.value {
            println!("  [{:>3.0}%] {message}", fraction * 100.0);
        }
    });

    println!("Processing {count} simulated sample(s)...");
    automator.configure(samples, tasks);
    automator.start();
    automator.wait().await;
    progress.disconnect();

    if let Some(error) = automator.engine().state().get_state("error") {
        if let beamctl::signals::StateValue::Text(message) = error {
            bail!("automation failed: {message}");
        }
    }
    println!("Automation complete.");
    Ok(())
}
