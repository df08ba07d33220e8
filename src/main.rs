//! CLI entry point for the beamline workflow broker.
//!
//! # Usage
//!
//! Check a configuration file:
//! ```bash
//! beamline-workflow check-config --config config/workflow.toml
//! ```
//!
//! Run the recentring calculator once:
//! ```bash
//! beamline-workflow recentre --config config/workflow.toml \
//!     --ref-okp "0 0 0" --ref-xyz "0.1 0.2 0.3" --okp "90 0 0"
//! ```
//!
//! Run a complete workflow against the scripted engine and mock goniostat:
//! ```bash
//! beamline-workflow simulate --rotations 3 --fail-collection 2 --records records.jsonl
//! ```

use anyhow::{bail, Context, Result};
use beamline_workflow::config::{WorkflowConfig, DEFAULT_CONFIG_PATH};
use beamline_workflow::geometry::{AxisSettings, GoniostatRotation, GoniostatTranslation};
use beamline_workflow::logging;
use beamline_workflow::recentring::RecentringCalculator;
use beamline_workflow::sim::{run_simulation, SimulationOptions};
use beamline_workflow::store::{CollectionSink, JsonLinesSink};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "beamline-workflow")]
#[command(about = "Workflow broker between beamline control and a strategy engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print a summary
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Predict the sample translation at a new rotation
    Recentre {
        /// Configuration file (must name the recentring tool)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Reference rotation, "omega kappa phi"
        #[arg(long)]
        ref_okp: String,

        /// Translation centred at the reference rotation, "x y z"
        #[arg(long)]
        ref_xyz: String,

        /// Target rotation, "omega kappa phi"
        #[arg(long)]
        okp: String,
    },

    /// Run a full workflow against the scripted engine and mock hardware
    Simulate {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Number of centring rotations
        #[arg(long, default_value_t = 3)]
        rotations: u32,

        /// Number of sweeps in the collection proposal
        #[arg(long, default_value_t = 3)]
        sweeps: u32,

        /// Make the detector fail on this sweep (1-based)
        #[arg(long)]
        fail_collection: Option<u32>,

        /// Append the collection records to this JSON-lines file
        #[arg(long)]
        records: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Recentre {
            config,
            ref_okp,
            ref_xyz,
            okp,
        } => recentre(&config, &ref_okp, &ref_xyz, &okp).await,
        Commands::Simulate {
            config,
            rotations,
            sweeps,
            fail_collection,
            records,
        } => {
            let options = SimulationOptions {
                rotations,
                sweeps,
                fail_collection,
            };
            simulate(&config, options, records.as_deref()).await
        }
    }
}

fn load_config(path: &Path) -> Result<WorkflowConfig> {
    let config = WorkflowConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    logging::init_from_config(&config).context("Failed to initialise logging")?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("Configuration OK: {}", config.application.name);
    println!("  configuration location: {}", config.connection.configuration_location);
    println!("  image root:             {}", config.connection.image_root);
    println!("  request timeout:        {:?}", config.connection.request_timeout);
    println!("  engine:                 {}", config.engine.executable.display());
    println!("  rotation axes:          {}", config.rotation_axis_names().join(", "));
    println!(
        "  translation axes:       {}",
        config.recentring.translation_axes.join(", ")
    );
    match &config.recentring.executable {
        Some(tool) => println!("  recentring tool:        {}", tool.display()),
        None => println!("  recentring tool:        none (recentring disabled)"),
    }
    println!(
        "  sibling failures:       {:?}",
        config.queue.sibling_failure_policy
    );
    Ok(())
}

async fn recentre(path: &Path, ref_okp: &str, ref_xyz: &str, okp: &str) -> Result<()> {
    let config = load_config(path)?;
    let Some(calculator) = RecentringCalculator::from_config(&config.recentring) else {
        bail!("No recentring tool configured (recentring.executable)");
    };

    let rotation_axes = config.rotation_axis_names();
    let reference = GoniostatRotation::new(triple(&rotation_axes, ref_okp).context("--ref-okp")?);
    let target = GoniostatRotation::new(triple(&rotation_axes, okp).context("--okp")?);
    let translation_axes: Vec<&str> = calculator
        .translation_axes()
        .iter()
        .map(String::as_str)
        .collect();
    let translation = GoniostatTranslation::for_rotation(
        &reference,
        triple(&translation_axes, ref_xyz).context("--ref-xyz")?,
    );

    let settings = calculator.recentre(&reference, &translation, &target).await;
    if settings.is_empty() {
        println!("No recentring available");
    } else {
        info!(%settings, "Recentring calculated");
        println!("{settings}");
    }
    Ok(())
}

async fn simulate(path: &Path, options: SimulationOptions, records: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let report = run_simulation(&config, options)
        .await
        .context("Simulated workflow failed")?;

    println!("Workflow {}", report.outcome);
    println!("  engine calls:    {}", report.exchanges.len());
    println!("  aborted calls:   {}", report.aborted_calls());
    for record in &report.records {
        println!(
            "  {:<12} {:>5} images  {:?}  {}",
            record.sweep_name, record.images, record.status, record.image_dir
        );
    }

    if let Some(records) = records {
        let sink = JsonLinesSink::new(records);
        for record in report.records {
            sink.record(record)
                .await
                .with_context(|| format!("Failed to write {}", records.display()))?;
        }
        info!(path = %records.display(), "Collection records written");
    }
    Ok(())
}

/// Parse three whitespace-separated numbers onto `axes`.
fn triple(axes: &[&str], text: &str) -> Result<AxisSettings> {
    let values = text
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("'{text}' is not a list of numbers"))?;
    if values.len() != axes.len() {
        bail!("expected {} values, found {} in '{text}'", axes.len(), values.len());
    }
    Ok(AxisSettings::new(axes.iter().copied().zip(values)))
}
