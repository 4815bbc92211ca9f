//! CLI entry point for the acquisition sequencing engine.
//!
//! Runs sequence settings files against the simulated microscope:
//! - `run`: acquire, writing image metadata under the settings' save root
//! - `estimate`: print image count, data volume and minimum duration
//! - `events`: list the generated events in acquisition order
//!
//! # Usage
//!
//! ```bash
//! mda estimate config/sequence.toml
//! mda run config/sequence.toml --realistic
//! MDA_LOG_LEVEL=debug mda events config/sequence.toml --limit 20
//! ```

// Global allocator
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mda_core::config::EngineConfig;
use mda_core::document::Document;
use mda_core::settings::SequenceSettings;
use mda_driver_mock::{MockMicroscope, MockMode};
use mda_experiment::{AcquisitionPlan, HardwareContext, RunEngine};
use mda_storage::{BackgroundSubtract, MetadataLogStore, ProcessorChain};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mda")]
#[command(about = "Multi-dimensional acquisition sequencing", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an acquisition on the simulated microscope
    Run {
        /// Sequence settings file (TOML)
        settings: PathBuf,

        /// Override the save root of the settings
        #[arg(long)]
        out: Option<PathBuf>,

        /// Subtract a constant background from every image
        #[arg(long)]
        background: Option<u16>,

        /// Simulate device timing instead of responding instantly
        #[arg(long)]
        realistic: bool,
    },

    /// Print the acquisition summary
    Estimate {
        /// Sequence settings file (TOML)
        settings: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List generated events in acquisition order
    Events {
        /// Sequence settings file (TOML)
        settings: PathBuf,

        /// Stop after this many events
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.clone())?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            settings,
            out,
            background,
            realistic,
        } => run_acquisition(config, settings, out, background, realistic).await,
        Commands::Estimate { settings, json } => estimate(config, settings, json).await,
        Commands::Events { settings, limit } => list_events(config, settings, limit),
    }
}

fn load_settings(path: &Path) -> Result<SequenceSettings> {
    SequenceSettings::from_toml_file(path)
        .with_context(|| format!("loading sequence settings from {}", path.display()))
}

fn microscope(config: &EngineConfig, realistic: bool) -> MockMicroscope {
    let mode = if realistic {
        MockMode::Realistic
    } else {
        MockMode::Instant
    };
    MockMicroscope::builder()
        .geometry(config.camera.into())
        .mode(mode)
        .build()
}

async fn run_acquisition(
    config: EngineConfig,
    settings_path: PathBuf,
    out: Option<PathBuf>,
    background: Option<u16>,
    realistic: bool,
) -> Result<()> {
    let mut settings = load_settings(&settings_path)?;
    if let Some(out) = out {
        settings.save_root = out;
    }

    let core = Arc::new(microscope(&config, realistic));
    let engine = Arc::new(RunEngine::new(core, config));

    tokio::fs::create_dir_all(&settings.save_root)
        .await
        .with_context(|| format!("creating {}", settings.save_root.display()))?;
    let store = Arc::new(MetadataLogStore::create(&settings.save_root, &settings.name).await?);
    info!(path = %store.path().display(), "Writing image metadata");

    let mut processors = ProcessorChain::new();
    if let Some(offset) = background {
        processors = processors.with(BackgroundSubtract::new(offset));
    }

    // Ctrl-C stops the run cleanly; a second one forces shutdown
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping acquisition");
                if engine.stop().await.is_err() {
                    engine.shutdown().await;
                }
            }
            if signal::ctrl_c().await.is_ok() {
                engine.shutdown().await;
            }
        });
    }

    let mut docs = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(doc) = docs.recv().await {
            match doc {
                Document::Started(started) => {
                    info!(run_uid = %started.uid, total = started.total_images, "Run started")
                }
                Document::Ended(ended) => info!(
                    run_uid = %ended.run_uid,
                    status = %ended.exit_status,
                    images = ended.num_images,
                    "Run ended"
                ),
            }
        }
    });

    let result = match engine
        .run_with_processors(&settings, store.clone(), processors)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            // a run blocked before its first image leaves nothing worth keeping
            match store.remove_if_empty().await {
                Ok(true) => info!(path = %store.dir().display(), "Removed empty run directory"),
                Ok(false) => {}
                Err(cleanup) => warn!(error = %cleanup, "failed to remove empty run directory"),
            }
            return Err(e.into());
        }
    };
    println!(
        "{}: {} of {} images stored in {}",
        result.exit_status,
        result.images_stored,
        result.total_images,
        store.path().display()
    );
    Ok(())
}

async fn estimate(config: EngineConfig, settings_path: PathBuf, json: bool) -> Result<()> {
    let settings = load_settings(&settings_path)?;
    let engine = RunEngine::new(Arc::new(microscope(&config, false)), config);
    let summary = engine.estimate(&settings).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

fn list_events(config: EngineConfig, settings_path: PathBuf, limit: Option<usize>) -> Result<()> {
    let settings = load_settings(&settings_path)?;
    let context = HardwareContext::nominal(config.camera.into());
    let plan = AcquisitionPlan::build(Arc::new(settings), context)?;

    for event in plan.events().take(limit.unwrap_or(usize::MAX)) {
        let channel = event.channel.as_ref().map_or("-", |c| c.config.as_str());
        let z = event
            .resolved_z()
            .map_or_else(|| "-".to_string(), |z| format!("{:.3}", z));
        let xy = event
            .xy
            .as_ref()
            .map_or_else(|| "-".to_string(), |p| p.label.clone());
        println!("{}\tchannel={}\tz={}\tpos={}", event.coords, channel, z, xy);
    }
    Ok(())
}
