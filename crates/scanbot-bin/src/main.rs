//! Command line front-end for scanbot.
//!
//! Runs one procedure to completion against the simulated instrument and
//! prints its summary. Ctrl-C stops the procedure at its next checkpoint and
//! halts the scan in progress.
//!
//! # Usage
//!
//! ```bash
//! scanbot survey -n 3
//! scanbot --config scanbot.toml bias-series --params bias.toml
//! scanbot config
//! ```
//!
//! Procedure parameter files are TOML; missing keys take their defaults.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scanbot_core::config::{LogFormat, Settings};
use scanbot_driver_mock::{simulated_pool, MockConnector, SimulatedInstrument};
use scanbot_experiment::procedures::{
    BiasSeries, BiasSeriesConfig, HeightSeries, HeightSeriesConfig, MultiSiteSurvey,
    MultiSurveyConfig, Registration, RegistrationConfig, Survey, SurveyConfig, TipShaping,
    TipShapingConfig,
};
use scanbot_experiment::{Procedure, ProcedureOutcome, Services, TaskState, TaskSupervisor};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scanbot")]
#[command(about = "Automated scanning-probe microscope procedures", long_about = None)]
struct Cli {
    /// Settings file (TOML); `SCANBOT_` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grid survey
    Survey {
        /// Procedure parameters (TOML)
        #[arg(long)]
        params: Option<PathBuf>,
        /// Frames per side
        #[arg(short)]
        n: Option<usize>,
        /// Appended to the basename of saved files
        #[arg(long)]
        suffix: Option<String>,
    },

    /// Surveys at several coarse-motor sites
    MultiSurvey {
        /// Procedure parameters (TOML)
        #[arg(long)]
        params: Option<PathBuf>,
    },

    /// Bias-dependent imaging
    BiasSeries {
        /// Procedure parameters (TOML)
        #[arg(long)]
        params: Option<PathBuf>,
    },

    /// Constant-height imaging at several tip offsets
    HeightSeries {
        /// Procedure parameters (TOML)
        #[arg(long)]
        params: Option<PathBuf>,
    },

    /// Constant-height scan with a lift part-way through
    Registration {
        /// Procedure parameters (TOML)
        #[arg(long)]
        params: Option<PathBuf>,
    },

    /// Pulse and image until the tip is sharp
    TipShape {
        /// Procedure parameters (TOML)
        #[arg(long)]
        params: Option<PathBuf>,
    },

    /// Print the effective settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    init_tracing(&settings);

    let procedure: Box<dyn Procedure> = match cli.command {
        Commands::Config => {
            print!("{}", settings.to_toml_string()?);
            return Ok(());
        }
        Commands::Survey { params, n, suffix } => {
            let mut config: SurveyConfig = load_params(params.as_deref())?;
            if let Some(n) = n {
                config.n = n;
            }
            if let Some(suffix) = suffix {
                config.suffix = suffix;
            }
            Box::new(Survey::new(config))
        }
        Commands::MultiSurvey { params } => {
            Box::new(MultiSiteSurvey::new(load_params::<MultiSurveyConfig>(params.as_deref())?))
        }
        Commands::BiasSeries { params } => {
            Box::new(BiasSeries::new(load_params::<BiasSeriesConfig>(params.as_deref())?))
        }
        Commands::HeightSeries { params } => {
            Box::new(HeightSeries::new(load_params::<HeightSeriesConfig>(params.as_deref())?))
        }
        Commands::Registration { params } => {
            Box::new(Registration::new(load_params::<RegistrationConfig>(params.as_deref())?))
        }
        Commands::TipShape { params } => {
            Box::new(TipShaping::new(load_params::<TipShapingConfig>(params.as_deref())?))
        }
    };

    let supervisor = simulator(settings)?;
    match run(&supervisor, procedure).await? {
        Some(ProcedureOutcome::Completed(summary)) => {
            println!("{summary}");
            Ok(())
        }
        Some(ProcedureOutcome::Stopped) => {
            println!("stopped");
            Ok(())
        }
        Some(ProcedureOutcome::Failed(e)) => Err(e.into()),
        None => Ok(()),
    }
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.log_format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Supervisor over a simulated instrument with one endpoint per configured port.
fn simulator(settings: Settings) -> Result<TaskSupervisor> {
    let ports = u16::try_from(settings.instrument.ports.len())
        .context("too many instrument ports configured")?;
    let instrument = SimulatedInstrument::new();
    let pool = simulated_pool(MockConnector::new(instrument), ports);
    info!(endpoints = ports, "Using the simulated instrument");
    Ok(TaskSupervisor::new(Arc::new(Services::new(pool, settings))))
}

fn load_params<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading parameters from {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing parameters in {}", path.display()))
}

/// Start `procedure` and wait for it, stopping it on Ctrl-C.
async fn run(
    supervisor: &TaskSupervisor,
    procedure: Box<dyn Procedure>,
) -> Result<Option<ProcedureOutcome>> {
    supervisor.start(procedure)?;
    let mut state = supervisor.subscribe();
    let finished = async move { state.wait_for(|s| *s == TaskState::Idle).await.map(|_| ()) };

    tokio::select! {
        _ = finished => {}
        interrupted = signal::ctrl_c() => {
            interrupted.context("listening for Ctrl-C")?;
            warn!("Interrupted, stopping the procedure");
        }
    }
    Ok(supervisor.stop(true).await?)
}
