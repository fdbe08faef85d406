use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{self, EnvFilter};

use das_sim::{simulator_version, Config, Simulation, SimulationReport};

#[derive(Parser)]
#[command(name = "das-sim")]
#[command(about = "Peer sampling simulator for data availability sampling networks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides the level from the configuration file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Named scenario used when no configuration file is given
        #[arg(long, default_value = "default")]
        scenario: String,

        /// Where to write the operation summaries (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override the configured seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Write a configuration file
    InitConfig {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Scenario to start from
        #[arg(long, default_value = "default")]
        scenario: String,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so stdout stays clean for the JSON results.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            scenario,
            output,
            seed,
        } => {
            let mut config = match config {
                Some(path) => Config::from_file(&path)?,
                None => Config::for_scenario(&scenario)?,
            };
            if let Some(seed) = seed {
                config.simulation.seed = seed;
            }

            let level = cli.log_level.unwrap_or_else(|| config.log.level.clone());
            init_logging(&level, config.log.json);
            info!("Starting {}", simulator_version());

            let report = run_simulation(config).await?;
            write_report(&report, output)?;
        }

        Commands::InitConfig { output, scenario } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), false);

            let path = output.unwrap_or_else(Config::default_path);
            let config = Config::for_scenario(&scenario)?;
            config.to_file(&path)?;
            info!("Wrote {} configuration to {}", scenario, path.display());
        }
    }

    Ok(())
}

async fn run_simulation(config: Config) -> Result<SimulationReport> {
    let simulation = Simulation::new(config)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, writing partial results");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let report = tokio::task::spawn_blocking(move || simulation.run(&cancel))
        .await
        .context("Simulation task panicked")?;

    info!(
        "{} operations, {} messages sent, {} dropped",
        report.operations.len(),
        report.traffic.messages_sent,
        report.traffic.messages_dropped
    );

    Ok(report)
}

fn write_report(report: &SimulationReport, output: Option<PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(&report.operations).context("Failed to serialize results")?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write results to {}", path.display()))?;
            info!("Results written to {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}
