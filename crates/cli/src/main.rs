//! TidyCPU CLI
//!
//! Samples per-core utilization, lists the busiest processes with their
//! affinity, and moves processes off overloaded cores onto idle ones.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::{apply, scan, topology, watch, ScanArgs};
use std::path::PathBuf;
use tidycpu_lib::TidyMetrics;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// TidyCPU CLI
#[derive(Parser)]
#[command(name = "tidycpu")]
#[command(author, version, about = "Rebalance processes away from overloaded CPU cores", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/tidycpu/config.toml)
    #[arg(long, env = "TIDYCPU_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Log format for diagnostics on stderr (level set with RUST_LOG)
    #[arg(long, default_value = "text")]
    pub log_format: LogFormat,

    /// Print Prometheus metrics after the command
    #[arg(long)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show per-core load, the busiest processes and a rebalance plan
    Scan(ScanArgs),

    /// Plan and apply affinity changes (requires root)
    Apply {
        #[command(flatten)]
        scan: ScanArgs,

        /// Apply without asking for confirmation
        #[arg(long, short)]
        yes: bool,

        /// Also move every thread of each process, like `taskset -a`
        #[arg(long)]
        all_threads: bool,
    },

    /// Show packages, physical cores and hyperthreads
    Topology,

    /// Refresh the scan periodically until interrupted
    Watch {
        #[command(flatten)]
        scan: ScanArgs,

        /// Seconds between refreshes
        #[arg(long)]
        refresh_secs: Option<u64>,
    },
}

fn init_tracing(format: LogFormat) {
    let json = matches!(format, LogFormat::Json);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let settings = config::Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan(args) => {
            scan::run(&settings, &args, cli.format).await?;
        }
        Commands::Apply {
            scan,
            yes,
            all_threads,
        } => {
            apply::run(&settings, &scan, yes, all_threads, cli.format).await?;
        }
        Commands::Topology => {
            topology::run(&settings, cli.format).await?;
        }
        Commands::Watch { scan, refresh_secs } => {
            let refresh = refresh_secs.unwrap_or(settings.refresh_secs);
            watch::run(&settings, &scan, refresh, cli.format).await?;
        }
    }

    if cli.metrics {
        print!("{}", TidyMetrics::new().render());
    }

    Ok(())
}
