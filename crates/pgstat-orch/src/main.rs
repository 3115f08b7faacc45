//! pgstatd entry point.
//!
//! Runs the configured streams over the software loopback and reports
//! per-group statistics.

use clap::Parser;
use pgstat_orch::audit::{init_logging, init_logging_pretty};
use pgstat_orch::config::DEFAULT_CONFIG_PATH;
use pgstat_orch::daemon::run_scenario;
use pgstat_orch::FlowStatConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Per-flow statistics daemon
#[derive(Parser, Debug)]
#[command(name = "pgstatd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    /// Print the final report as JSON
    #[arg(short = 'd', long)]
    dump: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match FlowStatConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pgstatd: failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    if args.pretty {
        init_logging_pretty(&level);
    } else {
        init_logging(&level);
    }

    match run(&args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pgstatd failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, config: FlowStatConfig) -> anyhow::Result<()> {
    info!(
        config = %args.config.display(),
        streams = config.streams.len(),
        ports = config.ports,
        "starting pgstatd"
    );
    let outcome = run_scenario(config).await?;
    info!(
        frames = outcome.rx_core.frames,
        classified = outcome.rx_core.classified,
        groups = outcome.stopped.groups.len(),
        "scenario finished"
    );
    if args.dump {
        println!("{}", outcome.stopped.to_json_pretty()?);
    }
    Ok(())
}
