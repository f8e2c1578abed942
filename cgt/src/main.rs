use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cgt::{load_config_with_env, Daemon};

/// Redirects the traffic of selected cgroups to transparent proxies.
#[derive(Debug, Parser)]
#[command(name = "cgt", author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "CGT_CONFIG")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set, e.g. `debug` or `cgt_rules=trace`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match load_config_with_env(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(
                path = ?args.config,
                error = &e as &dyn std::error::Error,
                "failed to load configuration"
            );
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = Daemon::new(config).run().await {
        tracing::error!(error = &e as &dyn std::error::Error, "cgt exited with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
