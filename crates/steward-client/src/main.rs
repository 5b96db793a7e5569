//! steward CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use steward_client::cli::{Cli, Command};
use steward_client::commands::{remote, server};
use steward_client::config::ClientConfig;
use steward_client::error::ClientResult;
use steward_core::{TracingConfig, TracingOutputFormat, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = match cli.command {
        Command::Server { json_logs, .. } => {
            let daemon = TracingConfig::daemon();
            let daemon = if json_logs {
                daemon
            } else {
                daemon.with_format(TracingOutputFormat::Compact)
            };
            if cli.debug { daemon.with_level(Level::DEBUG) } else { daemon }
        }
        _ if cli.debug => TracingConfig::cli_debug(),
        _ => TracingConfig::default(),
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("warning: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let mut config = match cli.config {
        Some(ref path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    cli.apply(&mut config);

    match cli.command {
        Command::Server {
            workers, pid_file, ..
        } => server::run(server::server_config(&config, workers, pid_file)).await,
        Command::Call { command, args } => remote::call(&config, &command, &args).await,
        Command::Pub { channel, args } => remote::publish(&config, &channel, &args).await,
        Command::Sub { prefixes } => remote::subscribe(&config, &prefixes).await,
        Command::Commands => remote::commands(&config).await,
        Command::Status => remote::status(&config).await,
    }
}
