//! The agent's process entrypoint: parses the CLI, loads and validates the
//! configuration, and runs the supervised agent until a shutdown signal
//! arrives.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// On-device telemetry agent.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the agent's YAML configuration file.
    #[arg(long, short = 'c')]
    config: String,

    /// Load and validate the configuration, print it, and exit without
    /// starting the agent.
    #[arg(long)]
    print_config: bool,

    /// Increase log verbosity (stacks: -v, -vv).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity.
    #[arg(long, short = 'q')]
    quiet: bool,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let agent_config = match config::load(&cli.config) {
        Ok(agent_config) => agent_config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    if cli.print_config {
        match serde_yaml::to_string(&agent_config) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => tracing::error!(error = %err, "failed to render configuration"),
        }
        return ExitCode::SUCCESS;
    }

    let supervisor = match supervisor::Supervisor::bootstrap(agent_config).await {
        Ok(supervisor) => supervisor,
        Err(err @ supervisor::Error::Lock(_)) => {
            tracing::error!(error = %err, "failed to acquire the single-instance lock");
            return ExitCode::from(2);
        }
        Err(err @ supervisor::Error::Store(_)) => {
            tracing::error!(error = %err, "failed to open the queue store");
            return ExitCode::from(3);
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to bootstrap the agent");
            return ExitCode::from(4);
        }
    };

    let cancel = supervisor.cancellation();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, cancelling tasks");
        cancel.cancel();
    });

    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "agent exited with an error");
            ExitCode::from(4)
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
