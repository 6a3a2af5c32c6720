// src/main.rs

//! cloudrun-local
//!
//! Entry point for the cloudrun-local CLI.
//!
//! Reproduces a Cloud Run service or job environment on a workstation:
//! impersonates the configured service account, resolves Secret Manager
//! references, and prints the environment or runs a command with it.
//!
//! Responsibilities of this file:
//! - Parse CLI arguments
//! - Initialise logging
//! - Cancel in-flight work on SIGINT / SIGTERM
//! - Map the outcome to a process exit code

mod auth;
mod cli;
mod config;
mod endpoints;
mod error;
mod resolver;
mod runner;
mod secrets;
mod util;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let code = match runner::run(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    std::process::exit(code);
}

/// Logs go to stderr so printed environments on stdout stay clean.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("CLOUDRUN_LOCAL_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("cloudrun_local=debug")
        } else {
            EnvFilter::new("cloudrun_local=warn")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .init();
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let ctrl_c = tokio::signal::ctrl_c();
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = ctrl_c => {},
                _ = sigterm.recv() => {},
            }
        } else {
            let _ = ctrl_c.await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::debug!("termination signal received, cancelling");
    cancel.cancel();
}
