/// CLI interface for printsync: command parsing, argument validation and the
/// async entrypoint that wires the engine to its live collaborators.
///
/// All engine logic (routing, allocation, chunking, dispatch) lives in the
/// `printsync-core` crate. This module is strictly for CLI glue and wiring.
///
/// ## How To Use
/// - For command-line users: use the installed `printsync` binary with
///   `--help`.
/// - For programmatic/integration use: call [`run`] with a constructed
///   [`Cli`].
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use printsync_core::contract::{PrintBackend, QuotaBackend, UserDirectory};
use printsync_core::orchestrate::{Collaborators, Engine, RuntimeFlags};
use printsync_core::store::MemoryLedger;

use crate::backend::{HttpDirectory, HttpQuotaBackend, LpBackend, NullDirectory, NullQuotaBackend};
use crate::load_config::{api_key_from_env, load_config};
use crate::sim::SimPrintBackend;
use crate::supplier::{HttpPeerRelay, HttpSupplier};

/// CLI for printsync: poll print-job suppliers, allocate costs and dispatch
/// jobs to the print backend.
#[derive(Parser)]
#[clap(
    name = "printsync",
    version,
    about = "Poll print-job suppliers, allocate costs and dispatch jobs to the print backend"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the poll/dispatch engine with the given config file
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Stop after this many seconds instead of running until interrupted
        #[clap(long)]
        run_for_secs: Option<u64>,
    },
    /// Parse and validate a config file, then exit
    Check {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// Run bound when none is given: effectively "until interrupted".
const RUN_FOREVER_SECS: u64 = 60 * 60 * 24 * 365;

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Check { config } => {
            let config = load_config(config)?;
            tracing::info!(
                command = "check",
                connections = config.connections.len(),
                "configuration OK"
            );
            Ok(())
        }
        Commands::Run {
            config,
            run_for_secs,
        } => {
            let config = load_config(config)?;
            tracing::info!(
                command = "run",
                connections = config.connections.len(),
                simulate = config.engine.simulate,
                "starting engine"
            );

            let supplier = Arc::new(HttpSupplier::new(api_key_from_env()?, &config.connections));
            let backend: Arc<dyn PrintBackend> = if config.engine.simulate {
                Arc::new(SimPrintBackend)
            } else {
                Arc::new(LpBackend::new())
            };
            let quota: Arc<dyn QuotaBackend> = match &config.quota_endpoint {
                Some(url) => Arc::new(HttpQuotaBackend::new(url.clone())),
                None => Arc::new(NullQuotaBackend),
            };
            let directory: Arc<dyn UserDirectory> = match &config.directory_endpoint {
                Some(url) => Arc::new(HttpDirectory::new(url.clone())),
                None => Arc::new(NullDirectory),
            };
            let relay = Arc::new(HttpPeerRelay::new(&config.connections));
            let store = Arc::new(MemoryLedger::new());

            let flags = Arc::new(RuntimeFlags::new(true, config.engine.quota_integration));
            let shutdown = install_shutdown_handler();
            let engine = Engine::new(
                config.engine,
                config.connections,
                Collaborators {
                    supplier,
                    backend,
                    quota,
                    directory,
                    store,
                    relay,
                },
                flags,
                shutdown,
            );

            let bound = Duration::from_secs(run_for_secs.unwrap_or(RUN_FOREVER_SECS));
            engine.run(bound).await?;
            Ok(())
        }
    }
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received; the engine drains the in-flight document and disconnects.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}
