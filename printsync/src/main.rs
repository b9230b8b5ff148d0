use anyhow::Result;
use clap::Parser;
use printsync::cli::{run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing for the daemon.
    tracing_subscriber::fmt::init();
    tracing::info!("printsync startup: tracing initialised, environment loaded");

    let cli = Cli::parse();
    let result = run(cli).await;
    match &result {
        Ok(_) => tracing::info!("printsync completed successfully"),
        Err(e) => tracing::error!(error = %e, "printsync exited with error"),
    }
    result
}
