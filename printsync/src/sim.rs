//! Simulation mode: a print backend that accepts every job without touching
//! a physical printer. Everything else (supplier polling, accounting,
//! dispatch records) behaves exactly as in live mode, so a dry run exercises
//! the full pipeline.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use printsync_core::contract::{PrintBackend, SubmitJob};
use printsync_core::error::Result;

pub struct SimPrintBackend;

#[async_trait]
impl PrintBackend for SimPrintBackend {
    async fn printer_media(&self, _printer: &str) -> Result<Vec<String>> {
        Ok(vec![
            "A3".to_string(),
            "A4".to_string(),
            "A5".to_string(),
            "Letter".to_string(),
        ])
    }

    async fn render_monochrome(&self, input: &Path, output: &Path) -> Result<()> {
        tokio::fs::copy(input, output).await.map_err(|e| {
            printsync_core::error::EngineError::Dispatch(format!(
                "simulated monochrome copy failed: {e}"
            ))
        })?;
        Ok(())
    }

    async fn submit(&self, job: SubmitJob) -> Result<String> {
        info!(
            printer = %job.printer,
            job_name = %job.job_name,
            copies = job.options.copies,
            media = %job.options.media,
            duplex = job.options.duplex,
            color = job.options.color,
            "simulation: job accepted, nothing printed"
        );
        Ok(format!("sim-{}", job.job_name))
    }
}
