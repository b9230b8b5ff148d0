//! Print backend and quota/directory clients.
//!
//! The print backend shells out to the system spooler: `lp` for submission,
//! `lpoptions` for media capabilities and ghostscript for the client-side
//! monochrome filter. The quota backend and user directory are small REST
//! clients.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use printsync_core::contract::{
    DirectoryUser, PrintBackend, QuotaBackend, QuotaUser, SubmitJob, UsageRecord, UserDirectory,
};
use printsync_core::error::{EngineError, Result};

/// Spooler-backed print backend.
pub struct LpBackend;

impl LpBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LpBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn page_ranges_option(ranges: &[(u32, u32)]) -> String {
    ranges
        .iter()
        .map(|(begin, end)| {
            if begin == end {
                begin.to_string()
            } else {
                format!("{begin}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl PrintBackend for LpBackend {
    /// `lpoptions -p <printer> -l` lists options one per line; the PageSize
    /// line carries the supported media, the current one starred.
    async fn printer_media(&self, printer: &str) -> Result<Vec<String>> {
        let output = Command::new("lpoptions")
            .arg("-p")
            .arg(printer)
            .arg("-l")
            .output()
            .await
            .map_err(|e| EngineError::Dispatch(format!("failed to launch lpoptions: {e}")))?;
        if !output.status.success() {
            return Err(EngineError::Dispatch(format!(
                "lpoptions for {printer} exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let Some((key, values)) = line.split_once(':') else {
                continue;
            };
            if key.starts_with("PageSize") {
                return Ok(values
                    .split_whitespace()
                    .map(|v| v.trim_start_matches('*').to_string())
                    .collect());
            }
        }
        Err(EngineError::Dispatch(format!(
            "printer {printer} reports no PageSize options"
        )))
    }

    async fn render_monochrome(&self, input: &Path, output: &Path) -> Result<()> {
        let status = Command::new("gs")
            .arg("-q")
            .arg("-sDEVICE=pdfwrite")
            .arg("-sColorConversionStrategy=Gray")
            .arg("-dProcessColorModel=/DeviceGray")
            .arg("-dNOPAUSE")
            .arg("-dBATCH")
            .arg("-o")
            .arg(output)
            .arg(input)
            .status()
            .await
            .map_err(|e| EngineError::Dispatch(format!("failed to launch gs: {e}")))?;
        if !status.success() {
            return Err(EngineError::Dispatch(format!(
                "monochrome conversion exited with {status}"
            )));
        }
        debug!(input = %input.display(), output = %output.display(), "content converted to grayscale");
        Ok(())
    }

    async fn submit(&self, job: SubmitJob) -> Result<String> {
        let mut command = Command::new("lp");
        command
            .arg("-d")
            .arg(&job.printer)
            .arg("-t")
            .arg(&job.job_name)
            .arg("-n")
            .arg(job.options.copies.to_string())
            .arg("-o")
            .arg(format!("media={}", job.options.media))
            .arg("-o")
            .arg(if job.options.duplex {
                "sides=two-sided-long-edge"
            } else {
                "sides=one-sided"
            });
        if !job.options.color {
            command.arg("-o").arg("ColorModel=Gray");
        }
        if job.options.collate {
            command.arg("-o").arg("collate=true");
        }
        if !job.options.page_ranges.is_empty() {
            command
                .arg("-o")
                .arg(format!("page-ranges={}", page_ranges_option(&job.options.page_ranges)));
        }
        command.arg(&job.content_path);

        let output = command
            .output()
            .await
            .map_err(|e| EngineError::Dispatch(format!("failed to launch lp: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Dispatch(format!(
                "lp rejected {}: {}",
                job.job_name,
                stderr.trim()
            )));
        }

        // lp replies "request id is <printer>-<number> (1 file(s))".
        let stdout = String::from_utf8_lossy(&output.stdout);
        let request_id = stdout
            .split_whitespace()
            .find(|token| token.starts_with(job.printer.as_str()))
            .unwrap_or(job.job_name.as_str())
            .to_string();
        info!(job_name = %job.job_name, request_id = %request_id, "job handed to spooler");
        Ok(request_id)
    }
}

/// REST client for the quota backend: user lookup and usage-log lookup by
/// encoded job-name prefix.
pub struct HttpQuotaBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQuotaBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl QuotaBackend for HttpQuotaBackend {
    async fn find_user(&self, username: &str) -> Result<Option<QuotaUser>> {
        let url = format!("{}/users/{username}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Connectivity(format!("quota lookup at {url}: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::Supplier(format!(
                "quota lookup returned {}",
                response.status()
            )));
        }
        let user = response
            .json::<QuotaUser>()
            .await
            .map_err(|e| EngineError::Supplier(format!("malformed quota user: {e}")))?;
        Ok(Some(user))
    }

    async fn usage_log(&self, job_name_prefix: &str) -> Result<Vec<UsageRecord>> {
        let url = format!("{}/usage-log", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("prefix", job_name_prefix)])
            .send()
            .await
            .map_err(|e| EngineError::Connectivity(format!("usage log at {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::Supplier(format!(
                "usage log returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<UsageRecord>>()
            .await
            .map_err(|e| EngineError::Supplier(format!("malformed usage log: {e}")))
    }
}

/// Quota stand-in for deployments without quota integration. The allocator
/// and monitor never consult it in that mode; answering "unknown" keeps any
/// accidental call harmless.
pub struct NullQuotaBackend;

#[async_trait]
impl QuotaBackend for NullQuotaBackend {
    async fn find_user(&self, _username: &str) -> Result<Option<QuotaUser>> {
        Ok(None)
    }

    async fn usage_log(&self, _job_name_prefix: &str) -> Result<Vec<UsageRecord>> {
        Ok(Vec::new())
    }
}

/// REST client for the user directory.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl UserDirectory for HttpDirectory {
    async fn lookup(&self, username: &str) -> Result<Option<DirectoryUser>> {
        let url = format!("{}/users/{username}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Connectivity(format!("directory lookup at {url}: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            warn!(username, status = %response.status(), "directory lookup failed");
            return Err(EngineError::Supplier(format!(
                "directory lookup returned {}",
                response.status()
            )));
        }
        let user = response
            .json::<DirectoryUser>()
            .await
            .map_err(|e| EngineError::Supplier(format!("malformed directory user: {e}")))?;
        Ok(Some(user))
    }
}

/// Directory stand-in: never provisions anyone.
pub struct NullDirectory;

#[async_trait]
impl UserDirectory for NullDirectory {
    async fn lookup(&self, _username: &str) -> Result<Option<DirectoryUser>> {
        Ok(None)
    }
}
