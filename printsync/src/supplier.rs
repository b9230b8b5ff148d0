#![doc = "Supplier integration: bridges the core Supplier/PeerRelay traits to the remote job-supplying service over HTTP."]
//
//! # Supplier client (CLI <-> Core)
//!
//! The supplier speaks a document-oriented RPC dialect: one POST per
//! operation with a JSON `{method, params}` envelope and a JSON
//! `{result}` or `{error}` reply. Downloads are served by reference: the
//! RPC returns a URL plus a SHA-256 checksum, and the content is fetched
//! with a second GET.
//!
//! Fault mapping is what the engine branches on:
//! - HTTP 429 -> [`EngineError::RateLimited`] (skip this poll, continue)
//! - transport errors -> [`EngineError::Connectivity`] (abort the cycle)
//! - RPC error payloads and malformed replies -> [`EngineError::Supplier`]

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use printsync_core::config::ConnectionSettings;
use printsync_core::contract::{
    DocumentStatus, DownloadedContent, JobTicket, PeerRelay, Supplier,
};
use printsync_core::error::{EngineError, Result};

pub struct HttpSupplier {
    client: reqwest::Client,
    api_key: String,
    /// account -> RPC endpoint
    endpoints: HashMap<String, String>,
}

impl HttpSupplier {
    pub fn new(api_key: String, connections: &[ConnectionSettings]) -> Self {
        let endpoints = connections
            .iter()
            .map(|conn| (conn.account.clone(), conn.endpoint.clone()))
            .collect();
        Self {
            client: reqwest::Client::new(),
            api_key,
            endpoints,
        }
    }

    fn endpoint(&self, account: &str) -> Result<&str> {
        self.endpoints
            .get(account)
            .map(String::as_str)
            .ok_or_else(|| EngineError::Config(format!("no endpoint for account {account}")))
    }

    async fn call(&self, account: &str, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let endpoint = self.endpoint(account)?;
        debug!(account, method, "supplier call");

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "method": method, "params": params }))
            .send()
            .await
            .map_err(|e| EngineError::Connectivity(format!("{method} to {endpoint}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited(format!("{method} on {account}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Supplier(format!(
                "{method} returned {status}: {body}"
            )));
        }

        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Supplier(format!("{method} reply is not JSON: {e}")))?;
        if let Some(error) = reply.get("error") {
            return Err(EngineError::Supplier(format!("{method} failed: {error}")));
        }
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| EngineError::Supplier(format!("{method} reply carries no result")))
    }
}

#[async_trait]
impl Supplier for HttpSupplier {
    async fn get_job_ticket(&self, account: &str) -> Result<JobTicket> {
        let result = self
            .call(account, "getJobTicket", json!({ "account": account }))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| EngineError::Supplier(format!("malformed job ticket: {e}")))
    }

    async fn download_document(&self, account: &str, document_id: i64) -> Result<DownloadedContent> {
        let result = self
            .call(
                account,
                "downloadDocument",
                json!({ "account": account, "documentId": document_id }),
            )
            .await?;
        let url = result
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Supplier("download reply carries no url".to_string()))?;
        let sha256 = result
            .get("sha256")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Supplier("download reply carries no checksum".to_string()))?
            .to_string();

        let bytes = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| EngineError::Connectivity(format!("document fetch from {url}: {e}")))?
            .error_for_status()
            .map_err(|e| EngineError::Supplier(format!("document fetch from {url}: {e}")))?
            .bytes()
            .await
            .map_err(|e| EngineError::Connectivity(format!("document body from {url}: {e}")))?
            .to_vec();

        info!(account, document_id, size = bytes.len(), "document downloaded");
        Ok(DownloadedContent { bytes, sha256 })
    }

    async fn report_document_status(
        &self,
        account: &str,
        document_id: i64,
        status: DocumentStatus,
        comment: &str,
    ) -> Result<()> {
        self.call(
            account,
            "reportDocumentStatus",
            json!({
                "account": account,
                "documentId": document_id,
                "status": status.to_string(),
                "comment": comment,
            }),
        )
        .await?;
        Ok(())
    }

    async fn close(&self, account: &str) -> Result<()> {
        self.call(account, "closeConnection", json!({ "account": account }))
            .await?;
        Ok(())
    }
}

/// HTTP relay client for the cluster proxy transport: stages documents on
/// the sibling-facing endpoint, parameterized by `account` and `node` query
/// values. A successful round-trip doubles as a liveness observation for
/// the target node.
pub struct HttpPeerRelay {
    client: reqwest::Client,
    /// account -> proxy endpoint; only relay-configured connections appear.
    endpoints: HashMap<String, String>,
    observed: Mutex<Vec<(String, Instant)>>,
}

impl HttpPeerRelay {
    pub fn new(connections: &[ConnectionSettings]) -> Self {
        let endpoints = connections
            .iter()
            .filter_map(|conn| {
                conn.proxy_endpoint
                    .clone()
                    .map(|endpoint| (conn.account.clone(), endpoint))
            })
            .collect();
        Self {
            client: reqwest::Client::new(),
            endpoints,
            observed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PeerRelay for HttpPeerRelay {
    async fn stage_document(
        &self,
        account: &str,
        node: &str,
        document_id: i64,
        content: &[u8],
    ) -> Result<()> {
        let endpoint = self.endpoints.get(account).ok_or_else(|| {
            EngineError::Config(format!("no proxy endpoint for account {account}"))
        })?;

        let document = document_id.to_string();
        let response = self
            .client
            .post(endpoint)
            .query(&[
                ("account", account),
                ("node", node),
                ("document", document.as_str()),
            ])
            .body(content.to_vec())
            .send()
            .await
            .map_err(|e| EngineError::Connectivity(format!("relay to {endpoint}: {e}")))?;

        if !response.status().is_success() {
            warn!(account, node, document_id, status = %response.status(), "relay rejected document");
            return Err(EngineError::Supplier(format!(
                "relay returned {}",
                response.status()
            )));
        }
        self.observed.lock().push((node.to_string(), Instant::now()));
        Ok(())
    }

    fn observed_heartbeats(&self) -> Vec<(String, Instant)> {
        std::mem::take(&mut *self.observed.lock())
    }
}
