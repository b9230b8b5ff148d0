use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration - loaded once at startup, immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between heartbeats of the poll loop.
    pub heartbeat_secs: u64,
    /// Number of heartbeats between two job-ticket polls.
    pub heartbeats_per_poll: u32,
    /// When set, the binary wires in-memory collaborators instead of live ones.
    #[serde(default)]
    pub simulate: bool,
    /// Whether the external quota system manages cost for auto-printed jobs.
    #[serde(default)]
    pub quota_integration: bool,
    /// Hours before an unreleased hold/ticket job is abandoned.
    pub ticket_expiry_hours: i64,
    /// Convert color content to a monochrome copy before submitting
    /// grayscale jobs to a color-capable backend.
    #[serde(default)]
    pub client_grayscale_filter: bool,
    /// Milliseconds between checks of the processing flag while disconnecting.
    #[serde(default = "default_disconnect_poll_millis")]
    pub disconnect_poll_millis: u64,
    pub pricing: Pricing,
}

fn default_disconnect_poll_millis() -> u64 {
    100
}

impl EngineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// A cluster node is alive while its last observed heartbeat is younger
    /// than twice the span of one full poll cycle.
    pub fn liveness_bound(&self) -> Duration {
        2 * self.heartbeat_interval() * self.heartbeats_per_poll
    }

    pub fn ticket_expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ticket_expiry_hours)
    }
}

/// Page pricing in cents, split by render mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    pub page_cost_cents: i64,
    pub color_page_cost_cents: i64,
}

impl Pricing {
    pub fn per_page(&self, grayscale: bool) -> i64 {
        if grayscale {
            self.page_cost_cents
        } else {
            self.color_page_cost_cents
        }
    }
}

/// One supplier account this deployment serves. Created at startup from
/// configuration, immutable for the connection's lifetime, closed at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Supplier account identifier.
    pub account: String,
    /// Remote supplier endpoint URL.
    pub endpoint: String,
    /// Whether this account is shared by a cluster of cooperating deployments.
    #[serde(default)]
    pub cluster: bool,
    /// This deployment's identity within the cluster. Required when `cluster`.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Secondary endpoint used to stage documents for sibling nodes. Its
    /// presence marks this connection as a proxy relay.
    #[serde(default)]
    pub proxy_endpoint: Option<String>,
    pub printers: PrinterMap,
    /// Charge group members individually instead of their shared account.
    #[serde(default)]
    pub charge_to_students: bool,
    /// Target printers park jobs until an operator releases them.
    #[serde(default)]
    pub hold_release: bool,
    /// Target printers require a printed job ticket for release.
    #[serde(default)]
    pub job_ticket: bool,
}

impl ConnectionSettings {
    pub fn is_proxy_relay(&self) -> bool {
        self.proxy_endpoint.is_some()
    }

    pub fn requires_release(&self) -> bool {
        self.hold_release || self.job_ticket
    }
}

/// Per-mode printer names for one connection. Not every mode needs its own
/// printer; [`PrinterMap::select`] falls back to a coarser mode and drops the
/// hint that could not be honored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrinterMap {
    #[serde(default)]
    pub plain: Option<String>,
    #[serde(default)]
    pub duplex: Option<String>,
    #[serde(default)]
    pub grayscale: Option<String>,
    #[serde(default)]
    pub grayscale_duplex: Option<String>,
}

/// Outcome of a printer lookup: the chosen printer name and the process
/// attributes that survived fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterChoice {
    pub printer: String,
    pub grayscale: bool,
    pub duplex: bool,
}

impl PrinterMap {
    /// 2x2 lookup on (grayscale, duplex). Fallback order prefers keeping the
    /// render mode over keeping duplex: a grayscale-duplex request without a
    /// grayscale-duplex printer lands on the grayscale printer simplex before
    /// it lands on a color one.
    pub fn select(&self, grayscale: bool, duplex: bool) -> Option<PrinterChoice> {
        let choice = |name: &Option<String>, grayscale: bool, duplex: bool| {
            name.as_ref().map(|printer| PrinterChoice {
                printer: printer.clone(),
                grayscale,
                duplex,
            })
        };
        match (grayscale, duplex) {
            (true, true) => choice(&self.grayscale_duplex, true, true)
                .or_else(|| choice(&self.grayscale, true, false))
                .or_else(|| choice(&self.duplex, false, true))
                .or_else(|| choice(&self.plain, false, false)),
            (true, false) => {
                choice(&self.grayscale, true, false).or_else(|| choice(&self.plain, false, false))
            }
            (false, true) => {
                choice(&self.duplex, false, true).or_else(|| choice(&self.plain, false, false))
            }
            (false, false) => choice(&self.plain, false, false),
        }
    }
}
