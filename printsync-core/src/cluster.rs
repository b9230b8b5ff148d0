//! Cluster routing: decides, per incoming document, whether this deployment
//! processes it locally, stages it for a sibling node, or leaves it for a
//! later cycle.
//!
//! Sibling liveness is tracked in memory only. A node is alive while its
//! last observed heartbeat is younger than twice the span of a full poll
//! cycle; the registry never persists anything.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use regex::Regex;

use crate::config::ConnectionSettings;
use crate::contract::Document;
use crate::error::{EngineError, Result};

/// Routing decision for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Process on this deployment.
    Local,
    /// Stage the document for the tagged sibling node.
    Relay { node: String },
    /// Target node unknown or not alive; retry on a future cycle, report
    /// nothing.
    Defer { node: String },
    /// Clustered document without a node tag: terminal, reported as ERROR.
    MissingNodeTag,
}

/// In-memory liveness registry for sibling cluster nodes.
#[derive(Debug)]
pub struct NodeLiveness {
    bound: Duration,
    seen: RwLock<HashMap<String, Instant>>,
}

impl NodeLiveness {
    pub fn new(bound: Duration) -> Self {
        Self {
            bound,
            seen: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, node: &str) {
        self.record_at(node, Instant::now());
    }

    pub fn record_at(&self, node: &str, at: Instant) {
        let mut seen = self.seen.write();
        let entry = seen.entry(node.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn is_alive(&self, node: &str) -> bool {
        self.is_alive_at(node, Instant::now())
    }

    /// Alive iff the last heartbeat is strictly younger than the bound.
    pub fn is_alive_at(&self, node: &str, now: Instant) -> bool {
        self.seen
            .read()
            .get(node)
            .map(|last| now.saturating_duration_since(*last) < self.bound)
            .unwrap_or(false)
    }
}

/// Extract the node tag from a document comment, e.g. `"... node=print-2"`.
pub fn extract_node_tag(comment: &str) -> Option<String> {
    // Compiled per call; comments are short and routing runs once per document.
    let re = Regex::new(r"node=([A-Za-z0-9_.-]+)").expect("node tag pattern is valid");
    re.captures(comment)
        .map(|captures| captures[1].to_string())
}

/// Apply the routing rules for one document on one connection.
///
/// Non-clustered connections always process locally. Clustered connections
/// must carry a node id; its absence is a configuration error fatal to the
/// connection, not just to this document.
pub fn route_document(
    conn: &ConnectionSettings,
    document: &Document,
    liveness: &NodeLiveness,
) -> Result<Route> {
    if !conn.cluster {
        return Ok(Route::Local);
    }
    let local_node = match conn.node_id.as_deref().map(str::trim) {
        Some(node) if !node.is_empty() => node,
        _ => {
            return Err(EngineError::Config(format!(
                "connection {} is clustered but has no node id",
                conn.account
            )))
        }
    };

    let Some(target) = extract_node_tag(&document.comment) else {
        return Ok(Route::MissingNodeTag);
    };
    if target == local_node {
        return Ok(Route::Local);
    }
    if conn.is_proxy_relay() && liveness.is_alive(&target) {
        return Ok(Route::Relay { node: target });
    }
    Ok(Route::Defer { node: target })
}
