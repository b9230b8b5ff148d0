//! The poll/dispatch heartbeat loop: ties the router, allocator, chunker,
//! dispatcher, monitor and reporter together per configured supplier
//! connection, one cycle at a time, with cooperative shutdown.
//!
//! One engine instance runs one sequential loop: no parallelism across
//! connections within a tick, documents processed in ticket order, and a
//! `processing` flag guarantees disconnect never abandons a document
//! mid-transaction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::allocate;
use crate::chunker;
use crate::cluster::{self, NodeLiveness, Route};
use crate::config::{ConnectionSettings, EngineConfig};
use crate::contract::{
    Document, DocumentStatus, LedgerStore, PeerRelay, PrintBackend, QuotaBackend, Supplier,
    UserDirectory,
};
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, Result};
use crate::monitor::{MaintenanceGate, Monitor};
use crate::report::{Reporter, NO_NODE_TAG_REASON};

/// Flags an administrator can flip while the engine runs.
#[derive(Debug)]
pub struct RuntimeFlags {
    enabled: AtomicBool,
    quota_integration: AtomicBool,
}

impl RuntimeFlags {
    pub fn new(enabled: bool, quota_integration: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            quota_integration: AtomicBool::new(quota_integration),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn quota_integration(&self) -> bool {
        self.quota_integration.load(Ordering::SeqCst)
    }

    pub fn set_quota_integration(&self, active: bool) {
        self.quota_integration.store(active, Ordering::SeqCst);
    }
}

/// The engine's external collaborators, injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub supplier: Arc<dyn Supplier>,
    pub backend: Arc<dyn PrintBackend>,
    pub quota: Arc<dyn QuotaBackend>,
    pub directory: Arc<dyn UserDirectory>,
    pub store: Arc<dyn LedgerStore>,
    pub relay: Arc<dyn PeerRelay>,
}

/// One orchestrator instance. All mutable process state (routing table,
/// liveness registry, flags) lives here; the only ambient data is the
/// immutable configuration snapshot taken at construction.
pub struct Engine {
    config: EngineConfig,
    /// Immutable routing table: account -> connection settings.
    connections: Arc<BTreeMap<String, ConnectionSettings>>,
    flags: Arc<RuntimeFlags>,
    liveness: NodeLiveness,
    gate: MaintenanceGate,
    shutdown: CancellationToken,
    processing: Arc<AtomicBool>,
    disconnected: AtomicBool,
    quota_at_start: bool,
    collaborators: Collaborators,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        connections: Vec<ConnectionSettings>,
        collaborators: Collaborators,
        flags: Arc<RuntimeFlags>,
        shutdown: CancellationToken,
    ) -> Self {
        let liveness = NodeLiveness::new(config.liveness_bound());
        let quota_at_start = flags.quota_integration();
        let connections = Arc::new(
            connections
                .into_iter()
                .map(|conn| (conn.account.clone(), conn))
                .collect::<BTreeMap<_, _>>(),
        );
        Self {
            config,
            connections,
            flags,
            liveness,
            gate: MaintenanceGate::new(),
            shutdown,
            processing: Arc::new(AtomicBool::new(false)),
            disconnected: AtomicBool::new(false),
            quota_at_start,
            collaborators,
        }
    }

    /// The maintenance gate, for administrative suspension of ledger sweeps.
    pub fn maintenance_gate(&self) -> MaintenanceGate {
        self.gate.clone()
    }

    pub fn liveness(&self) -> &NodeLiveness {
        &self.liveness
    }

    /// Run the heartbeat loop for at most `bound`, then disconnect.
    ///
    /// Whatever the exit path - bound elapsed, shutdown, or error - the
    /// connections are closed before this returns.
    pub async fn run(&self, bound: Duration) -> Result<()> {
        info!(
            connections = self.connections.len(),
            heartbeat_secs = self.config.heartbeat_secs,
            heartbeats_per_poll = self.config.heartbeats_per_poll,
            quota_integration = self.quota_at_start,
            "engine started"
        );
        let deadline = tokio::time::Instant::now() + bound;
        let mut beats: u32 = 0;

        let outcome = loop {
            if self.shutdown.is_cancelled() {
                info!("shutdown requested, leaving heartbeat loop");
                break Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("run bound elapsed");
                break Ok(());
            }
            if !self.flags.enabled() {
                self.sleep_heartbeat().await;
                continue;
            }
            // A flipped integration mode invalidates printer selection and
            // ledger timing wholesale: hard stop, restart with new settings.
            if self.flags.quota_integration() != self.quota_at_start {
                break Err(EngineError::Config(
                    "quota integration mode changed while running; restart required".into(),
                ));
            }

            beats += 1;
            if beats >= self.config.heartbeats_per_poll {
                beats = 0;
                if let Err(e) = self.poll_cycle().await {
                    break Err(e);
                }
            }
            self.sleep_heartbeat().await;
        };

        self.disconnect().await;
        outcome
    }

    async fn sleep_heartbeat(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// One ticket-poll pass over every connection.
    async fn poll_cycle(&self) -> Result<()> {
        for (node, at) in self.collaborators.relay.observed_heartbeats() {
            self.liveness.record_at(&node, at);
        }

        for conn in self.connections.values() {
            if self.shutdown.is_cancelled() {
                break;
            }
            let ticket = match self.collaborators.supplier.get_job_ticket(&conn.account).await {
                Ok(ticket) => ticket,
                Err(EngineError::RateLimited(msg)) => {
                    warn!(account = %conn.account, msg, "rate limited; skipping this poll");
                    continue;
                }
                // Connectivity and loop-level supplier faults abort the cycle.
                Err(e) => return Err(e),
            };
            debug!(
                account = %conn.account,
                documents = ticket.documents.len(),
                "job ticket fetched"
            );

            for document in &ticket.documents {
                if self.shutdown.is_cancelled() {
                    break;
                }
                self.processing.store(true, Ordering::SeqCst);
                let result = self.process_document(conn, document).await;
                self.processing.store(false, Ordering::SeqCst);
                if let Err(e) = result {
                    // Only configuration errors escape process_document; they
                    // are fatal to the connection, not to the engine.
                    error!(
                        account = %conn.account,
                        document_id = document.id,
                        error = %e,
                        "connection misconfigured; skipping remaining documents"
                    );
                    break;
                }
            }

            let monitor = Monitor {
                store: &*self.collaborators.store,
                quota: &*self.collaborators.quota,
                reporter: Reporter {
                    supplier: &*self.collaborators.supplier,
                    store: &*self.collaborators.store,
                },
                gate: &self.gate,
                quota_active: self.quota_at_start,
            };
            monitor.run(conn).await?;
        }
        Ok(())
    }

    /// Handle one document end to end. Per-document faults are reported to
    /// the supplier and swallowed; only connection-level configuration
    /// errors propagate.
    async fn process_document(&self, conn: &ConnectionSettings, document: &Document) -> Result<()> {
        let reporter = Reporter {
            supplier: &*self.collaborators.supplier,
            store: &*self.collaborators.store,
        };

        match cluster::route_document(conn, document, &self.liveness)? {
            Route::Local => {}
            Route::MissingNodeTag => {
                warn!(document_id = document.id, "clustered document without node tag");
                reporter
                    .report_document(
                        &conn.account,
                        document.id,
                        DocumentStatus::Error,
                        NO_NODE_TAG_REASON,
                    )
                    .await;
                return Ok(());
            }
            Route::Relay { node } => {
                self.relay_document(conn, document, &node).await;
                return Ok(());
            }
            Route::Defer { node } => {
                debug!(
                    document_id = document.id,
                    node, "target node not reachable; deferring to a later cycle"
                );
                return Ok(());
            }
        }

        let allocation = match allocate::allocate(
            &document.billing,
            conn.charge_to_students,
            self.quota_at_start,
            &*self.collaborators.store,
            &*self.collaborators.directory,
            &*self.collaborators.quota,
        )
        .await
        {
            Ok(allocation) => allocation,
            Err(e) => {
                error!(document_id = document.id, error = %e, "allocation failed");
                reporter
                    .report_document(
                        &conn.account,
                        document.id,
                        DocumentStatus::Error,
                        &e.to_string(),
                    )
                    .await;
                return Ok(());
            }
        };
        if allocation.total == 0 {
            warn!(document_id = document.id, "no valid billing entries; aborting job");
            reporter
                .report_document(
                    &conn.account,
                    document.id,
                    DocumentStatus::Error,
                    "no valid billing entries",
                )
                .await;
            return Ok(());
        }

        let chunks = match chunker::chunk_selection(&document.parts, &document.page_selection) {
            Ok(chunks) if !chunks.is_empty() => chunks,
            Ok(_) => {
                reporter
                    .report_document(
                        &conn.account,
                        document.id,
                        DocumentStatus::Cancelled,
                        "page selection selects no pages",
                    )
                    .await;
                return Ok(());
            }
            Err(e) => {
                reporter
                    .report_document(
                        &conn.account,
                        document.id,
                        DocumentStatus::Cancelled,
                        &e.to_string(),
                    )
                    .await;
                return Ok(());
            }
        };

        let content = match self
            .collaborators
            .supplier
            .download_document(&conn.account, document.id)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                // No status report: the supplier re-offers the document on
                // the next poll.
                warn!(document_id = document.id, error = %e, "download failed; document left for retry");
                return Ok(());
            }
        };
        if let Err(e) = content.verify() {
            reporter
                .report_document(
                    &conn.account,
                    document.id,
                    DocumentStatus::Cancelled,
                    &e.to_string(),
                )
                .await;
            return Ok(());
        }

        let dispatcher = Dispatcher {
            backend: &*self.collaborators.backend,
            store: &*self.collaborators.store,
            pricing: &self.config.pricing,
            ticket_expiry: self.config.ticket_expiry(),
            quota_active: self.quota_at_start,
            client_grayscale_filter: self.config.client_grayscale_filter,
        };
        match dispatcher
            .dispatch(conn, document, &allocation, &chunks, &content.bytes)
            .await
        {
            Ok(_) => {}
            Err(EngineError::Content(msg)) => {
                reporter
                    .report_document(&conn.account, document.id, DocumentStatus::Cancelled, &msg)
                    .await;
            }
            Err(e) => {
                error!(document_id = document.id, error = %e, "dispatch failed");
                reporter
                    .report_document(
                        &conn.account,
                        document.id,
                        DocumentStatus::Error,
                        &e.to_string(),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Proxy branch: download and stage the document for a sibling node.
    /// Failures report nothing - the document stays pending and is retried
    /// once the peer becomes reachable.
    async fn relay_document(&self, conn: &ConnectionSettings, document: &Document, node: &str) {
        let content = match self
            .collaborators
            .supplier
            .download_document(&conn.account, document.id)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                warn!(document_id = document.id, node, error = %e, "download for relay failed");
                return;
            }
        };
        match self
            .collaborators
            .relay
            .stage_document(&conn.account, node, document.id, &content.bytes)
            .await
        {
            Ok(()) => {
                self.liveness.record(node);
                info!(document_id = document.id, node, "document staged for peer");
            }
            Err(e) => {
                warn!(document_id = document.id, node, error = %e, "staging for peer failed");
            }
        }
    }

    /// Close every connection after waiting for any in-flight document to
    /// finish. Idempotent - the second call returns immediately.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let poll = Duration::from_millis(self.config.disconnect_poll_millis);
        while self.processing.load(Ordering::SeqCst) {
            tokio::time::sleep(poll).await;
        }
        let closes = self
            .connections
            .values()
            .map(|conn| self.collaborators.supplier.close(&conn.account));
        for (conn, result) in self.connections.values().zip(join_all(closes).await) {
            if let Err(e) = result {
                warn!(account = %conn.account, error = %e, "closing connection failed");
            }
        }
        info!("all supplier connections closed");
    }
}
