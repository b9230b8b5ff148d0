//! Print dispatch: consumes chunker and allocator output, selects a print
//! mode and target printer, submits to the backend and commits the ledger
//! effects transactionally.
//!
//! Network and spool calls happen before the store transaction opens; the
//! exclusive lock on the requester's ledger row is only held for the
//! persist step, so no concurrent dispatch for the same user interleaves
//! uncommitted state.

use std::io::Write;

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

use crate::allocate::{self, Allocation};
use crate::chunker::{self, Chunk};
use crate::config::{ConnectionSettings, Pricing};
use crate::contract::{
    DispatchMode, DispatchStatus, Document, LedgerStore, NewDispatchRecord, NewDocumentLog,
    PrintBackend, SubmitJob, SubmitOptions, TxnId,
};
use crate::error::{EngineError, Result};

/// Common prefix of every job name submitted for one account; the completion
/// monitor queries the quota backend's usage log by this.
pub fn account_prefix(account: &str) -> String {
    let account: String = account
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("ps_{account}_")
}

/// Common prefix of every backend job name submitted for one document, and
/// the key the completion monitor matches usage-log rows against.
pub fn job_prefix(account: &str, document_id: i64) -> String {
    format!("{}{document_id}", account_prefix(account))
}

fn job_name(prefix: &str, chunk_index: usize) -> String {
    format!("{prefix}_c{chunk_index}")
}

pub struct Dispatcher<'a> {
    pub backend: &'a dyn PrintBackend,
    pub store: &'a dyn LedgerStore,
    pub pricing: &'a Pricing,
    pub ticket_expiry: chrono::Duration,
    pub quota_active: bool,
    pub client_grayscale_filter: bool,
}

impl Dispatcher<'_> {
    /// Submit one document and persist the dispatch. Returns the dispatch id.
    ///
    /// Any error before the store transaction leaves no trace; any error
    /// inside it rolls the transaction back, so a rejected job never carries
    /// a partial ledger effect.
    pub async fn dispatch(
        &self,
        conn: &ConnectionSettings,
        document: &Document,
        allocation: &Allocation,
        chunks: &[Chunk],
        content: &[u8],
    ) -> Result<Uuid> {
        if chunks.is_empty() {
            return Err(EngineError::Content(format!(
                "document {} selects no pages",
                document.id
            )));
        }

        let choice = conn
            .printers
            .select(document.grayscale, document.duplex)
            .ok_or_else(|| {
                EngineError::Dispatch(format!(
                    "no printer configured on account {} for grayscale={} duplex={}",
                    conn.account, document.grayscale, document.duplex
                ))
            })?;

        let supported = self.backend.printer_media(&choice.printer).await?;
        for chunk in chunks {
            if !supported.iter().any(|media| *media == chunk.media) {
                return Err(EngineError::Dispatch(format!(
                    "printer {} has no {} media configuration",
                    choice.printer, chunk.media
                )));
            }
        }

        let mode = if self.quota_active {
            DispatchMode::Auto
        } else if conn.requires_release() {
            DispatchMode::Hold
        } else {
            DispatchMode::Auto
        };

        // Spool the content to disk; both temp files are deleted on drop,
        // whatever the outcome.
        let spooled = spool(content)?;
        let converted;
        let submit_path = if choice.grayscale && self.client_grayscale_filter {
            converted = NamedTempFile::new().map_err(|e| {
                EngineError::Dispatch(format!("failed to create monochrome spool file: {e}"))
            })?;
            self.backend
                .render_monochrome(spooled.path(), converted.path())
                .await?;
            converted.path().to_path_buf()
        } else {
            spooled.path().to_path_buf()
        };

        let pages: u32 = chunks.iter().map(Chunk::pages).sum();
        let cost_cents = i64::from(pages)
            * i64::from(allocation.total)
            * self.pricing.per_page(choice.grayscale);
        let prefix = job_prefix(&conn.account, document.id);

        for (index, chunk) in chunks.iter().enumerate() {
            let job = SubmitJob {
                printer: choice.printer.clone(),
                content_path: submit_path.clone(),
                job_name: job_name(&prefix, index),
                options: SubmitOptions {
                    media: chunk.media.clone(),
                    duplex: choice.duplex,
                    color: !choice.grayscale,
                    copies: allocation.total,
                    collate: true,
                    page_ranges: chunker::global_ranges(&document.parts, chunk),
                },
            };
            let backend_id = self.backend.submit(job).await?;
            debug!(
                document_id = document.id,
                chunk = index,
                backend_id = %backend_id,
                printer = %choice.printer,
                "chunk submitted"
            );
        }

        let dispatch_id = self
            .persist(conn, document, allocation, mode, &choice.printer, &prefix, cost_cents)
            .await?;
        match serde_json::to_string(allocation) {
            Ok(json) => debug!(dispatch_id = %dispatch_id, allocation = %json, "allocation snapshot"),
            Err(e) => debug!(dispatch_id = %dispatch_id, error = %e, "allocation snapshot not serializable"),
        }
        info!(
            document_id = document.id,
            dispatch_id = %dispatch_id,
            mode = ?mode,
            printer = %choice.printer,
            chunks = chunks.len(),
            copies = allocation.total,
            "document dispatched"
        );
        Ok(dispatch_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        conn: &ConnectionSettings,
        document: &Document,
        allocation: &Allocation,
        mode: DispatchMode,
        printer: &str,
        prefix: &str,
        cost_cents: i64,
    ) -> Result<Uuid> {
        // Auto-create accounts outside the locked transaction.
        self.store
            .ensure_user(&document.requested_by, &document.requested_by)
            .await?;
        for group in allocation.group_copies.keys() {
            self.store.ensure_group_account(group).await?;
        }

        let txn = self.store.begin().await?;
        match self
            .persist_in(txn, conn, document, allocation, mode, printer, prefix, cost_cents)
            .await
        {
            Ok(id) => {
                self.store.commit(txn).await?;
                Ok(id)
            }
            Err(e) => {
                if let Err(rollback) = self.store.rollback(txn).await {
                    tracing::error!(error = %rollback, "rollback failed after dispatch persist error");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_in(
        &self,
        txn: TxnId,
        conn: &ConnectionSettings,
        document: &Document,
        allocation: &Allocation,
        mode: DispatchMode,
        printer: &str,
        prefix: &str,
        cost_cents: i64,
    ) -> Result<Uuid> {
        self.store.lock_user(txn, &document.requested_by).await?;

        let now = Utc::now();
        let status = match mode {
            DispatchMode::Auto => DispatchStatus::Submitted,
            DispatchMode::Hold => DispatchStatus::Held,
        };
        let dispatch_id = self
            .store
            .insert_dispatch(
                txn,
                NewDispatchRecord {
                    account: conn.account.clone(),
                    document_id: document.id,
                    document_name: document.name.clone(),
                    requested_by: document.requested_by.clone(),
                    mode,
                    printer: printer.to_string(),
                    job_prefix: prefix.to_string(),
                    allocation: allocation.clone(),
                    cost_cents,
                    grayscale: document.grayscale,
                    status,
                    created_at: now,
                    expires_at: match mode {
                        DispatchMode::Hold => Some(now + self.ticket_expiry),
                        DispatchMode::Auto => None,
                    },
                },
            )
            .await?;

        // Auto mode under quota integration defers its transactions to the
        // completion monitor, so a job the backend later rejects is never
        // charged. Every other mode charges now.
        if !(mode == DispatchMode::Auto && self.quota_active) {
            let narrative = format!("print {}", document.name);
            self.store
                .insert_transactions(
                    txn,
                    allocate::build_transactions(allocation, cost_cents, &narrative, dispatch_id),
                )
                .await?;
        }

        self.store
            .append_document_log(
                txn,
                NewDocumentLog {
                    account: conn.account.clone(),
                    document_id: document.id,
                    document_name: document.name.clone(),
                    username: document.requested_by.clone(),
                    status,
                    detail: format!("dispatched to {printer}"),
                    at: now,
                },
            )
            .await?;

        Ok(dispatch_id)
    }
}

fn spool(content: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()
        .map_err(|e| EngineError::Dispatch(format!("failed to create spool file: {e}")))?;
    file.write_all(content)
        .map_err(|e| EngineError::Dispatch(format!("failed to write spool file: {e}")))?;
    file.flush()
        .map_err(|e| EngineError::Dispatch(format!("failed to flush spool file: {e}")))?;
    Ok(file)
}
