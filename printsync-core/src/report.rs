//! Status reporting: maps internal terminal states to the supplier's status
//! vocabulary and sends them over the document's own connection. Reports are
//! never proxied - they always go directly to the supplier - and are safe to
//! repeat, since the supplier treats duplicates as no-ops.

use tracing::{info, warn};

use crate::contract::{DispatchRecord, DispatchStatus, DocumentStatus, LedgerStore, Supplier};
use crate::error::Result;

/// Fixed reason sent when a clustered document carries no node tag.
pub const NO_NODE_TAG_REASON: &str = "document carries no cluster node tag";

/// The supplier-facing status for an internal dispatch status, if terminal.
pub fn supplier_status(status: DispatchStatus) -> Option<DocumentStatus> {
    match status {
        DispatchStatus::Completed => Some(DocumentStatus::Completed),
        DispatchStatus::Cancelled => Some(DocumentStatus::Cancelled),
        DispatchStatus::Error => Some(DocumentStatus::Error),
        DispatchStatus::Submitted
        | DispatchStatus::Held
        | DispatchStatus::PendingComplete
        | DispatchStatus::PendingCancel => None,
    }
}

pub struct Reporter<'a> {
    pub supplier: &'a dyn Supplier,
    pub store: &'a dyn LedgerStore,
}

impl Reporter<'_> {
    /// Report a persisted dispatch's terminal outcome and mark it reported.
    ///
    /// A transport failure leaves the record unreported so a later sweep
    /// retries it; local state is never touched on failure.
    pub async fn report_dispatch(&self, record: &DispatchRecord, comment: &str) -> Result<()> {
        let Some(status) = supplier_status(record.status) else {
            return Ok(());
        };
        match self
            .supplier
            .report_document_status(&record.account, record.document_id, status, comment)
            .await
        {
            Ok(()) => {
                self.store.mark_reported(record.id).await?;
                info!(
                    document_id = record.document_id,
                    status = %status,
                    "outcome reported to supplier"
                );
            }
            Err(e) => {
                warn!(
                    document_id = record.document_id,
                    status = %status,
                    error = %e,
                    "status report failed; will retry on a later pass"
                );
            }
        }
        Ok(())
    }

    /// Report an outcome for a document that never produced a dispatch record
    /// (routing, accounting or dispatch rejections). Transport failures are
    /// logged and swallowed: the supplier re-offers the document next poll.
    pub async fn report_document(
        &self,
        account: &str,
        document_id: i64,
        status: DocumentStatus,
        comment: &str,
    ) {
        match self
            .supplier
            .report_document_status(account, document_id, status, comment)
            .await
        {
            Ok(()) => info!(document_id, status = %status, comment, "status reported to supplier"),
            Err(e) => warn!(document_id, status = %status, error = %e, "status report failed"),
        }
    }
}
