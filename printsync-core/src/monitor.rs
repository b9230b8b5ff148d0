//! Completion monitoring: two independent sweeps per poll cycle resolve
//! terminal outcomes for dispatched jobs.
//!
//! The auto sweep reads the quota backend's usage log and reconciles
//! quota-integrated jobs, creating their deferred ledger transactions only
//! once the backend confirms success. The hold sweep promotes hold/ticket
//! jobs out of their pending sub-states and abandons expired ones. Both run
//! inside a read-guarded section of the maintenance gate and abort on
//! connectivity failure without taking the poll cycle down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

use crate::allocate;
use crate::config::ConnectionSettings;
use crate::contract::{
    DispatchMode, DispatchRecord, DispatchStatus, LedgerStore, NewDocumentLog,
    NewLedgerTransaction, QuotaBackend,
};
use crate::dispatch::account_prefix;
use crate::error::Result;
use crate::report::Reporter;

/// How long a sweep waits for the maintenance gate before skipping the pass.
const GATE_WAIT: Duration = Duration::from_secs(5);

/// Read/write gate that lets administrative maintenance suspend all
/// ledger-writing sweeps without aborting in-flight network I/O.
#[derive(Clone, Default)]
pub struct MaintenanceGate {
    inner: Arc<RwLock<()>>,
}

impl MaintenanceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend sweeps until the returned guard is dropped.
    pub async fn suspend(&self) -> OwnedRwLockWriteGuard<()> {
        self.inner.clone().write_owned().await
    }

    async fn enter(&self, wait: Duration) -> Option<OwnedRwLockReadGuard<()>> {
        tokio::time::timeout(wait, self.inner.clone().read_owned())
            .await
            .ok()
    }
}

pub struct Monitor<'a> {
    pub store: &'a dyn LedgerStore,
    pub quota: &'a dyn QuotaBackend,
    pub reporter: Reporter<'a>,
    pub gate: &'a MaintenanceGate,
    pub quota_active: bool,
}

impl Monitor<'_> {
    /// Run every sweep for one connection. Individual sweep failures are
    /// administrative warnings; they never fail the poll cycle.
    pub async fn run(&self, conn: &ConnectionSettings) -> Result<()> {
        let Some(_guard) = self.gate.enter(GATE_WAIT).await else {
            warn!(account = %conn.account, "maintenance gate held; skipping monitor sweeps");
            return Ok(());
        };

        if self.quota_active {
            if let Err(e) = self.auto_sweep(conn).await {
                warn!(account = %conn.account, error = %e, "auto sweep aborted");
            }
        }
        if let Err(e) = self.hold_sweep(conn).await {
            warn!(account = %conn.account, error = %e, "hold sweep aborted");
        }
        if let Err(e) = self.retry_unreported(conn).await {
            warn!(account = %conn.account, error = %e, "report retry pass aborted");
        }
        Ok(())
    }

    /// Resolve quota-integrated jobs against the backend's usage log.
    async fn auto_sweep(&self, conn: &ConnectionSettings) -> Result<()> {
        let pending: Vec<DispatchRecord> = self
            .store
            .dispatches_with_status(&conn.account, DispatchStatus::Submitted)
            .await?
            .into_iter()
            .filter(|d| d.mode == DispatchMode::Auto)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let log = self.quota.usage_log(&account_prefix(&conn.account)).await?;

        for row in &log {
            if !pending.iter().any(|d| row.job_name.starts_with(&d.job_prefix)) {
                warn!(job_name = %row.job_name, "usage-log row matches no open dispatch; skipping");
            }
        }

        for dispatch in pending {
            let rows: Vec<_> = log
                .iter()
                .filter(|row| row.job_name.starts_with(&dispatch.job_prefix))
                .collect();
            if rows.is_empty() {
                continue;
            }
            let completed = rows.iter().filter(|row| row.completed).count();
            if completed != 0 && completed != rows.len() {
                warn!(
                    job_prefix = %dispatch.job_prefix,
                    "ambiguous usage-log outcome; skipping"
                );
                continue;
            }
            let status = if completed == rows.len() {
                DispatchStatus::Completed
            } else {
                DispatchStatus::Cancelled
            };
            // Deferred transactions exist only for confirmed completions, so
            // a job the backend rejected is never charged.
            let transactions = if status == DispatchStatus::Completed {
                allocate::build_transactions(
                    &dispatch.allocation,
                    dispatch.cost_cents,
                    &format!("print {}", dispatch.document_name),
                    dispatch.id,
                )
            } else {
                Vec::new()
            };
            self.finalize(&dispatch, status, transactions, "resolved from usage log")
                .await?;
        }
        Ok(())
    }

    /// Promote hold/ticket jobs out of their pending sub-states and abandon
    /// the ones whose ticket expired.
    async fn hold_sweep(&self, conn: &ConnectionSettings) -> Result<()> {
        for dispatch in self
            .store
            .dispatches_with_status(&conn.account, DispatchStatus::PendingComplete)
            .await?
        {
            self.finalize(&dispatch, DispatchStatus::Completed, Vec::new(), "released")
                .await?;
        }
        for dispatch in self
            .store
            .dispatches_with_status(&conn.account, DispatchStatus::PendingCancel)
            .await?
        {
            let refunds = hold_refunds(&dispatch);
            self.finalize(&dispatch, DispatchStatus::Cancelled, refunds, "cancelled")
                .await?;
        }
        let now = Utc::now();
        for dispatch in self
            .store
            .dispatches_with_status(&conn.account, DispatchStatus::Held)
            .await?
        {
            if dispatch.expires_at.is_some_and(|expiry| expiry < now) {
                let refunds = hold_refunds(&dispatch);
                self.finalize(
                    &dispatch,
                    DispatchStatus::Cancelled,
                    refunds,
                    "ticket expired before release",
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Retry supplier reports for terminal dispatches a previous pass could
    /// not deliver.
    async fn retry_unreported(&self, conn: &ConnectionSettings) -> Result<()> {
        for dispatch in self.store.unreported_terminal(&conn.account).await? {
            self.reporter
                .report_dispatch(&dispatch, &format!("job {}", dispatch.status))
                .await?;
        }
        Ok(())
    }

    /// Apply a terminal transition plus its ledger effects in one store
    /// transaction, then hand the outcome to the reporter.
    async fn finalize(
        &self,
        dispatch: &DispatchRecord,
        status: DispatchStatus,
        transactions: Vec<NewLedgerTransaction>,
        detail: &str,
    ) -> Result<()> {
        let txn = self.store.begin().await?;
        let applied: Result<DispatchStatus> = async {
            self.store.lock_user(txn, &dispatch.requested_by).await?;
            let effective = self
                .store
                .update_dispatch_status(txn, dispatch.id, status)
                .await?;
            // A record that already reached a terminal state keeps it; only a
            // real transition carries ledger effects and a log row.
            if effective == status && !dispatch.status.is_terminal() {
                if !transactions.is_empty() {
                    self.store.insert_transactions(txn, transactions).await?;
                }
                self.store
                    .append_document_log(
                        txn,
                        NewDocumentLog {
                            account: dispatch.account.clone(),
                            document_id: dispatch.document_id,
                            document_name: dispatch.document_name.clone(),
                            username: dispatch.requested_by.clone(),
                            status,
                            detail: detail.to_string(),
                            at: Utc::now(),
                        },
                    )
                    .await?;
            } else {
                debug!(dispatch_id = %dispatch.id, status = %effective, "terminal status already set");
            }
            Ok(effective)
        }
        .await;

        let effective = match applied {
            Ok(effective) => {
                self.store.commit(txn).await?;
                effective
            }
            Err(e) => {
                if let Err(rollback) = self.store.rollback(txn).await {
                    warn!(error = %rollback, "rollback failed after finalize error");
                }
                return Err(e);
            }
        };

        info!(
            dispatch_id = %dispatch.id,
            document_id = dispatch.document_id,
            status = %effective,
            detail,
            "dispatch finalized"
        );
        let mut reported = dispatch.clone();
        reported.status = effective;
        self.reporter.report_dispatch(&reported, detail).await
    }
}

/// Reversing transactions for a cancelled hold/ticket job: the projected
/// cost was charged at dispatch time and must not stick for pages that never
/// printed.
fn hold_refunds(dispatch: &DispatchRecord) -> Vec<NewLedgerTransaction> {
    let mut refunds = allocate::build_transactions(
        &dispatch.allocation,
        dispatch.cost_cents,
        &format!("refund {}", dispatch.document_name),
        dispatch.id,
    );
    for refund in &mut refunds {
        refund.amount_cents = -refund.amount_cents;
    }
    refunds
}
