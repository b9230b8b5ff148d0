//! In-memory reference implementation of the [`LedgerStore`] contract.
//!
//! `MemoryLedger` backs the test suite and simulation mode. It honors the
//! full transactional contract: operations staged between `begin` and
//! `commit` are invisible until the commit applies them atomically, user row
//! locks are held for the life of the transaction, and terminal dispatch
//! statuses stick.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::contract::{
    AccountRef, DispatchRecord, DispatchStatus, LedgerStore, NewDispatchRecord, NewDocumentLog,
    NewLedgerTransaction, TxnId, UserAccount,
};
use crate::error::{EngineError, Result};

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserAccount>,
    group_balances: HashMap<String, i64>,
    dispatches: HashMap<Uuid, DispatchRecord>,
    transactions: Vec<NewLedgerTransaction>,
    document_log: Vec<NewDocumentLog>,
    staged: HashMap<TxnId, Staged>,
}

#[derive(Default)]
struct Staged {
    ops: Vec<StagedOp>,
    /// Row locks held by this transaction; released when the guards drop.
    locks: Vec<OwnedMutexGuard<()>>,
}

enum StagedOp {
    InsertDispatch(DispatchRecord),
    InsertTransactions(Vec<NewLedgerTransaction>),
    UpdateStatus { dispatch: Uuid, status: DispatchStatus },
    AppendLog(NewDocumentLog),
}

/// Thread-safe in-memory ledger.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
    row_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_txn<R>(&self, txn: TxnId, f: impl FnOnce(&mut Staged) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let staged = inner
            .staged
            .get_mut(&txn)
            .ok_or_else(|| EngineError::Store(format!("unknown transaction {:?}", txn.0)))?;
        Ok(f(staged))
    }

    // --- inspection helpers for tests and simulation reports ---

    pub fn user_balance(&self, username: &str) -> Option<i64> {
        self.inner
            .lock()
            .users
            .get(username)
            .map(|u| u.balance_cents)
    }

    pub fn group_balance(&self, group: &str) -> Option<i64> {
        self.inner.lock().group_balances.get(group).copied()
    }

    pub fn transactions(&self) -> Vec<NewLedgerTransaction> {
        self.inner.lock().transactions.clone()
    }

    pub fn document_log(&self) -> Vec<NewDocumentLog> {
        self.inner.lock().document_log.clone()
    }

    pub fn dispatch(&self, id: Uuid) -> Option<DispatchRecord> {
        self.inner.lock().dispatches.get(&id).cloned()
    }
}

/// Monotonicity rule: a terminal status is never replaced by a different
/// one; re-applying the same terminal status is a no-op.
fn effective_status(current: DispatchStatus, requested: DispatchStatus) -> DispatchStatus {
    if current.is_terminal() && current != requested {
        current
    } else {
        requested
    }
}

fn apply(inner: &mut Inner, op: StagedOp) {
    match op {
        StagedOp::InsertDispatch(record) => {
            inner.dispatches.insert(record.id, record);
        }
        StagedOp::InsertTransactions(transactions) => {
            for txn in &transactions {
                match &txn.account {
                    AccountRef::User(username) => {
                        if let Some(user) = inner.users.get_mut(username) {
                            user.balance_cents += txn.amount_cents;
                        }
                    }
                    AccountRef::Group(group) => {
                        *inner.group_balances.entry(group.clone()).or_default() +=
                            txn.amount_cents;
                    }
                }
            }
            inner.transactions.extend(transactions);
        }
        StagedOp::UpdateStatus { dispatch, status } => {
            if let Some(record) = inner.dispatches.get_mut(&dispatch) {
                record.status = effective_status(record.status, status);
            }
        }
        StagedOp::AppendLog(entry) => inner.document_log.push(entry),
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> Result<TxnId> {
        let txn = TxnId::new();
        self.inner.lock().staged.insert(txn, Staged::default());
        Ok(txn)
    }

    async fn commit(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        let staged = inner
            .staged
            .remove(&txn)
            .ok_or_else(|| EngineError::Store(format!("unknown transaction {:?}", txn.0)))?;
        for op in staged.ops {
            apply(&mut inner, op);
        }
        // Row locks release here, after every op is applied.
        drop(staged.locks);
        Ok(())
    }

    async fn rollback(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .staged
            .remove(&txn)
            .ok_or_else(|| EngineError::Store(format!("unknown transaction {:?}", txn.0)))?;
        Ok(())
    }

    async fn lock_user(&self, txn: TxnId, username: &str) -> Result<UserAccount> {
        let row_lock = {
            let mut locks = self.row_locks.lock();
            locks
                .entry(username.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        // Await outside any sync lock.
        let guard = row_lock.lock_owned().await;

        let mut inner = self.inner.lock();
        let user = inner
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| EngineError::Store(format!("no ledger row for user {username}")))?;
        let staged = inner
            .staged
            .get_mut(&txn)
            .ok_or_else(|| EngineError::Store(format!("unknown transaction {:?}", txn.0)))?;
        staged.locks.push(guard);
        Ok(user)
    }

    async fn find_user(&self, username: &str) -> Result<Option<UserAccount>> {
        Ok(self.inner.lock().users.get(username).cloned())
    }

    async fn ensure_user(&self, username: &str, display_name: &str) -> Result<UserAccount> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .entry(username.to_string())
            .or_insert_with(|| UserAccount {
                username: username.to_string(),
                display_name: display_name.to_string(),
                balance_cents: 0,
                group: None,
            });
        Ok(user.clone())
    }

    async fn ensure_group_account(&self, group: &str) -> Result<()> {
        self.inner
            .lock()
            .group_balances
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn insert_dispatch(&self, txn: TxnId, record: NewDispatchRecord) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let record = DispatchRecord {
            id,
            account: record.account,
            document_id: record.document_id,
            document_name: record.document_name,
            requested_by: record.requested_by,
            mode: record.mode,
            printer: record.printer,
            job_prefix: record.job_prefix,
            allocation: record.allocation,
            cost_cents: record.cost_cents,
            grayscale: record.grayscale,
            status: record.status,
            reported: false,
            created_at: record.created_at,
            expires_at: record.expires_at,
        };
        self.with_txn(txn, |staged| {
            staged.ops.push(StagedOp::InsertDispatch(record));
        })?;
        Ok(id)
    }

    async fn insert_transactions(
        &self,
        txn: TxnId,
        transactions: Vec<NewLedgerTransaction>,
    ) -> Result<()> {
        self.with_txn(txn, |staged| {
            staged.ops.push(StagedOp::InsertTransactions(transactions));
        })
    }

    async fn update_dispatch_status(
        &self,
        txn: TxnId,
        dispatch: Uuid,
        status: DispatchStatus,
    ) -> Result<DispatchStatus> {
        let mut inner = self.inner.lock();
        // The effective status is computed against committed state plus any
        // insert staged earlier in this same transaction.
        let mut current = inner.dispatches.get(&dispatch).map(|d| d.status);
        if current.is_none() {
            if let Some(staged) = inner.staged.get(&txn) {
                for op in &staged.ops {
                    if let StagedOp::InsertDispatch(record) = op {
                        if record.id == dispatch {
                            current = Some(record.status);
                        }
                    }
                }
            }
        }
        let current = current
            .ok_or_else(|| EngineError::Store(format!("unknown dispatch {dispatch}")))?;
        let effective = effective_status(current, status);
        let staged = inner
            .staged
            .get_mut(&txn)
            .ok_or_else(|| EngineError::Store(format!("unknown transaction {:?}", txn.0)))?;
        staged.ops.push(StagedOp::UpdateStatus { dispatch, status });
        Ok(effective)
    }

    async fn dispatches_with_status(
        &self,
        account: &str,
        status: DispatchStatus,
    ) -> Result<Vec<DispatchRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<DispatchRecord> = inner
            .dispatches
            .values()
            .filter(|d| d.account == account && d.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|d| d.created_at);
        Ok(records)
    }

    async fn unreported_terminal(&self, account: &str) -> Result<Vec<DispatchRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<DispatchRecord> = inner
            .dispatches
            .values()
            .filter(|d| d.account == account && d.status.is_terminal() && !d.reported)
            .cloned()
            .collect();
        records.sort_by_key(|d| d.created_at);
        Ok(records)
    }

    async fn mark_reported(&self, dispatch: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .dispatches
            .get_mut(&dispatch)
            .ok_or_else(|| EngineError::Store(format!("unknown dispatch {dispatch}")))?;
        record.reported = true;
        Ok(())
    }

    async fn append_document_log(&self, txn: TxnId, entry: NewDocumentLog) -> Result<()> {
        self.with_txn(txn, |staged| {
            staged.ops.push(StagedOp::AppendLog(entry));
        })
    }
}
