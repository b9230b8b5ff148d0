//! # contract: collaborator interfaces for the printsync engine
//!
//! This module defines the traits the engine depends on and the plain data
//! types that cross them: the external job supplier, the print backend, the
//! quota backend, the user directory, the transactional ledger store and the
//! cluster peer relay.
//!
//! ## Interface & Extensibility
//! - Implement a trait to plug in a real transport (HTTP client, spool
//!   command, database) or a test double.
//! - All methods are async and return the crate's tagged [`EngineError`], so
//!   callers can branch on the fault kind.
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`, so consumers can generate
//!   deterministic mocks for unit/integration tests.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// One batch of pending print documents returned by the supplier on a poll.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct JobTicket {
    pub documents: Vec<Document>,
}

/// A pending print order. Transient - exists only for the duration of one
/// poll/process cycle.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Document {
    /// Supplier-assigned identifier.
    pub id: i64,
    /// Display name shown in the requester's document history.
    pub name: String,
    /// Free-text comment; in cluster deployments it carries the node tag.
    #[serde(default)]
    pub comment: String,
    /// Identity of the user who requested the print.
    pub requested_by: String,
    /// Print on both sides of the sheet.
    #[serde(default)]
    pub duplex: bool,
    /// Render in grayscale instead of color.
    #[serde(default)]
    pub grayscale: bool,
    /// Ordered physical parts of the order, each with its own page count and
    /// media format.
    pub parts: Vec<DocumentPart>,
    /// Page selection over the concatenated parts, e.g. `"4-5,16-"`.
    /// Blank selects everything.
    #[serde(default)]
    pub page_selection: String,
    pub billing: Vec<BillingEntry>,
}

/// One physical part of a document: a page count plus the media format those
/// pages must be printed on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DocumentPart {
    pub pages: u32,
    /// Physical media format, e.g. `"A4"`.
    pub media: String,
}

/// Who is charged for how many copies of a document. An empty string means
/// the field is absent.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BillingEntry {
    #[serde(default)]
    pub username: String,
    pub role: String,
    /// Group/class tag; required when the role implies group membership.
    #[serde(default)]
    pub group: String,
    pub copies: u32,
    #[serde(default)]
    pub extra: u32,
}

impl BillingEntry {
    pub fn total(&self) -> u32 {
        self.copies + self.extra
    }
}

/// The supplier's status vocabulary for terminal document outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentStatus {
    Completed,
    Cancelled,
    Error,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocumentStatus::Completed => "COMPLETED",
            DocumentStatus::Cancelled => "CANCELLED",
            DocumentStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Downloaded document content plus the checksum the supplier published for it.
#[derive(Debug, Clone)]
pub struct DownloadedContent {
    pub bytes: Vec<u8>,
    /// Hex-encoded SHA-256 of `bytes` as announced by the supplier.
    pub sha256: String,
}

impl DownloadedContent {
    /// Verify the content against the announced checksum.
    pub fn verify(&self) -> Result<()> {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        let actual = format!("{:x}", hasher.finalize());
        if actual.eq_ignore_ascii_case(&self.sha256) {
            Ok(())
        } else {
            Err(EngineError::Content(format!(
                "checksum mismatch: announced {}, computed {}",
                self.sha256, actual
            )))
        }
    }
}

/// Remote procedure interface to the external job supplier.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Supplier: Send + Sync {
    /// Fetch the batch of pending documents for one account.
    ///
    /// A rate-limit response surfaces as [`EngineError::RateLimited`] so the
    /// caller can skip the poll instead of treating it as a fault.
    async fn get_job_ticket(&self, account: &str) -> Result<JobTicket>;

    /// Download one document's content, with its integrity checksum.
    async fn download_document(&self, account: &str, document_id: i64) -> Result<DownloadedContent>;

    /// Report a terminal outcome. The supplier treats duplicates as no-ops.
    async fn report_document_status(
        &self,
        account: &str,
        document_id: i64,
        status: DocumentStatus,
        comment: &str,
    ) -> Result<()>;

    /// Close the connection for one account. Safe to call more than once.
    async fn close(&self, account: &str) -> Result<()>;
}

/// Options accompanying a backend submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOptions {
    pub media: String,
    pub duplex: bool,
    pub color: bool,
    pub copies: u32,
    pub collate: bool,
    /// Global page ranges (inclusive, 1-based) of the submitted content to
    /// actually print.
    pub page_ranges: Vec<(u32, u32)>,
}

/// One printer-submittable job: a content file on local disk plus options.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub printer: String,
    pub content_path: PathBuf,
    /// Backend-visible job name; the completion monitor resolves outcomes by
    /// this name, so it must round-trip through the backend unchanged.
    pub job_name: String,
    pub options: SubmitOptions,
}

/// Interface to the print backend (spooler).
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait PrintBackend: Send + Sync {
    /// Media formats the given printer is configured for.
    async fn printer_media(&self, printer: &str) -> Result<Vec<String>>;

    /// Write a monochrome rendition of `input` to `output`.
    async fn render_monochrome(&self, input: &std::path::Path, output: &std::path::Path)
        -> Result<()>;

    /// Submit a job. Returns the backend's identifier for it.
    async fn submit(&self, job: SubmitJob) -> Result<String>;
}

/// A user known to the quota backend.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QuotaUser {
    pub username: String,
    pub balance_cents: i64,
}

/// A terminal row from the quota backend's usage log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UsageRecord {
    /// The job name as submitted; matched against dispatch job prefixes.
    pub job_name: String,
    /// True when the backend printed the job, false when it rejected or
    /// cancelled it.
    pub completed: bool,
    pub pages: u32,
    pub at: DateTime<Utc>,
}

/// Interface to the quota backend: user lookup plus usage-log lookup by
/// encoded job-name prefix.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    async fn find_user(&self, username: &str) -> Result<Option<QuotaUser>>;

    async fn usage_log(&self, job_name_prefix: &str) -> Result<Vec<UsageRecord>>;
}

/// A user as known to the external directory.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DirectoryUser {
    pub username: String,
    pub display_name: String,
}

/// Directory collaborator used to lazily provision ledger accounts.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, username: &str) -> Result<Option<DirectoryUser>>;
}

/// Handle to one open store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub Uuid);

impl TxnId {
    pub fn new() -> Self {
        TxnId(Uuid::new_v4())
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference to a chargeable ledger account. Group accounts are auto-created
/// parent nodes; user accounts hang beneath their group where one is known.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccountRef {
    User(String),
    Group(String),
}

/// A user's ledger row.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserAccount {
    pub username: String,
    pub display_name: String,
    pub balance_cents: i64,
    /// Parent group node, where known.
    pub group: Option<String>,
}

/// Print mode chosen at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DispatchMode {
    /// Immediate submission; the backend (or quota system) manages cost.
    Auto,
    /// Deferred: the job waits for operator or user release and may expire.
    Hold,
}

/// Lifecycle of a dispatch record. Transitions are monotonic: a terminal
/// status is never replaced by a different one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DispatchStatus {
    Submitted,
    Held,
    PendingComplete,
    PendingCancel,
    Completed,
    Cancelled,
    Error,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Completed | DispatchStatus::Cancelled | DispatchStatus::Error
        )
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DispatchStatus::Submitted => "submitted",
            DispatchStatus::Held => "held",
            DispatchStatus::PendingComplete => "pending-complete",
            DispatchStatus::PendingCancel => "pending-cancel",
            DispatchStatus::Completed => "completed",
            DispatchStatus::Cancelled => "cancelled",
            DispatchStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Data needed to persist a new dispatch.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewDispatchRecord {
    pub account: String,
    pub document_id: i64,
    pub document_name: String,
    pub requested_by: String,
    pub mode: DispatchMode,
    pub printer: String,
    /// Common prefix of every backend job name submitted for this dispatch.
    pub job_prefix: String,
    /// Allocation captured at dispatch time, replayed by the completion
    /// monitor when transactions are deferred.
    pub allocation: crate::allocate::Allocation,
    pub cost_cents: i64,
    pub grayscale: bool,
    pub status: DispatchStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A persisted dispatch, as read back from the store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DispatchRecord {
    pub id: Uuid,
    pub account: String,
    pub document_id: i64,
    pub document_name: String,
    pub requested_by: String,
    pub mode: DispatchMode,
    pub printer: String,
    pub job_prefix: String,
    pub allocation: crate::allocate::Allocation,
    pub cost_cents: i64,
    pub grayscale: bool,
    pub status: DispatchStatus,
    pub reported: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A weighted ledger transaction. `weight / weight_unit` yields the fraction
/// of the dispatch cost this account carries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewLedgerTransaction {
    pub account: AccountRef,
    pub amount_cents: i64,
    pub weight: u32,
    pub weight_unit: u32,
    pub narrative: String,
    pub dispatch_id: Uuid,
}

/// One row of a user's document history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewDocumentLog {
    pub account: String,
    pub document_id: i64,
    pub document_name: String,
    pub username: String,
    pub status: DispatchStatus,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Transactional CRUD the engine requires from a persistence layer. No
/// schema or technology is prescribed - `store::MemoryLedger` is the
/// reference implementation of this contract.
///
/// Row locks taken with [`LedgerStore::lock_user`] are held until the
/// transaction commits or rolls back, so no concurrent dispatch for the same
/// user interleaves uncommitted state.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<TxnId>;

    async fn commit(&self, txn: TxnId) -> Result<()>;

    async fn rollback(&self, txn: TxnId) -> Result<()>;

    /// Take the exclusive row lock for one user and return the row.
    async fn lock_user(&self, txn: TxnId, username: &str) -> Result<UserAccount>;

    async fn find_user(&self, username: &str) -> Result<Option<UserAccount>>;

    /// Create the user's ledger row if it does not exist yet.
    async fn ensure_user(&self, username: &str, display_name: &str) -> Result<UserAccount>;

    /// Create the parent ledger node for a group if it does not exist yet.
    async fn ensure_group_account(&self, group: &str) -> Result<()>;

    async fn insert_dispatch(&self, txn: TxnId, record: NewDispatchRecord) -> Result<Uuid>;

    async fn insert_transactions(
        &self,
        txn: TxnId,
        transactions: Vec<NewLedgerTransaction>,
    ) -> Result<()>;

    /// Apply a status transition. Terminal states stick: the returned status
    /// is the effective one after the monotonicity rule.
    async fn update_dispatch_status(
        &self,
        txn: TxnId,
        dispatch: Uuid,
        status: DispatchStatus,
    ) -> Result<DispatchStatus>;

    async fn dispatches_with_status(
        &self,
        account: &str,
        status: DispatchStatus,
    ) -> Result<Vec<DispatchRecord>>;

    /// Terminal dispatches whose outcome has not reached the supplier yet.
    async fn unreported_terminal(&self, account: &str) -> Result<Vec<DispatchRecord>>;

    async fn mark_reported(&self, dispatch: Uuid) -> Result<()>;

    async fn append_document_log(&self, txn: TxnId, entry: NewDocumentLog) -> Result<()>;
}

/// Cluster proxy transport: stages documents for sibling nodes and reports
/// which siblings have been observed lately.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait PeerRelay: Send + Sync {
    /// Cache a downloaded document for retrieval by the tagged peer.
    async fn stage_document(
        &self,
        account: &str,
        node: &str,
        document_id: i64,
        content: &[u8],
    ) -> Result<()>;

    /// Drain heartbeats observed since the last call, newest last.
    fn observed_heartbeats(&self) -> Vec<(String, Instant)>;
}
