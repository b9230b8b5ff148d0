//! Cost allocation: turns a document's billing entries into validated
//! per-user and per-group copy sums plus weighted ledger-transaction
//! descriptors.
//!
//! Entries are processed in document order. Invalid entries are skipped with
//! a warning, never fatal; a document whose every entry is invalid allocates
//! zero copies, which the caller must treat as an accounting abort - no
//! print, no ledger effect.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::contract::{
    AccountRef, BillingEntry, LedgerStore, NewLedgerTransaction, QuotaBackend, UserDirectory,
};
use crate::error::Result;

/// Billing roles the allocator recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Staff,
}

impl Role {
    pub fn parse(role: &str) -> Option<Role> {
        match role.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }

    /// Individual roles are always charged to their own account.
    pub fn is_individual(&self) -> bool {
        matches!(self, Role::Teacher | Role::Staff)
    }

    /// Group roles must carry a group tag on every billing entry.
    pub fn is_grouped(&self) -> bool {
        matches!(self, Role::Student)
    }
}

/// Validated allocation for one document.
///
/// `total` always equals the sum of `user_copies` plus the sum of
/// `group_unattributed` - every valid copy is charged exactly once.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Allocation {
    /// Total valid copies across all entries.
    pub total: u32,
    /// Copies per group tag, individually charged or not.
    pub group_copies: BTreeMap<String, u32>,
    /// Copies charged to individual user accounts.
    pub user_copies: BTreeMap<String, u32>,
    /// Group membership of individually charged group-role users.
    pub user_group: BTreeMap<String, String>,
    /// Copies charged to the group account because no individual carries them.
    pub group_unattributed: BTreeMap<String, u32>,
}

/// Compute the allocation for one document's billing entries.
///
/// `charge_to_students` switches group-role entries from the shared group
/// account to the member's own account. Charged users must exist in the
/// ledger (lazily provisioned from the directory) and, when
/// `quota_active`, in the quota backend too - entries failing that are
/// skipped like any other invalid entry.
pub async fn allocate(
    entries: &[BillingEntry],
    charge_to_students: bool,
    quota_active: bool,
    store: &dyn LedgerStore,
    directory: &dyn UserDirectory,
    quota: &dyn QuotaBackend,
) -> Result<Allocation> {
    let mut allocation = Allocation::default();

    for entry in entries {
        let username = entry.username.trim();
        if username.is_empty() {
            warn!(role = %entry.role, "skipping billing entry without username");
            continue;
        }
        let Some(role) = Role::parse(&entry.role) else {
            warn!(username, role = %entry.role, "skipping billing entry with unknown role");
            continue;
        };
        let group = entry.group.trim();
        if role.is_grouped() && group.is_empty() {
            warn!(username, "skipping group-role billing entry without group tag");
            continue;
        }

        let charge_to_user = role.is_individual() || charge_to_students;
        if charge_to_user && !user_is_chargeable(username, quota_active, store, directory, quota).await? {
            continue;
        }

        let n = entry.total();
        if n == 0 {
            debug!(username, "billing entry with zero copies, skipping");
            continue;
        }

        allocation.total += n;
        if charge_to_user {
            *allocation.user_copies.entry(username.to_string()).or_default() += n;
            if !group.is_empty() {
                allocation
                    .user_group
                    .insert(username.to_string(), group.to_string());
            }
        } else {
            *allocation
                .group_unattributed
                .entry(group.to_string())
                .or_default() += n;
        }
        if !group.is_empty() {
            *allocation.group_copies.entry(group.to_string()).or_default() += n;
        }
    }

    Ok(allocation)
}

/// An individually charged user must have a ledger row (provisioned from the
/// directory on first sight) and, when quota integration is active, be known
/// to the quota backend.
async fn user_is_chargeable(
    username: &str,
    quota_active: bool,
    store: &dyn LedgerStore,
    directory: &dyn UserDirectory,
    quota: &dyn QuotaBackend,
) -> Result<bool> {
    if store.find_user(username).await?.is_none() {
        match directory.lookup(username).await? {
            Some(user) => {
                store.ensure_user(&user.username, &user.display_name).await?;
                debug!(username, "provisioned ledger row from directory");
            }
            None => {
                warn!(username, "skipping billing entry for unknown user");
                return Ok(false);
            }
        }
    }
    if quota_active && quota.find_user(username).await?.is_none() {
        warn!(username, "skipping billing entry: user missing in quota backend");
        return Ok(false);
    }
    Ok(true)
}

/// Build the weighted ledger transactions for one dispatch: one against each
/// charged user account and one against the group account for every copy not
/// attributable to an individual. Each weight is that entity's copies, the
/// weight unit is the document's total, so `weight / weight_unit` yields the
/// per-copy cost share.
pub fn build_transactions(
    allocation: &Allocation,
    cost_cents: i64,
    narrative: &str,
    dispatch_id: Uuid,
) -> Vec<NewLedgerTransaction> {
    let unit = allocation.total.max(1);
    let share = |weight: u32| -(cost_cents * i64::from(weight)) / i64::from(unit);

    let mut transactions = Vec::new();
    for (username, &copies) in &allocation.user_copies {
        transactions.push(NewLedgerTransaction {
            account: AccountRef::User(username.clone()),
            amount_cents: share(copies),
            weight: copies,
            weight_unit: unit,
            narrative: narrative.to_string(),
            dispatch_id,
        });
    }
    for (group, &copies) in &allocation.group_unattributed {
        transactions.push(NewLedgerTransaction {
            account: AccountRef::Group(group.clone()),
            amount_cents: share(copies),
            weight: copies,
            weight_unit: unit,
            narrative: narrative.to_string(),
            dispatch_id,
        });
    }
    transactions
}
