use printsync_core::allocate::{allocate, build_transactions, Allocation};
use printsync_core::contract::{
    AccountRef, BillingEntry, DirectoryUser, LedgerStore, MockQuotaBackend, MockUserDirectory,
    QuotaUser,
};
use printsync_core::store::MemoryLedger;
use uuid::Uuid;

fn entry(username: &str, role: &str, group: &str, copies: u32, extra: u32) -> BillingEntry {
    BillingEntry {
        username: username.to_string(),
        role: role.to_string(),
        group: group.to_string(),
        copies,
        extra,
    }
}

fn no_directory() -> MockUserDirectory {
    let mut directory = MockUserDirectory::new();
    directory.expect_lookup().returning(|_| Ok(None));
    directory
}

fn no_quota() -> MockQuotaBackend {
    let mut quota = MockQuotaBackend::new();
    quota.expect_find_user().returning(|_| Ok(None));
    quota
}

async fn ledger_with_users(usernames: &[&str]) -> MemoryLedger {
    let store = MemoryLedger::new();
    for username in usernames {
        store
            .ensure_user(username, username)
            .await
            .expect("ensure_user should succeed");
    }
    store
}

#[tokio::test]
async fn students_of_one_class_accumulate_per_user_and_per_group() {
    let store = ledger_with_users(&["a", "b"]).await;
    let entries = vec![
        entry("a", "student", "X", 1, 2),
        entry("b", "student", "X", 2, 2),
    ];

    let allocation = allocate(&entries, true, false, &store, &no_directory(), &no_quota())
        .await
        .expect("allocation should succeed");

    assert_eq!(allocation.total, 7);
    assert_eq!(allocation.group_copies.get("X"), Some(&7));
    assert_eq!(allocation.user_copies.get("a"), Some(&3));
    assert_eq!(allocation.user_copies.get("b"), Some(&4));
    assert_eq!(allocation.user_group.get("a"), Some(&"X".to_string()));
    assert!(
        allocation.group_unattributed.is_empty(),
        "charged students leave nothing on the group account"
    );
}

#[tokio::test]
async fn uncharged_students_accumulate_on_the_group_account() {
    let store = ledger_with_users(&[]).await;
    let entries = vec![
        entry("a", "student", "X", 1, 2),
        entry("b", "student", "X", 2, 2),
    ];

    // charge_to_students off: student entries charge the class account, so
    // no user needs to exist in the ledger.
    let allocation = allocate(&entries, false, false, &store, &no_directory(), &no_quota())
        .await
        .expect("allocation should succeed");

    assert_eq!(allocation.total, 7);
    assert_eq!(allocation.group_unattributed.get("X"), Some(&7));
    assert!(allocation.user_copies.is_empty());
}

#[tokio::test]
async fn invalid_entries_are_skipped_not_fatal() {
    let store = ledger_with_users(&["t", "s"]).await;
    let entries = vec![
        entry("", "teacher", "", 1, 0),        // blank username
        entry("t", "", "", 1, 0),              // blank role
        entry("t", "janitor", "", 1, 0),       // unknown role
        entry("s", "student", "", 1, 0),       // group role without group
        entry("s", "student", "X", 0, 0),      // zero copies
        entry("t", "teacher", "", 2, 1),       // the only valid entry
    ];

    let allocation = allocate(&entries, true, false, &store, &no_directory(), &no_quota())
        .await
        .expect("allocation should succeed");

    assert_eq!(allocation.total, 3, "only the valid teacher entry counts");
    assert_eq!(allocation.user_copies.get("t"), Some(&3));
    assert!(
        allocation.group_copies.is_empty(),
        "a teacher entry carries no group"
    );
}

#[tokio::test]
async fn unknown_users_allocate_zero() {
    let store = ledger_with_users(&[]).await;
    let entries = vec![
        entry("ghost", "teacher", "", 3, 0),
        entry("phantom", "student", "X", 2, 0),
    ];

    let allocation = allocate(&entries, true, false, &store, &no_directory(), &no_quota())
        .await
        .expect("allocation should succeed");

    assert_eq!(
        allocation.total, 0,
        "entries for users missing in ledger and directory must be skipped"
    );
    assert!(allocation.user_copies.is_empty());
    assert!(allocation.group_copies.is_empty());
}

#[tokio::test]
async fn directory_lookup_provisions_missing_users() {
    let store = ledger_with_users(&[]).await;
    let mut directory = MockUserDirectory::new();
    directory.expect_lookup().returning(|username| {
        Ok(Some(DirectoryUser {
            username: username.to_string(),
            display_name: format!("User {username}"),
        }))
    });

    let entries = vec![entry("fresh", "teacher", "", 1, 0)];
    let allocation = allocate(&entries, false, false, &store, &directory, &no_quota())
        .await
        .expect("allocation should succeed");

    assert_eq!(allocation.total, 1);
    assert!(
        store.find_user("fresh").await.expect("lookup ok").is_some(),
        "the ledger row must be provisioned from the directory"
    );
}

#[tokio::test]
async fn quota_integration_requires_the_quota_backend_to_know_the_user() {
    let store = ledger_with_users(&["known", "missing"]).await;
    let mut quota = MockQuotaBackend::new();
    quota.expect_find_user().returning(|username| {
        Ok(if username == "known" {
            Some(QuotaUser {
                username: username.to_string(),
                balance_cents: 500,
            })
        } else {
            None
        })
    });

    let entries = vec![
        entry("known", "teacher", "", 1, 0),
        entry("missing", "teacher", "", 5, 0),
    ];
    let allocation = allocate(&entries, false, true, &store, &no_directory(), &quota)
        .await
        .expect("allocation should succeed");

    assert_eq!(allocation.total, 1, "quota-unknown users must be skipped");
    assert_eq!(allocation.user_copies.get("known"), Some(&1));
}

#[test]
fn transactions_are_weighted_by_copies_over_total() {
    let mut allocation = Allocation::default();
    allocation.total = 7;
    allocation.user_copies.insert("a".to_string(), 3);
    allocation.user_copies.insert("b".to_string(), 4);

    let dispatch_id = Uuid::new_v4();
    let transactions = build_transactions(&allocation, 700, "print test", dispatch_id);

    assert_eq!(transactions.len(), 2);
    let a = &transactions[0];
    assert_eq!(a.account, AccountRef::User("a".to_string()));
    assert_eq!(a.weight, 3);
    assert_eq!(a.weight_unit, 7);
    assert_eq!(a.amount_cents, -300, "3/7 of 700 cents, negated");
    let b = &transactions[1];
    assert_eq!(b.amount_cents, -400);
    assert_eq!(b.dispatch_id, dispatch_id);
}

#[test]
fn group_share_goes_to_the_group_account() {
    let mut allocation = Allocation::default();
    allocation.total = 4;
    allocation.user_copies.insert("t".to_string(), 1);
    allocation.group_unattributed.insert("X".to_string(), 3);

    let transactions = build_transactions(&allocation, 400, "print test", Uuid::new_v4());
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0].account, AccountRef::User("t".to_string()));
    assert_eq!(transactions[0].amount_cents, -100);
    assert_eq!(transactions[1].account, AccountRef::Group("X".to_string()));
    assert_eq!(transactions[1].amount_cents, -300);
}
