use chrono::{Duration as ChronoDuration, Utc};
use printsync_core::allocate::Allocation;
use printsync_core::config::{ConnectionSettings, PrinterMap};
use printsync_core::contract::{
    DispatchMode, DispatchStatus, DocumentStatus, LedgerStore, MockQuotaBackend, MockSupplier,
    NewDispatchRecord, NewLedgerTransaction, UsageRecord,
};
use printsync_core::error::EngineError;
use printsync_core::monitor::{MaintenanceGate, Monitor};
use printsync_core::report::Reporter;
use printsync_core::store::MemoryLedger;
use uuid::Uuid;

fn connection() -> ConnectionSettings {
    ConnectionSettings {
        account: "acct".to_string(),
        endpoint: "https://supplier.example/rpc".to_string(),
        cluster: false,
        node_id: None,
        proxy_endpoint: None,
        printers: PrinterMap::default(),
        charge_to_students: true,
        hold_release: false,
        job_ticket: false,
    }
}

fn allocation_for_alice() -> Allocation {
    let mut allocation = Allocation::default();
    allocation.total = 2;
    allocation.user_copies.insert("alice".to_string(), 2);
    allocation
}

async fn seed_dispatch(
    store: &MemoryLedger,
    mode: DispatchMode,
    status: DispatchStatus,
    expires_at: Option<chrono::DateTime<Utc>>,
) -> Uuid {
    store.ensure_user("alice", "alice").await.unwrap();
    let txn = store.begin().await.unwrap();
    let id = store
        .insert_dispatch(
            txn,
            NewDispatchRecord {
                account: "acct".to_string(),
                document_id: 42,
                document_name: "worksheet".to_string(),
                requested_by: "alice".to_string(),
                mode,
                printer: "mono1".to_string(),
                job_prefix: "ps_acct_42".to_string(),
                allocation: allocation_for_alice(),
                cost_cents: 100,
                grayscale: true,
                status,
                created_at: Utc::now(),
                expires_at,
            },
        )
        .await
        .unwrap();
    store.commit(txn).await.unwrap();
    id
}

/// Seed a hold dispatch the way the dispatcher persists it: record plus the
/// immediate projected-cost transaction.
async fn seed_charged_hold(store: &MemoryLedger, status: DispatchStatus) -> Uuid {
    let id = seed_dispatch(
        store,
        DispatchMode::Hold,
        status,
        Some(Utc::now() + ChronoDuration::hours(4)),
    )
    .await;
    let txn = store.begin().await.unwrap();
    store
        .insert_transactions(
            txn,
            vec![NewLedgerTransaction {
                account: printsync_core::contract::AccountRef::User("alice".to_string()),
                amount_cents: -100,
                weight: 2,
                weight_unit: 2,
                narrative: "print worksheet".to_string(),
                dispatch_id: id,
            }],
        )
        .await
        .unwrap();
    store.commit(txn).await.unwrap();
    id
}

fn usage_row(job_name: &str, completed: bool) -> UsageRecord {
    UsageRecord {
        job_name: job_name.to_string(),
        completed,
        pages: 5,
        at: Utc::now(),
    }
}

fn reporting_supplier(expected: DocumentStatus, times: usize) -> MockSupplier {
    let mut supplier = MockSupplier::new();
    supplier
        .expect_report_document_status()
        .withf(move |account, document_id, status, _comment| {
            account == "acct" && *document_id == 42 && *status == expected
        })
        .times(times)
        .returning(|_, _, _, _| Ok(()));
    supplier
}

#[tokio::test]
async fn confirmed_auto_jobs_get_their_deferred_charge_and_report() {
    let store = MemoryLedger::new();
    let id = seed_dispatch(&store, DispatchMode::Auto, DispatchStatus::Submitted, None).await;

    let mut quota = MockQuotaBackend::new();
    quota
        .expect_usage_log()
        .returning(|_| Ok(vec![usage_row("ps_acct_42_c0", true)]));
    let supplier = reporting_supplier(DocumentStatus::Completed, 1);
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: true,
    };

    monitor.run(&connection()).await.unwrap();

    let record = store.dispatch(id).unwrap();
    assert_eq!(record.status, DispatchStatus::Completed);
    assert!(record.reported);
    assert_eq!(store.transactions().len(), 1, "the deferred charge is created now");
    assert_eq!(store.user_balance("alice"), Some(-100));
}

#[tokio::test]
async fn rejected_auto_jobs_are_cancelled_without_charge() {
    let store = MemoryLedger::new();
    let id = seed_dispatch(&store, DispatchMode::Auto, DispatchStatus::Submitted, None).await;

    let mut quota = MockQuotaBackend::new();
    quota
        .expect_usage_log()
        .returning(|_| Ok(vec![usage_row("ps_acct_42_c0", false)]));
    let supplier = reporting_supplier(DocumentStatus::Cancelled, 1);
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: true,
    };

    monitor.run(&connection()).await.unwrap();

    assert_eq!(store.dispatch(id).unwrap().status, DispatchStatus::Cancelled);
    assert!(
        store.transactions().is_empty(),
        "a job the backend rejected is never charged"
    );
}

#[tokio::test]
async fn ambiguous_usage_rows_are_skipped_as_warnings() {
    let store = MemoryLedger::new();
    let id = seed_dispatch(&store, DispatchMode::Auto, DispatchStatus::Submitted, None).await;

    let mut quota = MockQuotaBackend::new();
    quota.expect_usage_log().returning(|_| {
        Ok(vec![
            usage_row("ps_acct_42_c0", true),
            usage_row("ps_acct_42_c1", false),
        ])
    });
    let supplier = MockSupplier::new(); // any report would fail the test
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: true,
    };

    monitor.run(&connection()).await.unwrap();

    assert_eq!(
        store.dispatch(id).unwrap().status,
        DispatchStatus::Submitted,
        "ambiguous outcomes leave the dispatch open"
    );
    assert!(store.transactions().is_empty());
}

#[tokio::test]
async fn quota_connectivity_failure_aborts_only_the_sweep() {
    let store = MemoryLedger::new();
    let id = seed_dispatch(&store, DispatchMode::Auto, DispatchStatus::Submitted, None).await;

    let mut quota = MockQuotaBackend::new();
    quota
        .expect_usage_log()
        .returning(|_| Err(EngineError::Connectivity("quota backend down".to_string())));
    let supplier = MockSupplier::new();
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: true,
    };

    monitor
        .run(&connection())
        .await
        .expect("a sweep failure must not fail the poll cycle");
    assert_eq!(store.dispatch(id).unwrap().status, DispatchStatus::Submitted);
}

#[tokio::test]
async fn released_hold_jobs_complete_without_further_charge() {
    let store = MemoryLedger::new();
    let id = seed_charged_hold(&store, DispatchStatus::PendingComplete).await;

    let quota = MockQuotaBackend::new();
    let supplier = reporting_supplier(DocumentStatus::Completed, 1);
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: false,
    };

    monitor.run(&connection()).await.unwrap();

    assert_eq!(store.dispatch(id).unwrap().status, DispatchStatus::Completed);
    assert_eq!(
        store.user_balance("alice"),
        Some(-100),
        "hold jobs were charged at dispatch time; completion adds nothing"
    );
}

#[tokio::test]
async fn cancelled_hold_jobs_are_refunded() {
    let store = MemoryLedger::new();
    let id = seed_charged_hold(&store, DispatchStatus::PendingCancel).await;

    let quota = MockQuotaBackend::new();
    let supplier = reporting_supplier(DocumentStatus::Cancelled, 1);
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: false,
    };

    monitor.run(&connection()).await.unwrap();

    assert_eq!(store.dispatch(id).unwrap().status, DispatchStatus::Cancelled);
    assert_eq!(
        store.user_balance("alice"),
        Some(0),
        "the projected charge is reversed when the job never prints"
    );
}

#[tokio::test]
async fn expired_hold_jobs_are_abandoned() {
    let store = MemoryLedger::new();
    let id = seed_dispatch(
        &store,
        DispatchMode::Hold,
        DispatchStatus::Held,
        Some(Utc::now() - ChronoDuration::minutes(1)),
    )
    .await;

    let quota = MockQuotaBackend::new();
    let supplier = reporting_supplier(DocumentStatus::Cancelled, 1);
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: false,
    };

    monitor.run(&connection()).await.unwrap();
    assert_eq!(store.dispatch(id).unwrap().status, DispatchStatus::Cancelled);
}

/// Terminal statuses are monotonic: a second pass over the same outcome
/// changes nothing and reports nothing.
#[tokio::test]
async fn a_second_pass_over_a_terminal_outcome_is_a_no_op() {
    let store = MemoryLedger::new();
    let id = seed_dispatch(&store, DispatchMode::Auto, DispatchStatus::Submitted, None).await;

    let mut quota = MockQuotaBackend::new();
    quota
        .expect_usage_log()
        .returning(|_| Ok(vec![usage_row("ps_acct_42_c0", true)]));
    let supplier = reporting_supplier(DocumentStatus::Completed, 1);
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: true,
    };

    monitor.run(&connection()).await.unwrap();
    monitor.run(&connection()).await.unwrap();

    let record = store.dispatch(id).unwrap();
    assert_eq!(record.status, DispatchStatus::Completed);
    assert_eq!(
        store.transactions().len(),
        1,
        "the second pass must not charge again"
    );
}

#[tokio::test]
async fn failed_reports_are_retried_on_the_next_pass() {
    let store = MemoryLedger::new();
    let id = seed_dispatch(&store, DispatchMode::Auto, DispatchStatus::Submitted, None).await;

    let mut quota = MockQuotaBackend::new();
    quota
        .expect_usage_log()
        .returning(|_| Ok(vec![usage_row("ps_acct_42_c0", true)]));
    // The finalize report and the same cycle's retry pass both fail; the
    // retry on the next cycle succeeds.
    let mut supplier = MockSupplier::new();
    supplier
        .expect_report_document_status()
        .times(2)
        .returning(|_, _, _, _| Err(EngineError::Connectivity("supplier down".to_string())));
    supplier
        .expect_report_document_status()
        .times(1)
        .returning(|_, _, _, _| Ok(()));
    let gate = MaintenanceGate::new();
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: true,
    };

    monitor.run(&connection()).await.unwrap();
    let record = store.dispatch(id).unwrap();
    assert_eq!(record.status, DispatchStatus::Completed);
    assert!(!record.reported, "the failed report leaves the record unreported");

    monitor.run(&connection()).await.unwrap();
    let record = store.dispatch(id).unwrap();
    assert!(record.reported, "the retry pass delivers the report");
    assert_eq!(store.transactions().len(), 1, "still charged exactly once");
}

#[tokio::test(start_paused = true)]
async fn a_held_maintenance_gate_skips_the_sweeps() {
    let store = MemoryLedger::new();
    seed_dispatch(&store, DispatchMode::Auto, DispatchStatus::Submitted, None).await;

    let quota = MockQuotaBackend::new(); // any usage_log call would fail the test
    let supplier = MockSupplier::new();
    let gate = MaintenanceGate::new();
    let _maintenance = gate.suspend().await;
    let monitor = Monitor {
        store: &store,
        quota: &quota,
        reporter: Reporter {
            supplier: &supplier,
            store: &store,
        },
        gate: &gate,
        quota_active: true,
    };

    monitor
        .run(&connection())
        .await
        .expect("a held gate skips sweeps without failing the cycle");
}
