//! End-to-end scenarios spanning multiple wired-together components —
//! ingest, the print manager's poll loop, the offline queue, the circuit
//! breaker, and recovery — rather than duplicating the inline per-module
//! unit tests each component already carries.

use std::sync::Arc;

use resto_print_daemon::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use resto_print_daemon::config::AppConfig;
use resto_print_daemon::connectivity::ConnectivityMonitor;
use resto_print_daemon::ingest::OrderIngest;
use resto_print_daemon::models::{PrintJobStatus, RecoveryType};
use resto_print_daemon::notification::NotificationService;
use resto_print_daemon::offline_queue::OfflineQueue;
use resto_print_daemon::print_manager::PrintManager;
use resto_print_daemon::printer::DummyAdapter;
use resto_print_daemon::recovery::RecoveryManager;
use resto_print_daemon::store::Store;

fn valid_payload() -> serde_json::Value {
    serde_json::json!({
        "external_order_id": "ext-100",
        "items": [
            {"name": "Pad Thai", "quantity": 1, "unit_price": 14.0},
        ],
        "customer": {"email": "guest@example.com"},
    })
}

async fn harness() -> (
    Arc<PrintManager>,
    Arc<OrderIngest>,
    Arc<OfflineQueue>,
    Arc<DummyAdapter>,
    Arc<ConnectivityMonitor>,
    Store,
) {
    let store = Store::open_in_memory().await.unwrap();
    let adapter = Arc::new(DummyAdapter::new());
    let offline_queue = Arc::new(OfflineQueue::new(store.clone()));
    let notifications = Arc::new(NotificationService::new(store.clone()));
    let print_manager = Arc::new(PrintManager::new(
        store.clone(),
        adapter.clone(),
        offline_queue.clone(),
        notifications.clone(),
    ));
    let connectivity = Arc::new(ConnectivityMonitor::new(adapter.clone(), store.clone()));
    let ingest = Arc::new(OrderIngest::new(
        store.clone(),
        offline_queue.clone(),
        connectivity.clone(),
        notifications,
        AppConfig::default(),
    ));
    (print_manager, ingest, offline_queue, adapter, connectivity, store)
}

/// spec §8, scenario 1: submit an order while the printer is reachable,
/// one poll cycle prints both enabled receipt variants to completion.
#[tokio::test]
async fn happy_path_submit_then_print_completes_both_jobs() {
    let (print_manager, ingest, _offline_queue, _adapter, connectivity, store) = harness().await;
    connectivity.sample_printer().await;
    connectivity.sample_internet().await;

    let result = ingest.submit_order(valid_payload()).await.unwrap();
    assert_eq!(result.jobs_created, 2);

    print_manager.tick().await.unwrap();

    let jobs = store.count_print_jobs_for_order(&result.order_id).await.unwrap();
    assert_eq!(jobs, 2);
    let stats = print_manager.statistics().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.pending, 0);
}

/// spec §8, scenario 2: printer unreachable at submission time queues the
/// jobs offline instead of failing the submission.
#[tokio::test]
async fn printer_offline_at_submission_queues_jobs() {
    let (print_manager, ingest, offline_queue, adapter, connectivity, _store) = harness().await;
    adapter.set_online(false);
    connectivity.sample_printer().await;
    connectivity.sample_internet().await;

    let result = ingest.submit_order(valid_payload()).await.unwrap();
    assert_eq!(result.jobs_created, 2);

    print_manager.tick().await.unwrap();

    let stats = offline_queue.statistics().await.unwrap();
    assert_eq!(stats.queued, 2);
}

/// spec §8, scenario 5/§4.8: once the printer comes back online, the
/// Recovery Manager drains what the offline queue accumulated while it was
/// down, through the Print Manager's direct-print path.
#[tokio::test]
async fn recovery_drains_offline_queue_after_printer_returns() {
    let (print_manager, ingest, offline_queue, adapter, connectivity, store) = harness().await;
    adapter.set_online(false);
    connectivity.sample_printer().await;

    let result = ingest.submit_order(valid_payload()).await.unwrap();
    print_manager.tick().await.unwrap();
    assert_eq!(offline_queue.statistics().await.unwrap().queued, 2);

    adapter.set_online(true);
    let notifications = Arc::new(NotificationService::new(store.clone()));
    let recovery = Arc::new(RecoveryManager::new(
        store.clone(),
        offline_queue.clone(),
        adapter.clone(),
        print_manager.clone(),
        notifications,
    ));

    let session = recovery.trigger_manual(RecoveryType::Printer).await.unwrap();
    assert!(matches!(
        session.phase,
        resto_print_daemon::models::RecoveryPhase::Completion
            | resto_print_daemon::models::RecoveryPhase::Idle
    ));

    // give the spawned recovery task a moment to finish draining
    for _ in 0..20 {
        if offline_queue.statistics().await.unwrap().queued == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(offline_queue.statistics().await.unwrap().queued, 0);

    let jobs = store.count_print_jobs_for_order(&result.order_id).await.unwrap();
    assert_eq!(jobs, 2);
}

/// spec §8, scenario 4: a job that fails twice then succeeds ends
/// `completed` with `attempts==maxAttempts`; no dead-letter entry.
#[tokio::test]
async fn transient_failure_recovers_before_exhaustion_with_no_dead_letter() {
    let (print_manager, ingest, _offline_queue, adapter, connectivity, store) = harness().await;
    connectivity.sample_printer().await;
    connectivity.sample_internet().await;
    adapter.set_should_fail(true);

    let mut payload = valid_payload();
    payload["items"] = serde_json::json!([{"name": "Pad Thai", "quantity": 1, "unit_price": 14.0}]);
    let result = ingest.submit_order(payload).await.unwrap();

    print_manager.tick().await.unwrap();
    print_manager.tick().await.unwrap();
    adapter.set_should_fail(false);
    print_manager.tick().await.unwrap();

    let jobs = store.list_print_jobs_for_order(&result.order_id).await.unwrap();
    for job in &jobs {
        assert_eq!(job.status, PrintJobStatus::Completed);
        assert_eq!(job.attempts, 3);
        let entry = print_manager.retry_manager().dead_letter_queue().get(&job.id).await;
        assert!(entry.is_none());
    }
}

/// spec §4.5: the printer circuit breaker opens after enough consecutive
/// print failures and the registry reflects the same instance the print
/// manager actually executes through.
#[tokio::test]
async fn circuit_breaker_registry_shares_the_print_managers_breaker() {
    let store = Store::open_in_memory().await.unwrap();
    let adapter = Arc::new(DummyAdapter::new());
    adapter.set_should_fail(true);
    let offline_queue = Arc::new(OfflineQueue::new(store.clone()));
    let notifications = Arc::new(NotificationService::new(store.clone()));

    let registry = Arc::new(CircuitBreakerRegistry::new());
    let printer_breaker = registry
        .get_or_create("printer", CircuitBreakerConfig::PRINTER)
        .await;

    let print_manager = Arc::new(PrintManager::with_breaker(
        store.clone(),
        adapter.clone(),
        offline_queue.clone(),
        notifications,
        printer_breaker.clone(),
    ));

    let mut job = resto_print_daemon::models::PrintJob::new(
        "order-1",
        resto_print_daemon::models::JobType::Kitchen,
        b"ticket".to_vec(),
    );
    job.max_attempts = 10;
    store.save_print_job(job).await.unwrap();

    for _ in 0..6 {
        let _ = print_manager.tick().await;
    }

    let from_registry = registry.get("printer").await.unwrap();
    assert_eq!(
        from_registry.status().await.state,
        resto_print_daemon::models::CircuitState::Open
    );
    assert_eq!(print_manager.breaker().status().await.state, from_registry.status().await.state);
}
