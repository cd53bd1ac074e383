//! Print Manager (spec §4.2) — the orchestrator. Generalizes the teacher's
//! `start_job_processor` background loop (main.rs) into a dedicated
//! cooperative worker: a single dispatch task with an explicit stop signal
//! and a bounded shutdown grace period (spec §4.2, §5), wired to the
//! Circuit Breaker and the Offline Queue rather than printing straight
//! through the adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::errors::{DaemonError, Result};
use crate::models::{NotificationType, PrintJob, PrintJobStatus, RetryAttemptRecord};
use crate::notification::NotificationService;
use crate::offline_queue::OfflineQueue;
use crate::printer::PrinterAdapter;
use crate::retry::{classify_failure, RetryManager};
use crate::store::Store;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const OFFLINE_DRAIN_BATCH: u32 = 5;
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PrintStatistics {
    pub pending: u64,
    pub printing: u64,
    pub completed: u64,
    pub failed: u64,
    pub queued_offline: u64,
}

/// The direct-print path recovery dispatches through (spec §4.8 step 2:
/// "call Print Manager's direct-print path"). Separate from the
/// background-loop bookkeeping (attempts/status transitions), which the
/// caller — the background loop itself, or the Recovery Manager — owns.
#[async_trait::async_trait]
pub trait JobPrinter: Send + Sync {
    async fn print_job_direct(&self, job: &PrintJob) -> Result<()>;
}

pub struct PrintManager {
    store: Store,
    printer: Arc<dyn PrinterAdapter>,
    offline_queue: Arc<OfflineQueue>,
    breaker: Arc<CircuitBreaker>,
    notifications: Arc<NotificationService>,
    retry_manager: Arc<RetryManager>,
    poll_interval: Duration,
    running: AtomicBool,
    stop_flag: Arc<AtomicBool>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PrintManager {
    pub fn new(
        store: Store,
        printer: Arc<dyn PrinterAdapter>,
        offline_queue: Arc<OfflineQueue>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self::with_breaker(
            store,
            printer,
            offline_queue,
            notifications,
            Arc::new(CircuitBreaker::new("printer", CircuitBreakerConfig::PRINTER)),
        )
    }

    /// Shares a breaker instance the caller already registered elsewhere
    /// (e.g. the process-wide `CircuitBreakerRegistry` in `main`) rather than
    /// holding a private one the operator surface's `/circuit/printer`
    /// endpoint could never see.
    pub fn with_breaker(
        store: Store,
        printer: Arc<dyn PrinterAdapter>,
        offline_queue: Arc<OfflineQueue>,
        notifications: Arc<NotificationService>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            retry_manager: Arc::new(RetryManager::new(store.clone())),
            store,
            printer,
            offline_queue,
            breaker,
            notifications,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: AtomicBool::new(false),
            stop_flag: Arc::new(AtomicBool::new(false)),
            loop_handle: Mutex::new(None),
        }
    }

    /// Dead-letter/attempt-audit view for the operator surface (spec §4.6).
    pub fn retry_manager(&self) -> Arc<RetryManager> {
        self.retry_manager.clone()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    /// Idempotent after `stop()` — a second `start()` call restarts the loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.loop_handle.lock().await = Some(handle);
        info!("print manager started");
    }

    /// Drains cleanly within a bounded grace period (spec §4.2: "stop drains
    /// cleanly with bounded grace period (<=10s)").
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE_PERIOD, handle).await.is_err() {
                warn!("print manager did not stop within the grace period");
            }
        }
        info!("print manager stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "print manager tick failed");
            }
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    pub async fn tick(&self) -> Result<()> {
        if !self.ensure_printer_ready().await {
            self.handle_printer_offline().await?;
            return Ok(());
        }

        let jobs = self.store.get_pending_print_jobs().await?;
        for job in jobs {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            self.process_one(job).await?;
        }

        self.drain_offline_once().await?;
        Ok(())
    }

    /// spec §4.2 step 2: attempt a connect if not already connected; ready
    /// iff the adapter reports `status()==online` afterward.
    async fn ensure_printer_ready(&self) -> bool {
        if self.printer.connect().await.unwrap_or(false) {
            matches!(
                self.printer.status().await,
                Ok(crate::printer::PrinterStatus::Online)
            )
        } else {
            false
        }
    }

    /// Moves every currently-pending job into the Offline Queue, priority
    /// derived from job type (spec §4.2 step 2).
    async fn handle_printer_offline(&self) -> Result<()> {
        let jobs = self.store.get_pending_print_jobs().await?;
        for job in jobs {
            let priority = job.job_type.offline_priority();
            match self.offline_queue.enqueue_print_job(&job.id, priority).await {
                Ok(()) => {}
                Err(DaemonError::Queue(_)) => {
                    self.notifications
                        .notify(
                            NotificationType::QueueOverflow,
                            serde_json::json!({ "job_id": job.id }),
                        )
                        .await;
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to enqueue offline job"),
            }
        }
        self.notifications
            .notify(NotificationType::PrinterOffline, serde_json::Value::Null)
            .await;
        Ok(())
    }

    async fn process_one(&self, mut job: PrintJob) -> Result<()> {
        job.status = PrintJobStatus::Printing;
        job.attempts += 1;
        job.updated_at = chrono::Utc::now();
        self.store.save_print_job(job.clone()).await?;

        let started = std::time::Instant::now();
        let content = job.content.clone();
        let result = self
            .breaker
            .execute(|| async { self.printer.print_receipt(&content).await })
            .await;

        match result {
            Ok(true) => {
                job.status = PrintJobStatus::Completed;
                job.printed_at = Some(chrono::Utc::now());
                job.error_message = None;
            }
            Ok(false) => {
                self.record_failure(&mut job, "printer reported failure".to_string(), started, &DaemonError::Printer("printer reported failure".to_string()))
                    .await;
            }
            Err(e) => {
                let error_string = e.to_string();
                self.record_failure(&mut job, error_string, started, &e).await;
            }
        }
        job.updated_at = chrono::Utc::now();
        self.store.save_print_job(job).await
    }

    /// Persists the failed attempt via the Retry Manager (spec §4.6: "each
    /// attempt is persisted") and, on the attempt that exhausts the job's
    /// budget, dead-letters the task and raises a `SystemError` notification
    /// (spec §3: "exhaustion -> Retry Manager dead-letter -> Notification
    /// Service alert").
    async fn record_failure(
        &self,
        job: &mut PrintJob,
        error: String,
        started: std::time::Instant,
        raw_error: &DaemonError,
    ) {
        job.error_message = Some(error.clone());
        let exhausted = job.attempts >= job.max_attempts;
        job.status = if exhausted {
            PrintJobStatus::Failed
        } else {
            PrintJobStatus::Pending
        };

        let record = RetryAttemptRecord {
            attempt_number: job.attempts,
            timestamp: chrono::Utc::now(),
            delay_before_secs: 0.0,
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(error.clone()),
        };
        self.retry_manager
            .record_attempt(&job.id, classify_failure(raw_error), record, exhausted)
            .await;

        if exhausted {
            self.notifications
                .notify(
                    NotificationType::SystemError,
                    serde_json::json!({
                        "job_id": job.id,
                        "order_id": job.order_id,
                        "reason": "print job exhausted its retry budget",
                        "error": error,
                    }),
                )
                .await;
        }
    }

    /// Opportunistic per-cycle drain of a small offline batch once the
    /// printer is ready (spec §4.2 step 4) — distinct from the Recovery
    /// Manager's bulk, phase-tracked drain on reconnect (spec §4.8).
    async fn drain_offline_once(&self) -> Result<()> {
        let candidates = self
            .offline_queue
            .next_items(Some(crate::models::ItemType::PrintJob), OFFLINE_DRAIN_BATCH)
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        self.offline_queue.claim_batch(ids).await?;

        for item in candidates {
            let Some(mut job) = self.store.get_print_job(&item.item_id).await? else {
                self.offline_queue.remove(&item.id).await?;
                continue;
            };
            if job.status == PrintJobStatus::Completed {
                self.offline_queue.remove(&item.id).await?;
                continue;
            }
            match self.print_job_direct(&job).await {
                Ok(()) => {
                    job.status = PrintJobStatus::Completed;
                    job.printed_at = Some(chrono::Utc::now());
                    job.updated_at = chrono::Utc::now();
                    self.store.save_print_job(job).await?;
                    self.offline_queue.remove(&item.id).await?;
                }
                Err(e) => {
                    if item.retry_count + 1 >= item.max_retries {
                        self.offline_queue
                            .update_status(&item.id, crate::models::OfflineQueueStatus::Failed, Some(e.to_string()))
                            .await?;
                    } else {
                        self.offline_queue.increment_retry(&item.id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// spec §4.2: `processJobImmediately` — manual, one-shot; honors the
    /// same gate and breaker as the background loop.
    pub async fn process_job_immediately(&self, job_id: &str) -> Result<bool> {
        let Some(job) = self.store.get_print_job(job_id).await? else {
            return Err(DaemonError::NotFound(format!("print job '{job_id}' not found")));
        };
        if job.status == PrintJobStatus::Completed {
            return Ok(true);
        }
        if !self.ensure_printer_ready().await {
            return Ok(false);
        }
        let mut job = job;
        job.attempts += 1;
        job.status = PrintJobStatus::Printing;
        self.store.save_print_job(job.clone()).await?;

        let started = std::time::Instant::now();
        match self.print_job_direct(&job).await {
            Ok(()) => {
                job.status = PrintJobStatus::Completed;
                job.printed_at = Some(chrono::Utc::now());
                job.error_message = None;
                self.store.save_print_job(job).await?;
                Ok(true)
            }
            Err(e) => {
                let error_string = e.to_string();
                self.record_failure(&mut job, error_string, started, &e).await;
                self.store.save_print_job(job).await?;
                Ok(false)
            }
        }
    }

    /// spec §4.2: resets every `status=failed` job to pending, clearing
    /// attempts/error. Returns the count reset.
    pub async fn retry_failed_jobs(&self) -> Result<u32> {
        self.store.reset_failed_print_jobs().await
    }

    /// Resets a single job back to pending — the dead-letter requeue
    /// primitive's counterpart on the print-job row itself (spec §4.6).
    pub async fn requeue_job(&self, job_id: &str) -> Result<()> {
        let Some(mut job) = self.store.get_print_job(job_id).await? else {
            return Err(DaemonError::NotFound(format!("print job '{job_id}' not found")));
        };
        job.status = PrintJobStatus::Pending;
        job.attempts = 0;
        job.error_message = None;
        job.updated_at = chrono::Utc::now();
        self.store.save_print_job(job).await
    }

    pub async fn statistics(&self) -> Result<PrintStatistics> {
        Ok(PrintStatistics {
            pending: self.store.count_print_jobs_by_status(PrintJobStatus::Pending).await?,
            printing: self.store.count_print_jobs_by_status(PrintJobStatus::Printing).await?,
            completed: self.store.count_print_jobs_by_status(PrintJobStatus::Completed).await?,
            failed: self.store.count_print_jobs_by_status(PrintJobStatus::Failed).await?,
            queued_offline: self.offline_queue.statistics().await?.queued,
        })
    }
}

#[async_trait::async_trait]
impl JobPrinter for PrintManager {
    async fn print_job_direct(&self, job: &PrintJob) -> Result<()> {
        let content = job.content.clone();
        match self
            .breaker
            .execute(|| async { self.printer.print_receipt(&content).await })
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(DaemonError::Printer("printer reported failure".to_string())),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobType;
    use crate::printer::DummyAdapter;

    async fn manager_with(
        adapter: Arc<DummyAdapter>,
    ) -> (Arc<PrintManager>, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let offline_queue = Arc::new(OfflineQueue::new(store.clone()));
        let notifications = Arc::new(NotificationService::new(store.clone()));
        let manager = Arc::new(PrintManager::new(store.clone(), adapter, offline_queue, notifications));
        (manager, store)
    }

    #[tokio::test]
    async fn happy_path_prints_pending_job_and_marks_completed() {
        let adapter = Arc::new(DummyAdapter::new());
        let (manager, store) = manager_with(adapter).await;

        let job = PrintJob::new("order-1", JobType::Kitchen, b"ticket".to_vec());
        let job_id = job.id.clone();
        store.save_print_job(job).await.unwrap();

        manager.tick().await.unwrap();

        let job = store.get_print_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, PrintJobStatus::Completed);
        assert!(job.printed_at.is_some());
    }

    #[tokio::test]
    async fn transient_failures_exhaust_into_completed_at_max_attempts() {
        let adapter = Arc::new(DummyAdapter::new());
        adapter.set_should_fail(true);
        let (manager, store) = manager_with(adapter.clone()).await;

        let mut job = PrintJob::new("order-1", JobType::Kitchen, b"ticket".to_vec());
        job.max_attempts = 3;
        let job_id = job.id.clone();
        store.save_print_job(job).await.unwrap();

        manager.tick().await.unwrap();
        manager.tick().await.unwrap();
        adapter.set_should_fail(false);
        manager.tick().await.unwrap();

        let job = store.get_print_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, PrintJobStatus::Completed);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn printer_offline_moves_pending_jobs_to_queue_with_priority() {
        let adapter = Arc::new(DummyAdapter::new());
        adapter.set_online(false);
        let (manager, store) = manager_with(adapter).await;

        let kitchen = PrintJob::new("order-1", JobType::Kitchen, b"k".to_vec());
        let customer = PrintJob::new("order-1", JobType::Customer, b"c".to_vec());
        store.save_print_job(kitchen).await.unwrap();
        store.save_print_job(customer).await.unwrap();

        manager.tick().await.unwrap();

        let stats = manager.statistics().await.unwrap();
        assert_eq!(stats.queued_offline, 2);
    }

    #[tokio::test]
    async fn process_job_immediately_is_idempotent_on_completed_job() {
        let adapter = Arc::new(DummyAdapter::new());
        let (manager, store) = manager_with(adapter).await;

        let mut job = PrintJob::new("order-1", JobType::Kitchen, b"k".to_vec());
        job.status = PrintJobStatus::Completed;
        job.printed_at = Some(chrono::Utc::now());
        let job_id = job.id.clone();
        store.save_print_job(job).await.unwrap();

        let result = manager.process_job_immediately(&job_id).await.unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn retry_failed_jobs_resets_status_and_attempts() {
        let adapter = Arc::new(DummyAdapter::new());
        let (manager, store) = manager_with(adapter).await;

        let mut job = PrintJob::new("order-1", JobType::Kitchen, b"k".to_vec());
        job.status = PrintJobStatus::Failed;
        job.attempts = 3;
        job.error_message = Some("boom".to_string());
        let job_id = job.id.clone();
        store.save_print_job(job).await.unwrap();

        let count = manager.retry_failed_jobs().await.unwrap();
        assert_eq!(count, 1);

        let job = store.get_print_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, PrintJobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn exhausted_job_lands_in_dead_letter_queue() {
        let adapter = Arc::new(DummyAdapter::new());
        adapter.set_should_fail(true);
        let (manager, store) = manager_with(adapter).await;

        let mut job = PrintJob::new("order-1", JobType::Kitchen, b"ticket".to_vec());
        job.max_attempts = 2;
        let job_id = job.id.clone();
        store.save_print_job(job).await.unwrap();

        manager.tick().await.unwrap();
        manager.tick().await.unwrap();

        let job = store.get_print_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, PrintJobStatus::Failed);

        let entry = manager.retry_manager().dead_letter_queue().get(&job_id).await;
        assert!(entry.is_some());
    }

    #[tokio::test]
    async fn requeue_job_resets_a_single_job() {
        let adapter = Arc::new(DummyAdapter::new());
        let (manager, store) = manager_with(adapter).await;

        let mut job = PrintJob::new("order-1", JobType::Kitchen, b"k".to_vec());
        job.status = PrintJobStatus::Failed;
        job.attempts = 2;
        job.error_message = Some("boom".to_string());
        let job_id = job.id.clone();
        store.save_print_job(job).await.unwrap();

        manager.requeue_job(&job_id).await.unwrap();

        let job = store.get_print_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, PrintJobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }
}
