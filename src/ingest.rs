//! Order ingest surface (spec §6). New component — the teacher took orders
//! in through its Supabase realtime channel and job poller; this daemon
//! exposes a single `submit_order` entrypoint instead, called by the HTTP
//! webhook route in `api` (or directly by a poller, if one is ever wired
//! up). Validates, persists, fans out to one `PrintJob` per enabled
//! receipt variant, and either schedules directly or enqueues offline
//! depending on what the Connectivity Monitor currently reports.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::errors::{DaemonError, Result};
use crate::models::{Customer, Delivery, JobType, NotificationType, Order, OrderItem, OrderStatus, PrintJob};
use crate::notification::NotificationService;
use crate::offline_queue::OfflineQueue;
use crate::receipt;
use crate::store::Store;

#[derive(Debug, Clone, Deserialize)]
pub struct RawOrderItem {
    pub id: Option<String>,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub variant: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCustomer {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDelivery {
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub instructions: Option<String>,
}

/// The shape an e-commerce backend posts to the ingest surface. Fields
/// beyond what's modeled here are preserved verbatim in `Order::raw_payload`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOrder {
    pub external_order_id: Option<String>,
    pub items: Vec<RawOrderItem>,
    #[serde(default)]
    pub customer: RawCustomer,
    #[serde(default)]
    pub delivery: RawDelivery,
    pub total_amount: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct SubmissionResult {
    pub order_id: String,
    pub jobs_created: u32,
    pub mode: SubmissionMode,
}

pub struct OrderIngest {
    store: Store,
    offline_queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    notifications: Arc<NotificationService>,
    config: AppConfig,
    local_id_counter: AtomicU32,
}

impl OrderIngest {
    pub fn new(
        store: Store,
        offline_queue: Arc<OfflineQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        notifications: Arc<NotificationService>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            offline_queue,
            connectivity,
            notifications,
            config,
            local_id_counter: AtomicU32::new(0),
        }
    }

    /// spec §6: `submitOrder(rawPayload) -> {orderId, jobsCreated, mode}`.
    /// Rejects malformed input at the boundary; nothing invalid is ever
    /// persisted (spec §7, Validation error kind).
    pub async fn submit_order(&self, raw_payload: serde_json::Value) -> Result<SubmissionResult> {
        let raw: RawOrder = serde_json::from_value(raw_payload.clone())
            .map_err(|e| DaemonError::Validation(format!("malformed order payload: {e}")))?;

        let order = self.build_order(raw, raw_payload)?;
        order.validate().map_err(DaemonError::Validation)?;

        if let Some(existing) = self.store.find_order_by_external_id(&order.external_order_id).await? {
            warn!(external_order_id = %order.external_order_id, "duplicate external_order_id, no-op");
            let jobs_created = self.store.count_print_jobs_for_order(&existing.id).await?;
            return Ok(SubmissionResult {
                order_id: existing.id,
                jobs_created,
                mode: SubmissionMode::Online,
            });
        }

        self.store.save_order(order.clone()).await?;

        // `Unknown` means the monitor hasn't sampled yet (e.g. right after
        // startup) — treated as online rather than forcing every order into
        // the offline queue before the first probe completes.
        let internet_online = !matches!(
            self.connectivity.internet_state().await.status,
            crate::models::ConnectivityStatus::Offline
        );
        let mode = if internet_online {
            SubmissionMode::Online
        } else {
            SubmissionMode::Offline
        };

        let jobs = self.build_jobs(&order);
        if jobs.is_empty() {
            // No receipt variant is enabled, so there is no `PrintJob` to
            // recover — the order itself is the unit of recovery (spec §3:
            // `itemType ∈ {order, print_job}`).
            if mode == SubmissionMode::Offline {
                if let Err(e) = self
                    .offline_queue
                    .enqueue_order(&order.id, crate::models::QueuePriority::Normal)
                    .await
                {
                    warn!(error = %e, order_id = %order.id, "failed to enqueue offline order");
                }
            }
        }
        for job in &jobs {
            self.store.save_print_job(job.clone()).await?;
            if mode == SubmissionMode::Offline {
                let priority = job.job_type.offline_priority();
                if let Err(e) = self.offline_queue.enqueue_print_job(&job.id, priority).await {
                    self.notifications
                        .notify(
                            NotificationType::QueueOverflow,
                            serde_json::json!({ "job_id": job.id, "order_id": order.id }),
                        )
                        .await;
                    warn!(error = %e, job_id = %job.id, "failed to enqueue offline print job");
                }
            }
        }

        info!(order_id = %order.id, jobs = jobs.len(), ?mode, "order ingested");
        Ok(SubmissionResult {
            order_id: order.id,
            jobs_created: jobs.len() as u32,
            mode,
        })
    }

    fn build_order(&self, raw: RawOrder, raw_payload: serde_json::Value) -> Result<Order> {
        if raw.items.is_empty() {
            return Err(DaemonError::Validation("order must have at least one item".to_string()));
        }

        let items: Vec<OrderItem> = raw
            .items
            .into_iter()
            .map(|i| OrderItem {
                id: i.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: i.name,
                quantity: i.quantity,
                unit_price: i.unit_price,
                variant: i.variant,
                notes: i.notes,
            })
            .collect();

        let total_amount = raw.total_amount.unwrap_or_else(|| {
            items.iter().map(|i| i.unit_price * i.quantity as f64).sum()
        });

        let external_order_id = raw
            .external_order_id
            .unwrap_or_else(|| self.synthesize_local_order_id());

        Ok(Order {
            id: uuid::Uuid::new_v4().to_string(),
            external_order_id,
            status: OrderStatus::Pending,
            items,
            customer: Customer {
                name: raw.customer.name,
                email: raw.customer.email,
                phone: raw.customer.phone,
            },
            delivery: Delivery {
                address_line1: raw.delivery.address_line1,
                address_line2: raw.delivery.address_line2,
                city: raw.delivery.city,
                postal_code: raw.delivery.postal_code,
                instructions: raw.delivery.instructions,
            },
            total_amount,
            currency: raw.currency.unwrap_or_else(|| self.config.currency_code.clone()),
            created_at: chrono::Utc::now(),
            raw_payload,
        })
    }

    /// spec §6: "Offline-synthesized orderId format:
    /// `LOCAL_<YYYYMMDD_HHMMSS>_<4-digit counter>`".
    fn synthesize_local_order_id(&self) -> String {
        let counter = self.local_id_counter.fetch_add(1, Ordering::SeqCst) % 10_000;
        let now = chrono::Utc::now();
        format!("LOCAL_{}_{counter:04}", now.format("%Y%m%d_%H%M%S"))
    }

    fn build_jobs(&self, order: &Order) -> Vec<PrintJob> {
        let mut variants = Vec::new();
        if self.config.receipts.kitchen {
            variants.push(JobType::Kitchen);
        }
        if self.config.receipts.driver {
            variants.push(JobType::Service);
        }
        if self.config.receipts.customer {
            variants.push(JobType::Customer);
        }

        variants
            .into_iter()
            .map(|variant| {
                let content = receipt::format(order, variant, &self.config);
                PrintJob::new(order.id.clone(), variant, content)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::DummyAdapter;

    async fn ingest() -> OrderIngest {
        let store = Store::open_in_memory().await.unwrap();
        let offline_queue = Arc::new(OfflineQueue::new(store.clone()));
        let printer = Arc::new(DummyAdapter::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(printer, store.clone()));
        let notifications = Arc::new(NotificationService::new(store.clone()));
        OrderIngest::new(store, offline_queue, connectivity, notifications, AppConfig::default())
    }

    fn valid_payload() -> serde_json::Value {
        serde_json::json!({
            "external_order_id": "ext-1",
            "items": [
                {"name": "Nam Tok", "quantity": 3, "unit_price": 18.50},
                {"name": "Som Tam", "quantity": 2, "unit_price": 15.50},
            ],
            "customer": {"email": "guest@example.com"},
            "total_amount": 112.50,
            "currency": "CHF",
        })
    }

    #[tokio::test]
    async fn happy_path_creates_kitchen_and_customer_jobs() {
        let ingest = ingest().await;
        let result = ingest.submit_order(valid_payload()).await.unwrap();
        assert_eq!(result.jobs_created, 2);
        assert_eq!(result.mode, SubmissionMode::Online);
    }

    #[tokio::test]
    async fn missing_contact_is_rejected() {
        let ingest = ingest().await;
        let mut payload = valid_payload();
        payload["customer"] = serde_json::json!({});
        let result = ingest.submit_order(payload).await;
        assert!(matches!(result, Err(DaemonError::Validation(_))));
    }

    #[tokio::test]
    async fn empty_items_is_rejected() {
        let ingest = ingest().await;
        let mut payload = valid_payload();
        payload["items"] = serde_json::json!([]);
        let result = ingest.submit_order(payload).await;
        assert!(matches!(result, Err(DaemonError::Validation(_))));
    }

    #[tokio::test]
    async fn duplicate_external_order_id_is_a_no_op() {
        let ingest = ingest().await;
        let first = ingest.submit_order(valid_payload()).await.unwrap();
        let second = ingest.submit_order(valid_payload()).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
    }

    #[tokio::test]
    async fn missing_external_order_id_synthesizes_local_id() {
        let ingest = ingest().await;
        let mut payload = valid_payload();
        payload.as_object_mut().unwrap().remove("external_order_id");
        let result = ingest.submit_order(payload).await.unwrap();
        assert_eq!(result.jobs_created, 2);
    }

    #[tokio::test]
    async fn all_receipt_variants_disabled_offline_enqueues_the_order_itself() {
        let store = Store::open_in_memory().await.unwrap();
        let offline_queue = Arc::new(OfflineQueue::new(store.clone()));
        let printer = Arc::new(DummyAdapter::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(printer, store.clone()));
        let notifications = Arc::new(NotificationService::new(store.clone()));
        connectivity
            .force_internet_status(crate::models::ConnectivityStatus::Offline)
            .await;

        let mut config = AppConfig::default();
        config.receipts.kitchen = false;
        config.receipts.driver = false;
        config.receipts.customer = false;

        let ingest = OrderIngest::new(store, offline_queue.clone(), connectivity, notifications, config);
        let result = ingest.submit_order(valid_payload()).await.unwrap();

        assert_eq!(result.jobs_created, 0);
        assert_eq!(result.mode, SubmissionMode::Offline);
        let stats = offline_queue.statistics().await.unwrap();
        assert_eq!(stats.queued, 1);
    }
}
