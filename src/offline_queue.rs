//! Offline Queue (spec §4.4). A thin coordinator over the Store's
//! persisted rows, generalizing the teacher's `queue.rs` priority/claim
//! logic (single `print_jobs` table) to the order+print_job item types and
//! expiry/urgency rules from original_source's `offline_queue.py`.

use crate::errors::{DaemonError, Result};
use crate::models::{ItemType, OfflineQueueItem, OfflineQueueStatus, QueuePriority};
use crate::store::Store;

pub const DEFAULT_MAX_QUEUE_SIZE: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryUrgency {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct QueueStatistics {
    pub queued: u64,
}

#[derive(Debug, Clone)]
pub struct RecoveryStatistics {
    pub oldest_queued_age_hours: Option<f64>,
    pub expiring_within_hour: u32,
    pub urgency: RecoveryUrgency,
}

pub struct OfflineQueue {
    store: Store,
    max_queue_size: u64,
}

impl OfflineQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }

    pub fn with_max_size(store: Store, max_queue_size: u64) -> Self {
        Self {
            store,
            max_queue_size,
        }
    }

    async fn enqueue(&self, item: OfflineQueueItem) -> Result<()> {
        if self.store.has_live_queue_item(item.item_type, &item.item_id).await? {
            return Ok(());
        }
        let size = self.store.queue_size().await?;
        if size >= self.max_queue_size {
            return Err(DaemonError::Queue(format!(
                "offline queue is full ({size}/{})",
                self.max_queue_size
            )));
        }
        self.store.enqueue_offline_item(item).await
    }

    pub async fn enqueue_order(&self, order_id: &str, priority: QueuePriority) -> Result<()> {
        self.enqueue(OfflineQueueItem::new(ItemType::Order, order_id, priority))
            .await
    }

    pub async fn enqueue_print_job(&self, job_id: &str, priority: QueuePriority) -> Result<()> {
        self.enqueue(OfflineQueueItem::new(ItemType::PrintJob, job_id, priority))
            .await
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<OfflineQueueItem>> {
        self.store.get_offline_item(id).await
    }

    /// Does NOT claim; priority desc, createdAt asc.
    pub async fn next_items(
        &self,
        item_type: Option<ItemType>,
        limit: u32,
    ) -> Result<Vec<OfflineQueueItem>> {
        self.store.next_offline_items(item_type, limit).await
    }

    /// One transaction; returns the count actually transitioned.
    pub async fn claim_batch(&self, ids: Vec<String>) -> Result<u32> {
        self.store.claim_batch(ids).await
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: OfflineQueueStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.store.update_offline_item_status(id, status, error).await
    }

    pub async fn increment_retry(&self, id: &str) -> Result<u32> {
        self.store.increment_offline_retry(id).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.remove_offline_item(id).await
    }

    pub async fn cleanup_expired(&self) -> Result<u32> {
        self.store.cleanup_expired_offline_items().await
    }

    pub async fn statistics(&self) -> Result<QueueStatistics> {
        Ok(QueueStatistics {
            queued: self.store.queue_size().await?,
        })
    }

    /// Urgency derived from age of oldest queued item plus items expiring
    /// within the next hour (original_source's `_calculate_recovery_urgency`,
    /// thresholds at 0/2/6/12 hours — none/low/medium/high/critical).
    pub async fn recovery_statistics(&self) -> Result<RecoveryStatistics> {
        let oldest = self.store.oldest_queued_offline_item().await?;
        let expiring_soon = self.store.count_offline_items_expiring_within(3600).await?;

        let age_hours = oldest
            .as_ref()
            .map(|item| (chrono::Utc::now() - item.created_at).num_seconds() as f64 / 3600.0);

        let urgency = match age_hours {
            None => RecoveryUrgency::None,
            Some(age) => {
                if expiring_soon > 0 || age > 12.0 {
                    RecoveryUrgency::Critical
                } else if age > 6.0 {
                    RecoveryUrgency::High
                } else if age > 2.0 {
                    RecoveryUrgency::Medium
                } else {
                    RecoveryUrgency::Low
                }
            }
        };

        Ok(RecoveryStatistics {
            oldest_queued_age_hours: age_hours,
            expiring_within_hour: expiring_soon,
            urgency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_rejects_when_full() {
        let store = Store::open_in_memory().await.unwrap();
        let queue = OfflineQueue::with_max_size(store, 1);
        queue.enqueue_print_job("job-1", QueuePriority::Normal).await.unwrap();
        let result = queue.enqueue_print_job("job-2", QueuePriority::Normal).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn recovery_urgency_escalates_with_age() {
        let store = Store::open_in_memory().await.unwrap();
        let queue = OfflineQueue::new(store);
        let stats = queue.recovery_statistics().await.unwrap();
        assert_eq!(stats.urgency, RecoveryUrgency::None);

        queue.enqueue_print_job("job-1", QueuePriority::Normal).await.unwrap();
        let stats = queue.recovery_statistics().await.unwrap();
        assert_eq!(stats.urgency, RecoveryUrgency::Low);
    }
}
