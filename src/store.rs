//! Transactional persistence for every entity in the data model (spec §3,
//! §6). Generalizes the teacher's single-table `queue.rs` wrapper — an
//! `Arc`-shared `tokio_rusqlite::Connection` driven through `conn.call`
//! closures — into the full schema. The Store is the serialization point
//! for every cross-component invariant: claims, status flips, and queue
//! deletes that must commit together live in one `conn.call` transaction.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;

use crate::errors::{DaemonError, Result};
use crate::models::*;

const SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

fn ts(v: DateTime<Utc>) -> i64 {
    v.timestamp_millis()
}

fn from_ts(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(v).unwrap_or_else(Utc::now)
}

fn opt_ts(v: Option<DateTime<Utc>>) -> Option<i64> {
    v.map(ts)
}

fn json_to_string(v: &serde_json::Value) -> String {
    v.to_string()
}

fn string_to_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DaemonError::Config(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)
            .await
            .map_err(|e| DaemonError::Store(format!("cannot open database: {e}")))?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open(":memory:")
            .await
            .map_err(|e| DaemonError::Store(format!("cannot open in-memory database: {e}")))?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    /// Forward-only migrations: each version is an idempotent `CREATE TABLE
    /// IF NOT EXISTS` batch, recorded transactionally in `schema_migrations`
    /// alongside its description (spec §6).
    async fn migrate(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS schema_migrations (
                        version INTEGER PRIMARY KEY,
                        description TEXT NOT NULL,
                        applied_at INTEGER NOT NULL
                    );",
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("migration bootstrap failed: {e}")))?;

        let applied: Vec<i64> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, i64>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("reading migration history failed: {e}")))?;

        if applied.contains(&SCHEMA_VERSION) {
            return Ok(());
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute_batch(MIGRATION_V1)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                    params![SCHEMA_VERSION, "initial schema", Utc::now().timestamp_millis()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("applying migration v{SCHEMA_VERSION} failed: {e}")))?;

        Ok(())
    }

    // ---- orders ----------------------------------------------------

    pub async fn save_order(&self, order: Order) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO orders (id, external_order_id, status, items_blob, customer_blob,
                        delivery_blob, total_amount, currency, created_at, raw_blob)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                        status=excluded.status, items_blob=excluded.items_blob,
                        customer_blob=excluded.customer_blob, delivery_blob=excluded.delivery_blob,
                        total_amount=excluded.total_amount, currency=excluded.currency,
                        raw_blob=excluded.raw_blob",
                    params![
                        order.id,
                        order.external_order_id,
                        status_to_str(order.status),
                        json_to_string(&serde_json::to_value(&order.items).unwrap_or_default()),
                        json_to_string(&serde_json::to_value(&order.customer).unwrap_or_default()),
                        json_to_string(&serde_json::to_value(&order.delivery).unwrap_or_default()),
                        order.total_amount,
                        order.currency,
                        ts(order.created_at),
                        json_to_string(&order.raw_payload),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("save_order failed: {e}")))
    }

    pub async fn find_order_by_external_id(&self, external_id: &str) -> Result<Option<Order>> {
        let external_id = external_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, external_order_id, status, items_blob, customer_blob,
                        delivery_blob, total_amount, currency, created_at, raw_blob
                     FROM orders WHERE external_order_id = ?1",
                    params![external_id],
                    row_to_order,
                )
                .optional()
            })
            .await
            .map_err(|e| DaemonError::Store(format!("find_order_by_external_id failed: {e}")))
    }

    pub async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, external_order_id, status, items_blob, customer_blob,
                        delivery_blob, total_amount, currency, created_at, raw_blob
                     FROM orders WHERE id = ?1",
                    params![id],
                    row_to_order,
                )
                .optional()
            })
            .await
            .map_err(|e| DaemonError::Store(format!("get_order failed: {e}")))
    }

    // ---- print jobs --------------------------------------------------

    pub async fn save_print_job(&self, job: PrintJob) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO print_jobs (id, order_id, job_type, status, content_blob,
                        attempts, max_attempts, created_at, updated_at, printed_at, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(id) DO UPDATE SET
                        status=excluded.status, attempts=excluded.attempts,
                        updated_at=excluded.updated_at, printed_at=excluded.printed_at,
                        error_message=excluded.error_message",
                    params![
                        job.id,
                        job.order_id,
                        job_type_to_str(job.job_type),
                        print_status_to_str(job.status),
                        job.content,
                        job.attempts,
                        job.max_attempts,
                        ts(job.created_at),
                        ts(job.updated_at),
                        opt_ts(job.printed_at),
                        job.error_message,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("save_print_job failed: {e}")))
    }

    pub async fn get_print_job(&self, id: &str) -> Result<Option<PrintJob>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, order_id, job_type, status, content_blob, attempts, max_attempts,
                        created_at, updated_at, printed_at, error_message
                     FROM print_jobs WHERE id = ?1",
                    params![id],
                    row_to_print_job,
                )
                .optional()
            })
            .await
            .map_err(|e| DaemonError::Store(format!("get_print_job failed: {e}")))
    }

    /// spec §4.1: jobs with status=pending AND attempts<maxAttempts, ordered
    /// by createdAt ascending.
    pub async fn get_pending_print_jobs(&self) -> Result<Vec<PrintJob>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, job_type, status, content_blob, attempts, max_attempts,
                        created_at, updated_at, printed_at, error_message
                     FROM print_jobs WHERE status = 'pending' AND attempts < max_attempts
                     ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map([], row_to_print_job)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("get_pending_print_jobs failed: {e}")))
    }

    pub async fn get_failed_print_jobs(&self) -> Result<Vec<PrintJob>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, job_type, status, content_blob, attempts, max_attempts,
                        created_at, updated_at, printed_at, error_message
                     FROM print_jobs WHERE status = 'failed' ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map([], row_to_print_job)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("get_failed_print_jobs failed: {e}")))
    }

    /// spec §4.2 `retryFailedJobs`: resets every `status=failed` job back to
    /// pending with attempts/error cleared. Returns the count reset.
    pub async fn reset_failed_print_jobs(&self) -> Result<u32> {
        self.conn
            .call(|conn| {
                let count = conn.execute(
                    "UPDATE print_jobs SET status = 'pending', attempts = 0, error_message = NULL,
                        updated_at = ?1
                     WHERE status = 'failed'",
                    params![Utc::now().timestamp_millis()],
                )?;
                Ok(count as u32)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("reset_failed_print_jobs failed: {e}")))
    }

    pub async fn count_print_jobs_by_status(&self, status: PrintJobStatus) -> Result<u64> {
        let status = print_status_to_str(status).to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM print_jobs WHERE status = ?1",
                    params![status],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await
            .map(|n| n as u64)
            .map_err(|e| DaemonError::Store(format!("count_print_jobs_by_status failed: {e}")))
    }

    pub async fn count_print_jobs_for_order(&self, order_id: &str) -> Result<u32> {
        let order_id = order_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM print_jobs WHERE order_id = ?1",
                    params![order_id],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await
            .map(|n| n as u32)
            .map_err(|e| DaemonError::Store(format!("count_print_jobs_for_order failed: {e}")))
    }

    pub async fn list_print_jobs_for_order(&self, order_id: &str) -> Result<Vec<PrintJob>> {
        let order_id = order_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, job_type, status, content_blob, attempts, max_attempts,
                        created_at, updated_at, printed_at, error_message
                     FROM print_jobs WHERE order_id = ?1 ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![order_id], row_to_print_job)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("list_print_jobs_for_order failed: {e}")))
    }

    // ---- offline queue -----------------------------------------------

    pub async fn queue_size(&self) -> Result<u64> {
        self.conn
            .call(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM offline_queue WHERE status = 'queued'",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u64)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("queue_size failed: {e}")))
    }

    pub async fn enqueue_offline_item(&self, item: OfflineQueueItem) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO offline_queue (id, item_type, item_id, priority, status,
                        created_at, updated_at, retry_count, max_retries, expires_at,
                        error_message, metadata_blob)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        item.id,
                        item_type_to_str(item.item_type),
                        item.item_id,
                        item.priority as i32,
                        queue_status_to_str(item.status),
                        ts(item.created_at),
                        ts(item.updated_at),
                        item.retry_count,
                        item.max_retries,
                        opt_ts(item.expires_at),
                        item.error_message,
                        json_to_string(&item.metadata),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("enqueue_offline_item failed: {e}")))
    }

    /// spec §4.4 `nextItems`: queued AND not expired, priority desc then
    /// createdAt asc. Does not claim.
    pub async fn next_offline_items(
        &self,
        item_type: Option<ItemType>,
        limit: u32,
    ) -> Result<Vec<OfflineQueueItem>> {
        let now_ms = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                let rows = match item_type {
                    Some(t) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, item_type, item_id, priority, status, created_at, updated_at,
                                retry_count, max_retries, expires_at, error_message, metadata_blob
                             FROM offline_queue
                             WHERE status = 'queued' AND (expires_at IS NULL OR expires_at > ?1)
                                AND item_type = ?2
                             ORDER BY priority DESC, created_at ASC LIMIT ?3",
                        )?;
                        stmt.query_map(
                            params![now_ms, item_type_to_str(t), limit],
                            row_to_offline_item,
                        )?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, item_type, item_id, priority, status, created_at, updated_at,
                                retry_count, max_retries, expires_at, error_message, metadata_blob
                             FROM offline_queue
                             WHERE status = 'queued' AND (expires_at IS NULL OR expires_at > ?1)
                             ORDER BY priority DESC, created_at ASC LIMIT ?2",
                        )?;
                        stmt.query_map(params![now_ms, limit], row_to_offline_item)?
                            .collect::<std::result::Result<Vec<_>, _>>()?
                    }
                };
                Ok(rows)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("next_offline_items failed: {e}")))
    }

    /// spec §4.1/§4.4 atomic batch claim: one transaction flips queued→
    /// processing for every id still queued; returns the count actually
    /// transitioned (may be less than `ids.len()` — partial success is
    /// surfaced, not retried atomically).
    pub async fn claim_batch(&self, ids: Vec<String>) -> Result<u32> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut claimed = 0u32;
                let now_ms = Utc::now().timestamp_millis();
                {
                    let mut stmt = tx.prepare(
                        "UPDATE offline_queue SET status = 'processing', updated_at = ?1
                         WHERE id = ?2 AND status = 'queued'",
                    )?;
                    for id in &ids {
                        claimed += stmt.execute(params![now_ms, id])? as u32;
                    }
                }
                tx.commit()?;
                Ok(claimed)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("claim_batch failed: {e}")))
    }

    pub async fn update_offline_item_status(
        &self,
        id: &str,
        status: OfflineQueueStatus,
        error: Option<String>,
    ) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE offline_queue SET status = ?1, updated_at = ?2, error_message = ?3
                     WHERE id = ?4",
                    params![
                        queue_status_to_str(status),
                        Utc::now().timestamp_millis(),
                        error,
                        id
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("update_offline_item_status failed: {e}")))
    }

    pub async fn increment_offline_retry(&self, id: &str) -> Result<u32> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE offline_queue SET retry_count = retry_count + 1, updated_at = ?1,
                        status = 'queued' WHERE id = ?2",
                    params![Utc::now().timestamp_millis(), id],
                )?;
                conn.query_row(
                    "SELECT retry_count FROM offline_queue WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u32)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("increment_offline_retry failed: {e}")))
    }

    pub async fn get_offline_item(&self, id: &str) -> Result<Option<OfflineQueueItem>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, item_type, item_id, priority, status, created_at, updated_at,
                        retry_count, max_retries, expires_at, error_message, metadata_blob
                     FROM offline_queue WHERE id = ?1",
                    params![id],
                    row_to_offline_item,
                )
                .optional()
            })
            .await
            .map_err(|e| DaemonError::Store(format!("get_offline_item failed: {e}")))
    }

    /// spec §3 `OfflineQueueItem` invariant: at most one live queue item per
    /// `(itemType,itemId)`. "Live" excludes terminal rows (completed/
    /// expired) — a job that finished recovery and later needs re-queueing
    /// (e.g. after a fresh failure) must be allowed a new row.
    pub async fn has_live_queue_item(&self, item_type: ItemType, item_id: &str) -> Result<bool> {
        let item_id = item_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM offline_queue
                     WHERE item_type = ?1 AND item_id = ?2
                        AND status IN ('queued', 'processing')",
                    params![item_type_to_str(item_type), item_id],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n > 0)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("has_live_queue_item failed: {e}")))
    }

    pub async fn remove_offline_item(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("remove_offline_item failed: {e}")))
    }

    pub async fn cleanup_expired_offline_items(&self) -> Result<u32> {
        let now_ms = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM offline_queue WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    params![now_ms],
                )?;
                Ok(n as u32)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("cleanup_expired_offline_items failed: {e}")))
    }

    pub async fn oldest_queued_offline_item(&self) -> Result<Option<OfflineQueueItem>> {
        self.conn
            .call(|conn| {
                conn.query_row(
                    "SELECT id, item_type, item_id, priority, status, created_at, updated_at,
                        retry_count, max_retries, expires_at, error_message, metadata_blob
                     FROM offline_queue WHERE status = 'queued' ORDER BY created_at ASC LIMIT 1",
                    [],
                    row_to_offline_item,
                )
                .optional()
            })
            .await
            .map_err(|e| DaemonError::Store(format!("oldest_queued_offline_item failed: {e}")))
    }

    pub async fn count_offline_items_expiring_within(&self, within_secs: i64) -> Result<u32> {
        let now_ms = Utc::now().timestamp_millis();
        let cutoff = now_ms + within_secs * 1000;
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM offline_queue
                     WHERE status = 'queued' AND expires_at IS NOT NULL AND expires_at < ?1",
                    params![cutoff],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u32)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("count_offline_items_expiring_within failed: {e}")))
    }

    // ---- connectivity events -----------------------------------------

    pub async fn log_connectivity_event(&self, event: ConnectivityEvent) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO connectivity_events (id, event_type, component, status,
                        timestamp, duration_offline, details_blob)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        event.id,
                        connectivity_event_type_to_str(event.event_type),
                        component_to_str(event.component),
                        connectivity_status_to_str(event.status),
                        ts(event.timestamp),
                        event.duration_offline_secs,
                        json_to_string(&event.details),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("log_connectivity_event failed: {e}")))
    }

    // ---- retry attempts -----------------------------------------------

    pub async fn log_retry_attempt(
        &self,
        task_id: &str,
        failure_type: FailureType,
        attempt: RetryAttemptRecord,
        dead_letter_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO retry_attempts (task_id, attempt_number, timestamp, delay_before,
                        success, duration, error_message, failure_type, dead_letter_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        task_id,
                        attempt.attempt_number,
                        ts(attempt.timestamp),
                        attempt.delay_before_secs,
                        attempt.success,
                        attempt.duration_ms,
                        attempt.error,
                        failure_type_to_str(failure_type),
                        opt_ts(dead_letter_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("log_retry_attempt failed: {e}")))
    }

    /// spec §9: the dead-letter queue must survive a restart. One row per
    /// `task_id` that has a `dead_letter_at` attempt and whose print job is
    /// still `status='failed'` — i.e. nobody has requeued it since — with
    /// every attempt for that task, oldest first.
    pub async fn unresolved_dead_letters(
        &self,
    ) -> Result<Vec<(String, FailureType, Vec<RetryAttemptRecord>)>> {
        self.conn
            .call(|conn| {
                let mut task_stmt = conn.prepare(
                    "SELECT DISTINCT ra.task_id, ra.failure_type
                     FROM retry_attempts ra
                     JOIN print_jobs pj ON pj.id = ra.task_id
                     WHERE ra.dead_letter_at IS NOT NULL AND pj.status = 'failed'",
                )?;
                let tasks = task_stmt
                    .query_map([], |row| {
                        let task_id: String = row.get(0)?;
                        let failure_type: String = row.get(1)?;
                        Ok((task_id, failure_type))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut out = Vec::with_capacity(tasks.len());
                for (task_id, failure_type) in tasks {
                    let mut attempt_stmt = conn.prepare(
                        "SELECT attempt_number, timestamp, delay_before, success, duration, error_message
                         FROM retry_attempts WHERE task_id = ?1 ORDER BY attempt_number ASC",
                    )?;
                    let attempts = attempt_stmt
                        .query_map(params![task_id], |row| {
                            Ok(RetryAttemptRecord {
                                attempt_number: row.get::<_, i64>(0)? as u32,
                                timestamp: from_ts(row.get(1)?),
                                delay_before_secs: row.get(2)?,
                                success: row.get(3)?,
                                duration_ms: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
                                error: row.get(5)?,
                            })
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    out.push((task_id, str_to_failure_type(&failure_type), attempts));
                }
                Ok(out)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("unresolved_dead_letters failed: {e}")))
    }

    // ---- health metrics -------------------------------------------------

    pub async fn log_health_metric(&self, metric: HealthMetric) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO health_metrics (resource_type, timestamp, value, status, metadata_blob)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        health_resource_to_str(metric.resource_type),
                        ts(metric.timestamp),
                        metric.value,
                        health_status_to_str(metric.status),
                        json_to_string(&metric.metadata),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("log_health_metric failed: {e}")))
    }

    // ---- notification history / config -------------------------------

    pub async fn log_notification(
        &self,
        notification_type: NotificationType,
        context: serde_json::Value,
        success: bool,
        error: Option<String>,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO notification_history (notification_type, context_blob, success, sent_at, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        notification_type_to_str(notification_type),
                        json_to_string(&context),
                        success,
                        Utc::now().timestamp_millis(),
                        error,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("log_notification failed: {e}")))
    }

    pub async fn notifications_sent_since(
        &self,
        notification_type: NotificationType,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let since_ms = since.timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM notification_history
                     WHERE notification_type = ?1 AND sent_at >= ?2 AND success = 1",
                    params![notification_type_to_str(notification_type), since_ms],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u32)
            })
            .await
            .map_err(|e| DaemonError::Store(format!("notifications_sent_since failed: {e}")))
    }

    pub async fn last_notification_sent_at(
        &self,
        notification_type: NotificationType,
    ) -> Result<Option<DateTime<Utc>>> {
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT MAX(sent_at) FROM notification_history
                     WHERE notification_type = ?1 AND success = 1",
                    params![notification_type_to_str(notification_type)],
                    |row| row.get::<_, Option<i64>>(0),
                )
            })
            .await
            .map(|opt| opt.map(from_ts))
            .map_err(|e| DaemonError::Store(format!("last_notification_sent_at failed: {e}")))
    }

    // ---- recovery sessions --------------------------------------------

    pub async fn save_recovery_session(&self, session: RecoverySession) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO recovery_sessions (id, recovery_type, phase, started_at,
                        completed_at, items_total, items_processed, items_failed, error_message, metadata_blob)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                        phase=excluded.phase, completed_at=excluded.completed_at,
                        items_total=excluded.items_total, items_processed=excluded.items_processed,
                        items_failed=excluded.items_failed, error_message=excluded.error_message",
                    params![
                        session.id,
                        recovery_type_to_str(session.recovery_type),
                        recovery_phase_to_str(session.phase),
                        ts(session.started_at),
                        opt_ts(session.completed_at),
                        session.items_total,
                        session.items_processed,
                        session.items_failed,
                        session.error_message,
                        json_to_string(&session.metadata),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("save_recovery_session failed: {e}")))
    }

    // ---- self-healing events -------------------------------------------

    pub async fn log_self_healing_event(
        &self,
        event_type: &str,
        resource_type: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        let event_type = event_type.to_string();
        let resource_type = resource_type.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO self_healing_events (event_type, resource_type, timestamp, details_blob)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        event_type,
                        resource_type,
                        Utc::now().timestamp_millis(),
                        json_to_string(&details),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DaemonError::Store(format!("log_self_healing_event failed: {e}")))
    }
}

const MIGRATION_V1: &str = "
CREATE TABLE orders (
    id TEXT PRIMARY KEY,
    external_order_id TEXT UNIQUE NOT NULL,
    status TEXT NOT NULL,
    items_blob TEXT NOT NULL,
    customer_blob TEXT NOT NULL,
    delivery_blob TEXT NOT NULL,
    total_amount REAL NOT NULL,
    currency TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    raw_blob TEXT NOT NULL
);

CREATE TABLE print_jobs (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    content_blob BLOB NOT NULL,
    attempts INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    printed_at INTEGER,
    error_message TEXT
);
CREATE INDEX idx_print_jobs_order ON print_jobs(order_id);
CREATE INDEX idx_print_jobs_status ON print_jobs(status, created_at ASC);

CREATE TABLE offline_queue (
    id TEXT PRIMARY KEY,
    item_type TEXT NOT NULL,
    item_id TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    expires_at INTEGER,
    error_message TEXT,
    metadata_blob TEXT NOT NULL
);
CREATE INDEX idx_offline_queue_status_priority ON offline_queue(status, priority DESC, created_at ASC);
CREATE INDEX idx_offline_queue_type_status ON offline_queue(item_type, status);

CREATE TABLE connectivity_events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    component TEXT NOT NULL,
    status TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    duration_offline INTEGER,
    details_blob TEXT NOT NULL
);
CREATE INDEX idx_connectivity_events_timestamp ON connectivity_events(timestamp DESC);

CREATE TABLE retry_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    delay_before REAL NOT NULL,
    success INTEGER NOT NULL,
    duration INTEGER,
    error_message TEXT,
    failure_type TEXT NOT NULL,
    dead_letter_at INTEGER
);
CREATE INDEX idx_retry_attempts_task ON retry_attempts(task_id);

CREATE TABLE health_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_type TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    value REAL NOT NULL,
    status TEXT NOT NULL,
    metadata_blob TEXT NOT NULL
);
CREATE INDEX idx_health_metrics_type_time ON health_metrics(resource_type, timestamp DESC);

CREATE TABLE notification_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    notification_type TEXT NOT NULL,
    context_blob TEXT NOT NULL,
    success INTEGER NOT NULL,
    sent_at INTEGER NOT NULL,
    error_message TEXT
);
CREATE INDEX idx_notification_history_type_time ON notification_history(notification_type, sent_at DESC);

CREATE TABLE notification_config (
    key TEXT PRIMARY KEY UNIQUE,
    value TEXT NOT NULL,
    type TEXT NOT NULL,
    description TEXT
);

CREATE TABLE notification_templates (
    notification_type TEXT PRIMARY KEY UNIQUE,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    html TEXT,
    throttle_minutes INTEGER NOT NULL,
    max_per_hour INTEGER NOT NULL,
    enabled INTEGER NOT NULL
);

CREATE TABLE recovery_sessions (
    id TEXT PRIMARY KEY,
    recovery_type TEXT NOT NULL,
    phase TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    items_total INTEGER NOT NULL,
    items_processed INTEGER NOT NULL,
    items_failed INTEGER NOT NULL,
    error_message TEXT,
    metadata_blob TEXT NOT NULL
);

CREATE TABLE self_healing_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    details_blob TEXT NOT NULL
);
";

// ---- enum <-> TEXT mapping helpers -------------------------------------

fn status_to_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Pending => "pending",
        OrderStatus::Processing => "processing",
        OrderStatus::Completed => "completed",
        OrderStatus::Cancelled => "cancelled",
    }
}

fn str_to_order_status(s: &str) -> OrderStatus {
    match s {
        "processing" => OrderStatus::Processing,
        "completed" => OrderStatus::Completed,
        "cancelled" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

fn job_type_to_str(j: JobType) -> &'static str {
    match j {
        JobType::Kitchen => "kitchen",
        JobType::Service => "service",
        JobType::Customer => "customer",
        JobType::Other => "other",
    }
}

fn str_to_job_type(s: &str) -> JobType {
    match s {
        "kitchen" => JobType::Kitchen,
        "service" => JobType::Service,
        "customer" => JobType::Customer,
        _ => JobType::Other,
    }
}

fn print_status_to_str(s: PrintJobStatus) -> &'static str {
    match s {
        PrintJobStatus::Pending => "pending",
        PrintJobStatus::Printing => "printing",
        PrintJobStatus::Completed => "completed",
        PrintJobStatus::Failed => "failed",
    }
}

fn str_to_print_status(s: &str) -> PrintJobStatus {
    match s {
        "printing" => PrintJobStatus::Printing,
        "completed" => PrintJobStatus::Completed,
        "failed" => PrintJobStatus::Failed,
        _ => PrintJobStatus::Pending,
    }
}

fn item_type_to_str(t: ItemType) -> &'static str {
    match t {
        ItemType::Order => "order",
        ItemType::PrintJob => "print_job",
    }
}

fn str_to_item_type(s: &str) -> ItemType {
    match s {
        "order" => ItemType::Order,
        _ => ItemType::PrintJob,
    }
}

fn queue_status_to_str(s: OfflineQueueStatus) -> &'static str {
    match s {
        OfflineQueueStatus::Queued => "queued",
        OfflineQueueStatus::Processing => "processing",
        OfflineQueueStatus::Completed => "completed",
        OfflineQueueStatus::Failed => "failed",
        OfflineQueueStatus::Expired => "expired",
    }
}

fn str_to_queue_status(s: &str) -> OfflineQueueStatus {
    match s {
        "processing" => OfflineQueueStatus::Processing,
        "completed" => OfflineQueueStatus::Completed,
        "failed" => OfflineQueueStatus::Failed,
        "expired" => OfflineQueueStatus::Expired,
        _ => OfflineQueueStatus::Queued,
    }
}

fn str_to_priority(n: i64) -> QueuePriority {
    match n {
        4 => QueuePriority::Critical,
        3 => QueuePriority::High,
        1 => QueuePriority::Low,
        _ => QueuePriority::Normal,
    }
}

fn component_to_str(c: ComponentKind) -> &'static str {
    match c {
        ComponentKind::Printer => "printer",
        ComponentKind::Internet => "internet",
    }
}

fn connectivity_status_to_str(s: ConnectivityStatus) -> &'static str {
    match s {
        ConnectivityStatus::Online => "online",
        ConnectivityStatus::Offline => "offline",
        ConnectivityStatus::Degraded => "degraded",
        ConnectivityStatus::Unknown => "unknown",
    }
}

fn connectivity_event_type_to_str(t: ConnectivityEventType) -> &'static str {
    match t {
        ConnectivityEventType::PrinterOnline => "printer_online",
        ConnectivityEventType::PrinterOffline => "printer_offline",
        ConnectivityEventType::InternetOnline => "internet_online",
        ConnectivityEventType::InternetOffline => "internet_offline",
        ConnectivityEventType::ConnectivityRestored => "connectivity_restored",
        ConnectivityEventType::RecoveryStarted => "recovery_started",
        ConnectivityEventType::RecoveryCompleted => "recovery_completed",
        ConnectivityEventType::RecoveryFailed => "recovery_failed",
    }
}

fn failure_type_to_str(f: FailureType) -> &'static str {
    match f {
        FailureType::PrinterOffline => "printer_offline",
        FailureType::PrinterError => "printer_error",
        FailureType::NetworkError => "network_error",
        FailureType::ResourceUnavailable => "resource_unavailable",
        FailureType::TemporaryError => "temporary_error",
        FailureType::Unknown => "unknown",
    }
}

fn str_to_failure_type(s: &str) -> FailureType {
    match s {
        "printer_offline" => FailureType::PrinterOffline,
        "printer_error" => FailureType::PrinterError,
        "network_error" => FailureType::NetworkError,
        "resource_unavailable" => FailureType::ResourceUnavailable,
        "temporary_error" => FailureType::TemporaryError,
        _ => FailureType::Unknown,
    }
}

fn health_resource_to_str(r: HealthResourceType) -> &'static str {
    match r {
        HealthResourceType::Memory => "memory",
        HealthResourceType::Cpu => "cpu",
        HealthResourceType::Disk => "disk",
        HealthResourceType::Threads => "threads",
        HealthResourceType::Webhook => "webhook",
        HealthResourceType::PublicUrl => "public_url",
    }
}

fn health_status_to_str(s: HealthStatus) -> &'static str {
    match s {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Warning => "warning",
        HealthStatus::Critical => "critical",
        HealthStatus::Emergency => "emergency",
    }
}

fn notification_type_to_str(t: NotificationType) -> &'static str {
    match t {
        NotificationType::PrinterOffline => "printer_offline",
        NotificationType::PrinterOnline => "printer_online",
        NotificationType::InternetOffline => "internet_offline",
        NotificationType::InternetOnline => "internet_online",
        NotificationType::SystemError => "system_error",
        NotificationType::RecoveryFailed => "recovery_failed",
        NotificationType::RecoveryCompleted => "recovery_completed",
        NotificationType::QueueOverflow => "queue_overflow",
        NotificationType::ServiceRestart => "service_restart",
    }
}

fn recovery_type_to_str(t: RecoveryType) -> &'static str {
    match t {
        RecoveryType::Printer => "printer",
        RecoveryType::Internet => "internet",
        RecoveryType::Combined => "combined",
        RecoveryType::Manual => "manual",
    }
}

fn recovery_phase_to_str(p: RecoveryPhase) -> &'static str {
    match p {
        RecoveryPhase::Idle => "idle",
        RecoveryPhase::Validation => "validation",
        RecoveryPhase::Processing => "processing",
        RecoveryPhase::Completion => "completion",
        RecoveryPhase::Failed => "failed",
    }
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let items_blob: String = row.get(3)?;
    let customer_blob: String = row.get(4)?;
    let delivery_blob: String = row.get(5)?;
    let raw_blob: String = row.get(9)?;
    Ok(Order {
        id: row.get(0)?,
        external_order_id: row.get(1)?,
        status: str_to_order_status(&row.get::<_, String>(2)?),
        items: serde_json::from_str(&items_blob).unwrap_or_default(),
        customer: serde_json::from_str(&customer_blob).unwrap_or_default(),
        delivery: serde_json::from_str(&delivery_blob).unwrap_or_default(),
        total_amount: row.get(6)?,
        currency: row.get(7)?,
        created_at: from_ts(row.get(8)?),
        raw_payload: string_to_json(&raw_blob),
    })
}

fn row_to_print_job(row: &rusqlite::Row) -> rusqlite::Result<PrintJob> {
    Ok(PrintJob {
        id: row.get(0)?,
        order_id: row.get(1)?,
        job_type: str_to_job_type(&row.get::<_, String>(2)?),
        status: str_to_print_status(&row.get::<_, String>(3)?),
        content: row.get(4)?,
        attempts: row.get::<_, i64>(5)? as u32,
        max_attempts: row.get::<_, i64>(6)? as u32,
        created_at: from_ts(row.get(7)?),
        updated_at: from_ts(row.get(8)?),
        printed_at: row.get::<_, Option<i64>>(9)?.map(from_ts),
        error_message: row.get(10)?,
    })
}

fn row_to_offline_item(row: &rusqlite::Row) -> rusqlite::Result<OfflineQueueItem> {
    let metadata_blob: String = row.get(11)?;
    Ok(OfflineQueueItem {
        id: row.get(0)?,
        item_type: str_to_item_type(&row.get::<_, String>(1)?),
        item_id: row.get(2)?,
        priority: str_to_priority(row.get(3)?),
        status: str_to_queue_status(&row.get::<_, String>(4)?),
        created_at: from_ts(row.get(5)?),
        updated_at: from_ts(row.get(6)?),
        retry_count: row.get::<_, i64>(7)? as u32,
        max_retries: row.get::<_, i64>(8)? as u32,
        expires_at: row.get::<_, Option<i64>>(9)?.map(from_ts),
        error_message: row.get(10)?,
        metadata: string_to_json(&metadata_blob),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> Order {
        Order {
            id: uuid::Uuid::new_v4().to_string(),
            external_order_id: format!("ext-{}", uuid::Uuid::new_v4()),
            status: OrderStatus::Pending,
            items: vec![OrderItem {
                id: "1".to_string(),
                name: "Nam Tok".to_string(),
                quantity: 3,
                unit_price: 18.50,
                variant: None,
                notes: None,
            }],
            customer: Customer {
                name: Some("Jane".to_string()),
                email: None,
                phone: None,
            },
            delivery: Delivery::default(),
            total_amount: 55.50,
            currency: "CHF".to_string(),
            created_at: Utc::now(),
            raw_payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn save_and_find_order_by_external_id() {
        let store = Store::open_in_memory().await.unwrap();
        let order = sample_order();
        let external_id = order.external_order_id.clone();
        store.save_order(order).await.unwrap();
        let found = store.find_order_by_external_id(&external_id).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn upsert_same_order_twice_keeps_one_row() {
        let store = Store::open_in_memory().await.unwrap();
        let order = sample_order();
        store.save_order(order.clone()).await.unwrap();
        store.save_order(order.clone()).await.unwrap();
        let found = store
            .find_order_by_external_id(&order.external_order_id)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn pending_print_jobs_excludes_exhausted_attempts() {
        let store = Store::open_in_memory().await.unwrap();
        let order = sample_order();
        store.save_order(order.clone()).await.unwrap();

        let mut exhausted = PrintJob::new(order.id.clone(), JobType::Kitchen, vec![1, 2, 3]);
        exhausted.attempts = exhausted.max_attempts;
        store.save_print_job(exhausted).await.unwrap();

        let pending = PrintJob::new(order.id.clone(), JobType::Customer, vec![4, 5, 6]);
        let pending_id = pending.id.clone();
        store.save_print_job(pending).await.unwrap();

        let jobs = store.get_pending_print_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, pending_id);
    }

    #[tokio::test]
    async fn claim_batch_is_atomic_and_reports_partial_success() {
        let store = Store::open_in_memory().await.unwrap();
        let a = OfflineQueueItem::new(ItemType::PrintJob, "job-a", QueuePriority::High);
        let b = OfflineQueueItem::new(ItemType::PrintJob, "job-b", QueuePriority::Normal);
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        store.enqueue_offline_item(a).await.unwrap();
        store.enqueue_offline_item(b).await.unwrap();

        // Pre-claim b so only a is eligible.
        store
            .update_offline_item_status(&b_id, OfflineQueueStatus::Processing, None)
            .await
            .unwrap();

        let claimed = store.claim_batch(vec![a_id, b_id]).await.unwrap();
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn next_items_excludes_expired() {
        let store = Store::open_in_memory().await.unwrap();
        let mut item = OfflineQueueItem::new(ItemType::PrintJob, "job-x", QueuePriority::Normal);
        item.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.enqueue_offline_item(item).await.unwrap();

        let next = store.next_offline_items(None, 10).await.unwrap();
        assert!(next.is_empty());

        let cleaned = store.cleanup_expired_offline_items().await.unwrap();
        assert_eq!(cleaned, 1);
    }

    #[tokio::test]
    async fn next_items_orders_by_priority_then_fifo() {
        let store = Store::open_in_memory().await.unwrap();
        let low = OfflineQueueItem::new(ItemType::PrintJob, "low", QueuePriority::Low);
        let high = OfflineQueueItem::new(ItemType::PrintJob, "high", QueuePriority::High);
        store.enqueue_offline_item(low).await.unwrap();
        store.enqueue_offline_item(high).await.unwrap();

        let items = store.next_offline_items(None, 10).await.unwrap();
        assert_eq!(items[0].item_id, "high");
        assert_eq!(items[1].item_id, "low");
    }
}
