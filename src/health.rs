//! Health Monitor (spec §4.7). New component, no teacher counterpart;
//! grounded on original_source's `health_monitor.py` resource-sampling
//! design, written in the teacher's async-worker idiom (a tokio task plus
//! `RwLock`-guarded state, matching `telemetry.rs`'s collector shape).
//! Memory and thread count read `/proc` directly; CPU% and disk usage go
//! through `sysinfo` (no crate in the teacher's own stack covers this, but
//! the pack's `system-health-monitor` example does the same thing with the
//! same crate).

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Disks, Pid, System};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::models::{HealthMetric, HealthResourceType, HealthStatus};
use crate::store::Store;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const HISTORY_CAPACITY: usize = 1000;
const MAX_THREADS: f64 = 1000.0;

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Thresholds {
    /// spec §8: "Health thresholds: warning ≤ critical ≤ emergency
    /// (construction rejects otherwise)".
    pub fn new(warning: f64, critical: f64, emergency: f64) -> Result<Self, String> {
        if !(warning <= critical && critical <= emergency) {
            return Err(format!(
                "thresholds must satisfy warning <= critical <= emergency, got {warning}/{critical}/{emergency}"
            ));
        }
        Ok(Self {
            warning,
            critical,
            emergency,
        })
    }

    pub fn classify(&self, value: f64) -> HealthStatus {
        if value >= self.emergency {
            HealthStatus::Emergency
        } else if value >= self.critical {
            HealthStatus::Critical
        } else if value >= self.warning {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(70.0, 85.0, 95.0).unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub resource_type: HealthResourceType,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub value: f64,
}

struct Accounting {
    webhook_total: AtomicU64,
    webhook_failed: AtomicU64,
    public_url_total: AtomicU64,
    public_url_failed: AtomicU64,
}

impl Default for Accounting {
    fn default() -> Self {
        Self {
            webhook_total: AtomicU64::new(0),
            webhook_failed: AtomicU64::new(0),
            public_url_total: AtomicU64::new(0),
            public_url_failed: AtomicU64::new(0),
        }
    }
}

pub struct HealthMonitor {
    store: Store,
    check_interval: Duration,
    thresholds: Thresholds,
    history: RwLock<std::collections::HashMap<HealthResourceType, VecDeque<HealthMetric>>>,
    last_status: RwLock<std::collections::HashMap<HealthResourceType, HealthStatus>>,
    accounting: Accounting,
    events_tx: tokio::sync::broadcast::Sender<HealthEvent>,
    system: Mutex<System>,
}

impl HealthMonitor {
    pub fn new(store: Store) -> Self {
        let (events_tx, _rx) = tokio::sync::broadcast::channel(256);
        Self {
            store,
            check_interval: DEFAULT_CHECK_INTERVAL,
            thresholds: Thresholds::default(),
            history: RwLock::new(std::collections::HashMap::new()),
            last_status: RwLock::new(std::collections::HashMap::new()),
            accounting: Accounting::default(),
            events_tx,
            system: Mutex::new(System::new_all()),
        }
    }

    /// Latest sampled metric per resource, for the operator/monitoring
    /// surface's `GET health` endpoint.
    pub async fn snapshot(&self) -> Vec<HealthMetric> {
        let history = self.history.read().await;
        history
            .values()
            .filter_map(|buffer| buffer.back().cloned())
            .collect()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HealthEvent> {
        self.events_tx.subscribe()
    }

    pub fn record_webhook_result(&self, success: bool) {
        self.accounting.webhook_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.accounting.webhook_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_public_url_result(&self, success: bool) {
        self.accounting
            .public_url_total
            .fetch_add(1, Ordering::Relaxed);
        if !success {
            self.accounting
                .public_url_failed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                this.sample_all().await;
                tokio::time::sleep(this.check_interval).await;
            }
        })
    }

    /// Polls `domain` for HTTP reachability on `interval`, feeding results
    /// into the `public_url` resource (spec §4.7). A no-op handle when no
    /// public domain is configured.
    pub fn spawn_public_url_probe(
        self: Arc<Self>,
        domain: Option<String>,
        timeout: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let Some(domain) = domain else {
                return;
            };
            let url = if domain.starts_with("http://") || domain.starts_with("https://") {
                domain
            } else {
                format!("https://{domain}")
            };
            let client = match reqwest::Client::builder().timeout(timeout).build() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "failed to build public-url reachability client");
                    return;
                }
            };
            loop {
                let success = match client.get(&url).send().await {
                    Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
                    Err(_) => false,
                };
                self.record_public_url_result(success);
                tokio::time::sleep(interval).await;
            }
        })
    }

    pub async fn sample_all(&self) {
        for resource in [
            HealthResourceType::Memory,
            HealthResourceType::Cpu,
            HealthResourceType::Disk,
            HealthResourceType::Threads,
            HealthResourceType::Webhook,
            HealthResourceType::PublicUrl,
        ] {
            let value = self.sample(resource).await;
            self.record(resource, value).await;
        }
    }

    async fn sample(&self, resource: HealthResourceType) -> f64 {
        match resource {
            HealthResourceType::Memory => memory_percent(),
            HealthResourceType::Cpu => self.cpu_percent().await,
            HealthResourceType::Disk => disk_percent(),
            HealthResourceType::Threads => thread_count() as f64 / MAX_THREADS * 100.0,
            HealthResourceType::Webhook => ratio_percent(
                self.accounting.webhook_failed.load(Ordering::Relaxed),
                self.accounting.webhook_total.load(Ordering::Relaxed),
            ),
            HealthResourceType::PublicUrl => ratio_percent(
                self.accounting.public_url_failed.load(Ordering::Relaxed),
                self.accounting.public_url_total.load(Ordering::Relaxed),
            ),
        }
    }

    /// spec §4.7: "process CPU% averaged over a 1s window". `sysinfo`
    /// reports a process's CPU usage since its last refresh, so this holds
    /// the refresh a second apart rather than taking a single instantaneous
    /// sample.
    async fn cpu_percent(&self) -> f64 {
        let pid = Pid::from_u32(std::process::id());
        let mut system = self.system.lock().await;
        system.refresh_process(pid);
        tokio::time::sleep(Duration::from_secs(1)).await;
        system.refresh_process(pid);
        system.process(pid).map(|p| p.cpu_usage() as f64).unwrap_or(0.0)
    }

    async fn record(&self, resource: HealthResourceType, value: f64) {
        let status = self.thresholds.classify(value);
        let metric = HealthMetric {
            resource_type: resource,
            timestamp: chrono::Utc::now(),
            value,
            status,
            metadata: serde_json::Value::Null,
        };

        {
            let mut history = self.history.write().await;
            let buffer = history.entry(resource).or_insert_with(VecDeque::new);
            buffer.push_back(metric.clone());
            if buffer.len() > HISTORY_CAPACITY {
                buffer.pop_front();
            }
        }

        if let Err(e) = self.store.log_health_metric(metric).await {
            warn!(error = %e, "failed to persist health metric");
        }

        let previous = {
            let mut last = self.last_status.write().await;
            let previous = last.insert(resource, status).unwrap_or(HealthStatus::Healthy);
            previous
        };

        if previous != status {
            info!(?resource, ?previous, ?status, value, "health status transition");
            self.run_cleanup_handler(resource, status).await;
            let _ = self.events_tx.send(HealthEvent {
                resource_type: resource,
                previous,
                current: status,
                value,
            });
        }
    }

    /// Cleanup handlers invoked on transition into warning/critical/
    /// emergency (spec §4.7: "force GC for memory, temp-file sweep for
    /// disk"). Rust has no tracing GC to force; memory cleanup here means
    /// dropping any droppable caches this process owns — currently a no-op
    /// hook point since none exist yet.
    async fn run_cleanup_handler(&self, resource: HealthResourceType, status: HealthStatus) {
        if status == HealthStatus::Healthy {
            return;
        }
        match resource {
            HealthResourceType::Disk => {
                let swept = sweep_temp_files();
                let _ = self
                    .store
                    .log_self_healing_event(
                        "cleanup",
                        "disk",
                        serde_json::json!({ "files_removed": swept }),
                    )
                    .await;
            }
            HealthResourceType::Memory => {
                let _ = self
                    .store
                    .log_self_healing_event("cleanup", "memory", serde_json::Value::Null)
                    .await;
            }
            _ => {}
        }
    }
}

fn ratio_percent(failed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (failed as f64 / total as f64) * 100.0
    }
}

fn memory_percent() -> f64 {
    let rss_kb = read_proc_status_field("VmRSS:");
    let total_kb = read_proc_meminfo_field("MemTotal:");
    match (rss_kb, total_kb) {
        (Some(rss), Some(total)) if total > 0.0 => (rss / total) * 100.0,
        _ => 0.0,
    }
}

/// spec §4.7: "used/total of root filesystem × 100".
fn disk_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .map(|d| {
            let total = d.total_space();
            if total == 0 {
                0.0
            } else {
                let used = total.saturating_sub(d.available_space());
                (used as f64 / total as f64) * 100.0
            }
        })
        .unwrap_or(0.0)
}

fn thread_count() -> u64 {
    read_proc_status_field("Threads:").unwrap_or(0.0) as u64
}

fn read_proc_status_field(field: &str) -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            return rest.trim().split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn read_proc_meminfo_field(field: &str) -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            return rest.trim().split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn sweep_temp_files() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_reject_out_of_order_values() {
        assert!(Thresholds::new(90.0, 50.0, 95.0).is_err());
    }

    #[test]
    fn thresholds_classify_boundaries() {
        let t = Thresholds::new(70.0, 85.0, 95.0).unwrap();
        assert_eq!(t.classify(10.0), HealthStatus::Healthy);
        assert_eq!(t.classify(70.0), HealthStatus::Warning);
        assert_eq!(t.classify(85.0), HealthStatus::Critical);
        assert_eq!(t.classify(95.0), HealthStatus::Emergency);
    }

    #[tokio::test]
    async fn transition_into_warning_emits_event() {
        let store = Store::open_in_memory().await.unwrap();
        let monitor = HealthMonitor::new(store);
        monitor.last_status.write().await.insert(HealthResourceType::Webhook, HealthStatus::Healthy);
        let mut rx = monitor.subscribe();

        for _ in 0..10 {
            monitor.record_webhook_result(false);
        }
        monitor.record(HealthResourceType::Webhook, 100.0).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.current, HealthStatus::Emergency);
    }

    #[test]
    fn ratio_percent_handles_zero_total() {
        assert_eq!(ratio_percent(0, 0), 0.0);
    }

    #[test]
    fn disk_percent_is_a_bounded_real_reading() {
        let pct = disk_percent();
        assert!((0.0..=100.0).contains(&pct));
    }

    #[tokio::test]
    async fn cpu_percent_samples_a_real_one_second_window() {
        let store = Store::open_in_memory().await.unwrap();
        let monitor = HealthMonitor::new(store);
        let pct = monitor.cpu_percent().await;
        assert!(pct >= 0.0);
    }
}
