//! Notification Service (spec §4.9). New component; grounded on
//! original_source's `notification_service.py` throttle algebra, written in
//! the teacher's async-worker shape (bounded mpsc queue + background drain
//! task, matching `print_manager`'s loop idiom) rather than the original's
//! asyncio queue. Email delivery goes through `lettre`, the SMTP crate the
//! wider example pack reaches for (no teacher counterpart — the teacher
//! daemon never sent mail).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::SmtpConfig;
use crate::errors::Result;
use crate::models::NotificationType;
use crate::store::Store;

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
struct ThrottlePolicy {
    throttle_minutes: i64,
    max_per_hour: u32,
}

const NONE: ThrottlePolicy = ThrottlePolicy {
    throttle_minutes: 0,
    max_per_hour: u32::MAX,
};

/// Per-type defaults from spec §4.9. Types the spec leaves unlisted
/// (`printer_online`, `internet_online`, `recovery_completed`,
/// `service_restart`) carry no template in the original either — they are
/// never throttled, matching `_is_throttled`'s "no template ⇒ not
/// throttled" fallback.
fn policy_for(t: NotificationType) -> ThrottlePolicy {
    match t {
        NotificationType::PrinterOffline => ThrottlePolicy { throttle_minutes: 15, max_per_hour: 4 },
        NotificationType::InternetOffline => ThrottlePolicy { throttle_minutes: 30, max_per_hour: 2 },
        NotificationType::SystemError => ThrottlePolicy { throttle_minutes: 5, max_per_hour: 12 },
        NotificationType::RecoveryFailed => ThrottlePolicy { throttle_minutes: 10, max_per_hour: 6 },
        NotificationType::QueueOverflow => ThrottlePolicy { throttle_minutes: 20, max_per_hour: 3 },
        NotificationType::PrinterOnline
        | NotificationType::InternetOnline
        | NotificationType::RecoveryCompleted
        | NotificationType::ServiceRestart => NONE,
    }
}

#[derive(Debug, Clone, Default)]
struct ThrottleState {
    last_sent: Option<DateTime<Utc>>,
    count_in_hour: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<()>;
}

/// Default transport when SMTP isn't configured — logs rather than dropping
/// the notification silently, so operators still see the alert in logs.
pub struct LogTransport;

#[async_trait::async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<()> {
        info!(%subject, recipients = ?to, "notification (no SMTP configured): {body}");
        Ok(())
    }
}

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| crate::errors::DaemonError::Config("SMTP_HOST not set".to_string()))?;
        let from_address = config
            .from_address
            .clone()
            .ok_or_else(|| crate::errors::DaemonError::Config("SMTP_FROM_ADDRESS not set".to_string()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .map_err(|e| crate::errors::DaemonError::Config(format!("invalid SMTP host '{host}': {e}")))?
            .port(config.port);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let from = from_address
            .parse()
            .map_err(|e| crate::errors::DaemonError::Config(format!("invalid SMTP_FROM_ADDRESS: {e}")))?;

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }
}

#[async_trait::async_trait]
impl NotificationTransport for SmtpTransport {
    async fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<()> {
        for recipient in to {
            let mailbox: Mailbox = recipient
                .parse()
                .map_err(|e| crate::errors::DaemonError::Notification(format!("bad recipient '{recipient}': {e}")))?;
            let message = Message::builder()
                .from(self.from.clone())
                .to(mailbox)
                .subject(subject)
                .body(body.to_string())
                .map_err(|e| crate::errors::DaemonError::Notification(e.to_string()))?;
            self.mailer
                .send(message)
                .await
                .map_err(|e| crate::errors::DaemonError::Notification(e.to_string()))?;
        }
        Ok(())
    }
}

struct QueuedNotification {
    notification_type: NotificationType,
    context: serde_json::Value,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NotificationStats {
    pub total_sent: u64,
    pub total_throttled: u64,
    pub total_failed: u64,
}

pub struct NotificationService {
    store: Store,
    enabled: bool,
    to_addresses: Vec<String>,
    transport: Arc<dyn NotificationTransport>,
    throttle: Mutex<HashMap<NotificationType, ThrottleState>>,
    stats: Mutex<NotificationStats>,
    tx: mpsc::Sender<QueuedNotification>,
    rx: Mutex<Option<mpsc::Receiver<QueuedNotification>>>,
}

impl NotificationService {
    /// Test/default constructor: disabled, logs-only transport, no worker
    /// needed since `notify` becomes a synchronous drop when `enabled` is
    /// false.
    pub fn new(store: Store) -> Self {
        Self::with_transport(store, false, Vec::new(), Arc::new(LogTransport))
    }

    pub fn with_transport(
        store: Store,
        enabled: bool,
        to_addresses: Vec<String>,
        transport: Arc<dyn NotificationTransport>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            store,
            enabled,
            to_addresses,
            transport,
            throttle: Mutex::new(HashMap::new()),
            stats: Mutex::new(NotificationStats::default()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn stats(&self) -> NotificationStats {
        self.stats.lock().await.clone()
    }

    /// Spawns the worker draining the bounded queue. Transport failures are
    /// recorded and NOT retried here — the Retry Manager is deliberately
    /// not used for notifications, to avoid retry storms piling more mail
    /// onto an already-failing SMTP relay (spec §4.9).
    pub fn spawn(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let mut guard = self.rx.try_lock().ok()?;
        let rx = guard.take()?;
        drop(guard);
        let this = self.clone();
        Some(tokio::spawn(async move { this.worker_loop(rx).await }))
    }

    async fn worker_loop(&self, mut rx: mpsc::Receiver<QueuedNotification>) {
        while let Some(queued) = rx.recv().await {
            let (subject, body) = render_template(queued.notification_type, &queued.context);
            let result = self.transport.send(&subject, &body, &self.to_addresses).await;
            let success = result.is_ok();
            if let Err(e) = &result {
                warn!(error = %e, ?queued.notification_type, "notification transport failed");
            }
            let mut stats = self.stats.lock().await;
            if success {
                stats.total_sent += 1;
            } else {
                stats.total_failed += 1;
            }
            drop(stats);
            let _ = self
                .store
                .log_notification(
                    queued.notification_type,
                    queued.context,
                    success,
                    result.err().map(|e| e.to_string()),
                )
                .await;
        }
    }

    /// Queues a notification for async delivery unless throttled or the
    /// service is disabled (spec §4.9).
    pub async fn notify(&self, notification_type: NotificationType, context: serde_json::Value) {
        if !self.enabled {
            debug!(?notification_type, "notifications disabled, skipping");
            return;
        }
        if self.is_throttled(notification_type).await {
            self.stats.lock().await.total_throttled += 1;
            info!(?notification_type, "notification throttled, skipping");
            return;
        }
        self.mark_sent(notification_type).await;
        if self
            .tx
            .try_send(QueuedNotification {
                notification_type,
                context,
            })
            .is_err()
        {
            warn!(?notification_type, "notification queue full, dropping");
        }
    }

    /// `allowed(type) <=> (now-lastSent>=throttleMinutes) AND
    /// (countInHour<maxPerHour OR lastSent<=now-1h) AND (now>=cooldownUntil)`
    /// (spec §4.9).
    async fn is_throttled(&self, t: NotificationType) -> bool {
        let policy = policy_for(t);
        let mut throttle = self.throttle.lock().await;
        let now = Utc::now();
        let entry = throttle.entry(t).or_default();

        if let Some(cooldown_until) = entry.cooldown_until {
            if now < cooldown_until {
                return true;
            }
        }

        let Some(last_sent) = entry.last_sent else {
            return false;
        };

        if now - last_sent < ChronoDuration::minutes(policy.throttle_minutes) {
            return true;
        }

        let hour_ago = now - ChronoDuration::hours(1);
        if last_sent > hour_ago && entry.count_in_hour >= policy.max_per_hour {
            entry.cooldown_until = Some(last_sent + ChronoDuration::hours(1));
            return true;
        }

        false
    }

    async fn mark_sent(&self, t: NotificationType) {
        let mut throttle = self.throttle.lock().await;
        let now = Utc::now();
        let entry = throttle.entry(t).or_default();
        let hour_ago = now - ChronoDuration::hours(1);
        if entry.last_sent.map(|last| last <= hour_ago).unwrap_or(true) {
            entry.count_in_hour = 0;
        }
        entry.count_in_hour += 1;
        entry.last_sent = Some(now);
    }
}

fn render_template(t: NotificationType, context: &serde_json::Value) -> (String, String) {
    let restaurant = context
        .get("restaurant_name")
        .and_then(|v| v.as_str())
        .unwrap_or("the restaurant");
    let subject = match t {
        NotificationType::PrinterOffline => format!("[{restaurant}] Printer offline"),
        NotificationType::PrinterOnline => format!("[{restaurant}] Printer back online"),
        NotificationType::InternetOffline => format!("[{restaurant}] Internet connectivity lost"),
        NotificationType::InternetOnline => format!("[{restaurant}] Internet connectivity restored"),
        NotificationType::SystemError => format!("[{restaurant}] System error"),
        NotificationType::RecoveryFailed => format!("[{restaurant}] Recovery failed"),
        NotificationType::RecoveryCompleted => format!("[{restaurant}] Recovery completed"),
        NotificationType::QueueOverflow => format!("[{restaurant}] Offline queue full"),
        NotificationType::ServiceRestart => format!("[{restaurant}] Service restarted"),
    };
    let body = format!("{subject}\n\ndetails: {context}");
    (subject, body)
}
