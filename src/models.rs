//! Data model shared by every component. These types mirror the persisted
//! schema in `store`; components never hold their own copy of durable state
//! beyond the in-memory indexes documented on each component.

use serde::{Deserialize, Serialize};

pub type Timestamp = chrono::DateTime<chrono::Utc>;

fn now() -> Timestamp {
    chrono::Utc::now()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub variant: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Customer {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Customer {
    pub fn has_contact(&self) -> bool {
        self.name.is_some() || self.email.is_some() || self.phone.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delivery {
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub external_order_id: String,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub customer: Customer,
    pub delivery: Delivery,
    pub total_amount: f64,
    pub currency: String,
    pub created_at: Timestamp,
    pub raw_payload: serde_json::Value,
}

impl Order {
    /// Validates the invariants spec §3 places on an `Order` before it is
    /// ever persisted. Validation failures are rejected at ingest, never
    /// stored (spec §7, "Validation" error kind).
    pub fn validate(&self) -> Result<(), String> {
        if self.items.is_empty() {
            return Err("order must have at least one item".to_string());
        }
        for item in &self.items {
            if item.quantity == 0 {
                return Err(format!("item '{}' has zero quantity", item.name));
            }
            if item.unit_price < 0.0 {
                return Err(format!("item '{}' has negative unit price", item.name));
            }
        }
        if self.total_amount < 0.0 {
            return Err("total_amount must be non-negative".to_string());
        }
        if !self.customer.has_contact() {
            return Err("customer must have at least one contact method".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Kitchen,
    Service,
    Customer,
    Other,
}

impl JobType {
    /// Priority a job gets when bumped into the offline queue (spec §4.2
    /// step 2): kitchen tickets matter most, customer receipts least.
    pub fn offline_priority(self) -> QueuePriority {
        match self {
            JobType::Kitchen => QueuePriority::High,
            JobType::Customer => QueuePriority::Low,
            JobType::Service | JobType::Other => QueuePriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintJobStatus {
    Pending,
    Printing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: String,
    pub order_id: String,
    pub job_type: JobType,
    pub status: PrintJobStatus,
    pub content: Vec<u8>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub printed_at: Option<Timestamp>,
    pub error_message: Option<String>,
}

impl PrintJob {
    pub fn new(order_id: impl Into<String>, job_type: JobType, content: Vec<u8>) -> Self {
        let ts = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            job_type,
            status: PrintJobStatus::Pending,
            content,
            attempts: 0,
            max_attempts: 3,
            created_at: ts,
            updated_at: ts,
            printed_at: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineQueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Order,
    PrintJob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueItem {
    pub id: String,
    pub item_type: ItemType,
    pub item_id: String,
    pub priority: QueuePriority,
    pub status: OfflineQueueStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub retry_count: u32,
    pub max_retries: u32,
    pub expires_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl OfflineQueueItem {
    pub fn new(item_type: ItemType, item_id: impl Into<String>, priority: QueuePriority) -> Self {
        let ts = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_type,
            item_id: item_id.into(),
            priority,
            status: OfflineQueueStatus::Queued,
            created_at: ts,
            updated_at: ts,
            retry_count: 0,
            max_retries: 3,
            expires_at: Some(ts + chrono::Duration::hours(24)),
            error_message: None,
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Printer,
    Internet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Online,
    Offline,
    Degraded,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub status: ConnectivityStatus,
    pub last_online_at: Option<Timestamp>,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            status: ConnectivityStatus::Unknown,
            last_online_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityEventType {
    PrinterOnline,
    PrinterOffline,
    InternetOnline,
    InternetOffline,
    ConnectivityRestored,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    pub id: String,
    pub event_type: ConnectivityEventType,
    pub component: ComponentKind,
    pub status: ConnectivityStatus,
    pub timestamp: Timestamp,
    pub duration_offline_secs: Option<i64>,
    pub details: serde_json::Value,
}

impl ConnectivityEvent {
    pub fn new(
        event_type: ConnectivityEventType,
        component: ComponentKind,
        status: ConnectivityStatus,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            component,
            status,
            timestamp: now(),
            duration_offline_secs: None,
            details: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryType {
    Printer,
    Internet,
    Combined,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPhase {
    Idle,
    Validation,
    Processing,
    Completion,
    Failed,
}

impl RecoveryPhase {
    pub fn is_active(self) -> bool {
        matches!(self, RecoveryPhase::Validation | RecoveryPhase::Processing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    pub id: String,
    pub recovery_type: RecoveryType,
    pub phase: RecoveryPhase,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub items_total: u32,
    pub items_processed: u32,
    pub items_failed: u32,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl RecoverySession {
    pub fn new(recovery_type: RecoveryType) -> Self {
        let ts = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recovery_type,
            phase: RecoveryPhase::Idle,
            started_at: ts,
            updated_at: ts,
            completed_at: None,
            items_total: 0,
            items_processed: 0,
            items_failed: 0,
            error_message: None,
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<Timestamp>,
    pub state_changed_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    PrinterOffline,
    PrinterError,
    NetworkError,
    ResourceUnavailable,
    TemporaryError,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    FixedDelay,
    Immediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttemptRecord {
    pub attempt_number: u32,
    pub timestamp: Timestamp,
    pub delay_before_secs: f64,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthResourceType {
    Memory,
    Cpu,
    Disk,
    Threads,
    Webhook,
    PublicUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetric {
    pub resource_type: HealthResourceType,
    pub timestamp: Timestamp,
    pub value: f64,
    pub status: HealthStatus,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PrinterOffline,
    PrinterOnline,
    InternetOffline,
    InternetOnline,
    SystemError,
    RecoveryFailed,
    RecoveryCompleted,
    QueueOverflow,
    ServiceRestart,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_order() -> Order {
        Order {
            id: "ord-1".to_string(),
            external_order_id: "ext-1".to_string(),
            status: OrderStatus::Pending,
            items: vec![OrderItem {
                id: "item-1".to_string(),
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
            created_at: now(),
            raw_payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn order_requires_items() {
        let mut order = valid_order();
        order.items.clear();
        assert!(order.validate().is_err());
    }

    #[test]
    fn order_requires_positive_quantity() {
        let mut order = valid_order();
        order.items[0].quantity = 0;
        assert!(order.validate().is_err());
    }

    #[test]
    fn order_requires_contact() {
        let mut order = valid_order();
        order.customer = Customer::default();
        assert!(order.validate().is_err());
    }

    #[test]
    fn valid_order_passes() {
        assert!(valid_order().validate().is_ok());
    }

    #[test]
    fn kitchen_jobs_get_high_offline_priority() {
        assert_eq!(JobType::Kitchen.offline_priority(), QueuePriority::High);
        assert_eq!(JobType::Customer.offline_priority(), QueuePriority::Low);
        assert_eq!(JobType::Service.offline_priority(), QueuePriority::Normal);
    }
}
