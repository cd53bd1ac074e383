//! Circuit Breaker (spec §4.5). Grounded on the teacher's lock-around-
//! counters / execute-without-holding-the-lock structure, but the
//! transition semantics are the spec's, not the teacher's: the teacher
//! opens on a rolling time-window of failure timestamps, while the spec
//! wants a simple consecutive-failure counter with an explicit
//! `successThreshold` to close from half-open. Failure-cause classification
//! (original_source's `circuit_breaker.py`) is tracked for statistics only
//! — it never affects state transitions, per spec §4.5.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::{DaemonError, Result};
use crate::models::CircuitState;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub call_timeout: Option<Duration>,
}

impl CircuitBreakerConfig {
    pub const PRINTER: Self = Self {
        failure_threshold: 5,
        success_threshold: 3,
        timeout: Duration::from_secs(30),
        call_timeout: Some(Duration::from_secs(10)),
    };
    pub const EXTERNAL_API: Self = Self {
        failure_threshold: 3,
        success_threshold: 2,
        timeout: Duration::from_secs(60),
        call_timeout: Some(Duration::from_secs(30)),
    };
    pub const SMTP: Self = Self {
        failure_threshold: 2,
        success_threshold: 1,
        timeout: Duration::from_secs(120),
        call_timeout: Some(Duration::from_secs(30)),
    };
    pub const DATABASE: Self = Self {
        failure_threshold: 3,
        success_threshold: 2,
        timeout: Duration::from_secs(30),
        call_timeout: Some(Duration::from_secs(10)),
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Timeout,
    Connection,
    Authentication,
    RateLimit,
    Service,
    Unknown,
}

impl FailureCause {
    pub fn classify(message: &str) -> Self {
        let m = message.to_ascii_lowercase();
        if m.contains("timeout") || m.contains("timed out") {
            Self::Timeout
        } else if m.contains("connect") || m.contains("connection") || m.contains("offline") {
            Self::Connection
        } else if m.contains("auth") || m.contains("unauthorized") || m.contains("forbidden") {
            Self::Authentication
        } else if m.contains("rate limit") || m.contains("429") || m.contains("too many requests") {
            Self::RateLimit
        } else if m.contains("service") || m.contains("5") {
            Self::Service
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Default)]
struct CauseCounts {
    timeout: u64,
    connection: u64,
    authentication: u64,
    rate_limit: u64,
    service: u64,
    unknown: u64,
}

impl CauseCounts {
    fn record(&mut self, cause: FailureCause) {
        match cause {
            FailureCause::Timeout => self.timeout += 1,
            FailureCause::Connection => self.connection += 1,
            FailureCause::Authentication => self.authentication += 1,
            FailureCause::RateLimit => self.rate_limit += 1,
            FailureCause::Service => self.service += 1,
            FailureCause::Unknown => self.unknown += 1,
        }
    }
}

struct State {
    current: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    state_changed_at: std::time::Instant,
    causes: CauseCounts,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_failures_prevented: u64,
    pub circuit_opens: u64,
    pub circuit_closes: u64,
}

/// A named, thread-safe per-dependency state machine. Multiple instances
/// (printer, external API, SMTP, database) are held by `CircuitBreakerRegistry`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
    total_failures_prevented: AtomicU64,
    circuit_opens: AtomicU64,
    circuit_closes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State {
                current: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                state_changed_at: std::time::Instant::now(),
                causes: CauseCounts::default(),
            }),
            total_failures_prevented: AtomicU64::new(0),
            circuit_opens: AtomicU64::new(0),
            circuit_closes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executes `op` through the breaker. `CircuitOpen` is a fast failure
    /// that does not count against the breaker itself (spec §4.5, §7: the
    /// Retry Manager treats it as transient but it's not an additional
    /// failure).
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        {
            let mut state = self.state.lock().await;
            if state.current == CircuitState::Open {
                if state.state_changed_at.elapsed() >= self.config.timeout {
                    info!(breaker = %self.name, "transitioning open -> half_open");
                    state.current = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.state_changed_at = std::time::Instant::now();
                } else {
                    self.total_failures_prevented.fetch_add(1, Ordering::Relaxed);
                    return Err(DaemonError::CircuitOpen(self.name.clone()));
                }
            }
        }

        let result = if let Some(call_timeout) = self.config.call_timeout {
            match tokio::time::timeout(call_timeout, op()).await {
                Ok(r) => r,
                Err(_) => Err(DaemonError::Network(format!(
                    "call through breaker '{}' timed out after {:?}",
                    self.name, call_timeout
                ))),
            }
        } else {
            op().await
        };

        self.record(&result).await;
        result
    }

    async fn record<T>(&self, result: &Result<T>) {
        let mut state = self.state.lock().await;
        match result {
            Ok(_) => match state.current {
                CircuitState::Closed => {
                    state.failure_count = 0;
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        info!(breaker = %self.name, "transitioning half_open -> closed");
                        state.current = CircuitState::Closed;
                        state.failure_count = 0;
                        state.state_changed_at = std::time::Instant::now();
                        self.circuit_closes.fetch_add(1, Ordering::Relaxed);
                    }
                }
                CircuitState::Open => {}
            },
            Err(e) => {
                if matches!(e, DaemonError::CircuitOpen(_)) {
                    return;
                }
                state.causes.record(FailureCause::classify(&e.to_string()));
                state.last_failure_at = Some(chrono::Utc::now());
                match state.current {
                    CircuitState::Closed => {
                        state.failure_count += 1;
                        if state.failure_count >= self.config.failure_threshold {
                            warn!(breaker = %self.name, "transitioning closed -> open");
                            state.current = CircuitState::Open;
                            state.state_changed_at = std::time::Instant::now();
                            self.circuit_opens.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    CircuitState::HalfOpen => {
                        warn!(breaker = %self.name, "transitioning half_open -> open");
                        state.current = CircuitState::Open;
                        state.failure_count = self.config.failure_threshold;
                        state.state_changed_at = std::time::Instant::now();
                        self.circuit_opens.fetch_add(1, Ordering::Relaxed);
                    }
                    CircuitState::Open => {}
                }
            }
        }
    }

    pub async fn status(&self) -> CircuitBreakerStatus {
        let state = self.state.lock().await;
        CircuitBreakerStatus {
            state: state.current,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_failures_prevented: self.total_failures_prevented.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
            circuit_closes: self.circuit_closes.load(Ordering::Relaxed),
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.current = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.state_changed_at = std::time::Instant::now();
    }
}

/// Per-dependency registry, mirroring the teacher's `CircuitBreakerRegistry`
/// (a `Mutex<HashMap<name, Arc<CircuitBreaker>>>` guarding lazily-created
/// breakers) but keyed by logical dependency rather than printer id.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<std::collections::HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self {
            breakers: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Registers a breaker instance the caller constructed itself — used to
    /// make a breaker owned by another component (e.g. `PrintManager`'s
    /// "printer" breaker) visible on the operator surface under its name.
    pub async fn insert(&self, breaker: Arc<CircuitBreaker>) {
        self.breakers.lock().await.insert(breaker.name().to_string(), breaker);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.breakers.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            call_timeout: None,
        }
    }

    #[tokio::test]
    async fn opens_after_exactly_failure_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("printer", fast_config());
        for _ in 0..2 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(DaemonError::Printer("boom".to_string())) })
                .await;
        }
        assert_eq!(breaker.status().await.state, CircuitState::Closed);

        let _ = breaker
            .execute(|| async { Err::<(), _>(DaemonError::Printer("boom".to_string())) })
            .await;
        assert_eq!(breaker.status().await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_counting_against_breaker() {
        let breaker = CircuitBreaker::new("printer", fast_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(DaemonError::Printer("boom".to_string())) })
                .await;
        }
        let result = breaker.execute(|| async { Ok::<_, DaemonError>(()) }).await;
        assert!(matches!(result, Err(DaemonError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold_successes() {
        let breaker = CircuitBreaker::new("printer", fast_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(DaemonError::Printer("boom".to_string())) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = breaker.execute(|| async { Ok::<_, DaemonError>(()) }).await;
        assert_eq!(breaker.status().await.state, CircuitState::HalfOpen);

        let _ = breaker.execute(|| async { Ok::<_, DaemonError>(()) }).await;
        assert_eq!(breaker.status().await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("printer", fast_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(DaemonError::Printer("boom".to_string())) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = breaker
            .execute(|| async { Err::<(), _>(DaemonError::Printer("boom".to_string())) })
            .await;
        assert_eq!(breaker.status().await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_count() {
        let breaker = CircuitBreaker::new("printer", fast_config());
        let _ = breaker
            .execute(|| async { Err::<(), _>(DaemonError::Printer("boom".to_string())) })
            .await;
        let _ = breaker.execute(|| async { Ok::<_, DaemonError>(()) }).await;
        assert_eq!(breaker.status().await.failure_count, 0);
    }
}
