//! Operator/monitoring HTTP surface (spec §6) plus the order-ingest webhook
//! route. Kept the teacher's axum wiring — `IntoResponse for DaemonError`,
//! a `ServiceBuilder` layering `TraceLayer`+`CorsLayer`, `create_router`/
//! `start_api_server` — and replaced the print/queue/telemetry endpoints
//! with the resilience core's status surface.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStatus};
use crate::errors::{DaemonError, Result};
use crate::ingest::{OrderIngest, SubmissionMode, SubmissionResult};
use crate::models::{NotificationType, RecoveryType};
use crate::notification::NotificationService;
use crate::offline_queue::OfflineQueue;
use crate::print_manager::PrintManager;
use crate::recovery::RecoveryManager;

#[derive(Clone)]
pub struct ApiState {
    pub ingest: Arc<OrderIngest>,
    pub print_manager: Arc<PrintManager>,
    pub offline_queue: Arc<OfflineQueue>,
    pub recovery: Arc<RecoveryManager>,
    pub circuit_registry: Arc<CircuitBreakerRegistry>,
    pub health: Arc<crate::health::HealthMonitor>,
    pub notifications: Arc<NotificationService>,
    pub start_time: std::time::Instant,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::Validation(_) => StatusCode::BAD_REQUEST,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::Config(_) => StatusCode::BAD_REQUEST,
            DaemonError::Recovery(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

// ---- order ingest ------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubmitOrderResponse {
    order_id: String,
    jobs_created: u32,
    mode: &'static str,
}

impl From<SubmissionResult> for SubmitOrderResponse {
    fn from(r: SubmissionResult) -> Self {
        Self {
            order_id: r.order_id,
            jobs_created: r.jobs_created,
            mode: match r.mode {
                SubmissionMode::Online => "online",
                SubmissionMode::Offline => "offline",
            },
        }
    }
}

/// `POST /orders` — the webhook target an e-commerce backend posts new
/// orders to (spec §6, "Order ingest surface").
async fn submit_order(
    State(state): State<ApiState>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<SubmitOrderResponse>> {
    let result = state.ingest.submit_order(payload).await;
    state.health.record_webhook_result(result.is_ok());
    Ok(Json(result?.into()))
}

// ---- recovery -----------------------------------------------------------

#[derive(Debug, Serialize)]
struct RecoverySessionResponse {
    active: bool,
    session: Option<crate::models::RecoverySession>,
}

async fn get_recovery_status(State(state): State<ApiState>) -> Json<RecoverySessionResponse> {
    let session = state.recovery.current_session().await;
    Json(RecoverySessionResponse {
        active: session.as_ref().map(|s| s.phase.is_active()).unwrap_or(false),
        session,
    })
}

#[derive(Debug, Deserialize)]
struct TriggerRecoveryRequest {
    recovery_type: RecoveryType,
}

async fn trigger_recovery(
    State(state): State<ApiState>,
    Json(request): Json<TriggerRecoveryRequest>,
) -> Result<Json<crate::models::RecoverySession>> {
    let session = state.recovery.trigger_manual(request.recovery_type).await?;
    Ok(Json(session))
}

// ---- statistics ---------------------------------------------------------

#[derive(Debug, Serialize)]
struct QueueStatisticsResponse {
    queued: u64,
    oldest_queued_age_hours: Option<f64>,
    expiring_within_hour: u32,
    urgency: String,
}

async fn queue_statistics(State(state): State<ApiState>) -> Result<Json<QueueStatisticsResponse>> {
    let stats = state.offline_queue.statistics().await?;
    let recovery_stats = state.offline_queue.recovery_statistics().await?;
    Ok(Json(QueueStatisticsResponse {
        queued: stats.queued,
        oldest_queued_age_hours: recovery_stats.oldest_queued_age_hours,
        expiring_within_hour: recovery_stats.expiring_within_hour,
        urgency: format!("{:?}", recovery_stats.urgency).to_lowercase(),
    }))
}

async fn job_statistics(
    State(state): State<ApiState>,
) -> Result<Json<crate::print_manager::PrintStatistics>> {
    Ok(Json(state.print_manager.statistics().await?))
}

// ---- retry / dead-letter -------------------------------------------------

async fn dead_letter_list(
    State(state): State<ApiState>,
) -> Json<Vec<crate::retry::DeadLetterEntry>> {
    Json(state.print_manager.retry_manager().dead_letter_queue().list().await)
}

/// Clears the dead-letter entry and resets the underlying print job back
/// to `pending` with a clean attempt count, so the next poll cycle picks
/// it up fresh (spec §4.6: "a re-queue primitive clears attempts and
/// returns it for a fresh run").
async fn dead_letter_requeue(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<StatusCode> {
    state
        .print_manager
        .retry_manager()
        .dead_letter_queue()
        .requeue(&task_id)
        .await
        .ok_or_else(|| DaemonError::NotFound(format!("dead-letter entry '{task_id}' not found")))?;
    state.print_manager.requeue_job(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- health ---------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<Vec<crate::models::HealthMetric>> {
    Json(state.health.snapshot().await)
}

async fn run_health_check(State(state): State<ApiState>) -> Json<Vec<crate::models::HealthMetric>> {
    state.health.sample_all().await;
    Json(state.health.snapshot().await)
}

// ---- circuit breakers ------------------------------------------------------

async fn get_circuit(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<CircuitBreakerStatus>> {
    let breaker = state
        .circuit_registry
        .get(&name)
        .await
        .ok_or_else(|| DaemonError::NotFound(format!("circuit '{name}' is not registered")))?;
    Ok(Json(breaker.status().await))
}

async fn reset_circuit(State(state): State<ApiState>, Path(name): Path<String>) -> Result<StatusCode> {
    let breaker = state
        .circuit_registry
        .get(&name)
        .await
        .ok_or_else(|| DaemonError::NotFound(format!("circuit '{name}' is not registered")))?;
    breaker.reset().await;
    Ok(StatusCode::NO_CONTENT)
}

// ---- notifications ----------------------------------------------------

async fn notifications_status(
    State(state): State<ApiState>,
) -> Json<crate::notification::NotificationStats> {
    Json(state.notifications.stats().await)
}

async fn test_notification(State(state): State<ApiState>) -> StatusCode {
    state
        .notifications
        .notify(
            NotificationType::SystemError,
            serde_json::json!({ "reason": "operator-requested test notification" }),
        )
        .await;
    StatusCode::ACCEPTED
}

// ---- router ---------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/orders", post(submit_order))
        .route("/status/recovery", get(get_recovery_status))
        .route("/recovery/trigger", post(trigger_recovery))
        .route("/statistics/queue", get(queue_statistics))
        .route("/statistics/jobs", get(job_statistics))
        .route("/retry/dead-letter", get(dead_letter_list))
        .route("/retry/dead-letter/:task_id/requeue", post(dead_letter_requeue))
        .route("/health", get(get_health))
        .route("/health/check", post(run_health_check))
        .route("/circuit/:name", get(get_circuit))
        .route("/circuit/:name/reset", post(reset_circuit))
        .route("/notifications/status", get(notifications_status))
        .route("/notifications/test", post(test_notification))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(AllowOrigin::predicate(|origin, _| {
                        let o = origin.as_bytes();
                        o.starts_with(b"http://localhost") || o.starts_with(b"http://127.0.0.1")
                    }))
                    .allow_methods([
                        axum::http::Method::GET,
                        axum::http::Method::POST,
                        axum::http::Method::OPTIONS,
                    ])
                    .allow_headers(tower_http::cors::Any),
            ),
        )
        .with_state(state)
}

pub async fn start_api_server(addr: &str, state: ApiState) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);
    info!("starting operator HTTP API on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await.map_err(|e| {
        error!(error = %e, "operator HTTP API server error");
        e.into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::connectivity::ConnectivityMonitor;
    use crate::printer::DummyAdapter;
    use crate::store::Store;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> ApiState {
        let store = Store::open_in_memory().await.unwrap();
        let printer = Arc::new(DummyAdapter::new());
        let offline_queue = Arc::new(OfflineQueue::new(store.clone()));
        let notifications = Arc::new(NotificationService::new(store.clone()));
        let print_manager = Arc::new(PrintManager::new(
            store.clone(),
            printer.clone(),
            offline_queue.clone(),
            notifications.clone(),
        ));
        let connectivity = Arc::new(ConnectivityMonitor::new(printer, store.clone()));
        let recovery = Arc::new(RecoveryManager::new(
            store.clone(),
            offline_queue.clone(),
            Arc::new(DummyAdapter::new()),
            print_manager.clone(),
            notifications.clone(),
        ));
        let health = Arc::new(crate::health::HealthMonitor::new(store.clone()));
        let ingest = Arc::new(OrderIngest::new(
            store.clone(),
            offline_queue.clone(),
            connectivity,
            notifications.clone(),
            AppConfig::default(),
        ));

        ApiState {
            ingest,
            print_manager,
            offline_queue,
            recovery,
            circuit_registry: Arc::new(CircuitBreakerRegistry::new()),
            health,
            notifications,
            start_time: std::time::Instant::now(),
        }
    }

    #[tokio::test]
    async fn submit_order_endpoint_returns_jobs_created() {
        let state = test_state().await;
        let app = create_router(state);

        let payload = serde_json::json!({
            "external_order_id": "ext-1",
            "items": [{"name": "Nam Tok", "quantity": 1, "unit_price": 18.5}],
            "customer": {"email": "a@example.com"},
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/orders")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&payload).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_circuit_returns_not_found() {
        let state = test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/circuit/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let state = test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
