//! HTTP API: submission, status, attempts, batch queries, health probes, and
//! the Prometheus scrape endpoint.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use herald_common::{DispatchError, OpKind};
use herald_coord::{RateDecision, RateLimiter};
use herald_store::{NotificationStore, NotificationSummary};

use crate::submit::{SubmissionService, SubmitRequest};

const TENANT_HEADER: &str = "X-Tenant-Id";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const DEFAULT_TENANT: &str = "default";

pub struct ApiState {
    pub submission: SubmissionService,
    pub store: Arc<dyn NotificationStore>,
    pub limiter: Arc<dyn RateLimiter>,
    pub rate_limiting: bool,
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct ProbeResponse {
    pub status: String,
}

/// Map the dispatch error taxonomy onto HTTP statuses.
fn error_response(error: DispatchError) -> Response {
    let status = match &error {
        DispatchError::InvalidPayload(_)
        | DispatchError::TemplateNotFound(_)
        | DispatchError::TemplateInvalid(_) => StatusCode::BAD_REQUEST,
        DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::VersionConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = ErrorBody {
        error: error.to_string(),
        code: error.code().to_string(),
    };

    (status, Json(body)).into_response()
}

fn tenant_id(headers: &HeaderMap) -> String {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_TENANT)
        .to_string()
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/notifications", post(submit_handler))
        .route("/v1/notifications/{id}", get(status_handler))
        .route("/v1/notifications/{id}/attempts", get(attempts_handler))
        .route(
            "/v1/batches/{batch_id}/notifications",
            get(batch_handler),
        )
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/metrics", get(metrics_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn submit_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let tenant = tenant_id(&headers);
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok());

    match state
        .submission
        .submit(&tenant, request, idempotency_key)
        .await
    {
        Ok(accepted) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                id: accepted.id,
                duplicate: accepted.duplicate,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn status_gate(state: &ApiState, tenant: &str) -> Result<(), DispatchError> {
    if !state.rate_limiting {
        return Ok(());
    }
    let decision = state
        .limiter
        .check(OpKind::Status, tenant)
        .await
        .map_err(|e| DispatchError::Internal(e.to_string()))?;
    match decision {
        RateDecision::Allowed { .. } => Ok(()),
        RateDecision::Limited { .. } => Err(DispatchError::RateLimited {
            op: OpKind::Status.to_string(),
            client: tenant.to_string(),
        }),
    }
}

async fn status_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let tenant = tenant_id(&headers);
    if let Err(e) = status_gate(&state, &tenant).await {
        return error_response(e);
    }

    match state.store.get_status(id).await {
        Ok(Some(summary)) => status_body(summary).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("notification not found: {id}"),
                code: "not_found".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(DispatchError::Internal(e.to_string())),
    }
}

fn status_body(summary: NotificationSummary) -> Json<serde_json::Value> {
    Json(json!({
        "id": summary.id,
        "channel": summary.channel,
        "status": summary.status,
        "attempt_count": summary.attempt_count,
        "latest_vendor": summary.latest_vendor,
        "last_error": summary.last_error,
        "created_at": summary.created_at,
        "queued_at": summary.queued_at,
        "processing_started_at": summary.processing_started_at,
        "completed_at": summary.completed_at,
    }))
}

async fn attempts_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let tenant = tenant_id(&headers);
    if let Err(e) = status_gate(&state, &tenant).await {
        return error_response(e);
    }

    match state.store.get_attempts(id).await {
        Ok(attempts) => Json(attempts).into_response(),
        Err(e) => error_response(DispatchError::Internal(e.to_string())),
    }
}

async fn batch_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(batch_id): Path<String>,
) -> Response {
    let tenant = tenant_id(&headers);
    if let Err(e) = status_gate(&state, &tenant).await {
        return error_response(e);
    }

    match state.store.list_by_batch(&tenant, &batch_id).await {
        Ok(notifications) => {
            let ids: Vec<serde_json::Value> = notifications
                .iter()
                .map(|n| {
                    json!({
                        "id": n.id,
                        "status": n.status,
                        "channel": n.channel,
                        "created_at": n.created_at,
                    })
                })
                .collect();
            Json(json!({"batch_id": batch_id, "notifications": ids})).into_response()
        }
        Err(e) => error_response(DispatchError::Internal(e.to_string())),
    }
}

async fn health_handler() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "UP".to_string(),
    })
}

async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "ALIVE".to_string(),
    })
}

async fn readiness_probe(State(state): State<Arc<ApiState>>) -> Response {
    // Ready once the store answers; a probe id never exists, which is fine
    match state.store.get(Uuid::nil()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ProbeResponse {
                status: "READY".to_string(),
            }),
        )
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse {
                status: "NOT_READY".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<ApiState>>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not configured").into_response(),
    }
}
