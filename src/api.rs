//! HTTP interface for CI and operators.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/deployments` | Submit a deployment, `202` with a tracking id |
//! | GET | `/deployments` | Recent records, newest first (`?limit=`) |
//! | GET | `/deployments/active` | The active record |
//! | GET | `/deployments/{id}` | Tracking state of a submission |
//! | DELETE | `/deployments/{id}` | Withdraw a queued submission |
//! | GET | `/status` | Reconciler phase and queue |
//! | GET | `/healthz` | Liveness |
//!
//! When a token is configured, `/deployments` routes require
//! `Authorization: Bearer <token>`.

use std::{future::Future, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::image::Digest;
use crate::intake::{
    DeploymentQueue, DeploymentRequest, Intake, SubmitError, TrackedState, WithdrawError,
};
use crate::model::{DeploymentRecord, ServiceStatus};
use crate::store::StateStore;

const DEFAULT_HISTORY: usize = 20;
const MAX_HISTORY: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub intake: Arc<Intake>,
    pub queue: Arc<DeploymentQueue>,
    pub store: Arc<StateStore>,
    pub token: Option<Arc<str>>,
}

pub enum ApiError {
    InvalidSpec(String),
    NotFound(String),
    Conflict(String, Option<Uuid>),
    Unavailable(String),
    Unauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::InvalidSpec(detail) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "InvalidSpec", "detail": detail }),
            ),
            Self::NotFound(detail) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "NotFound", "detail": detail }),
            ),
            Self::Conflict(detail, id) => (
                StatusCode::CONFLICT,
                json!({ "error": "Conflict", "detail": detail, "id": id }),
            ),
            Self::Unavailable(detail) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "Unavailable", "detail": detail }),
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Unauthorized", "detail": "missing or invalid bearer token" }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match &error {
            SubmitError::InvalidSpec(detail) => Self::InvalidSpec(detail.clone()),
            SubmitError::Conflict(id) => Self::Conflict(error.to_string(), Some(*id)),
            SubmitError::Unavailable(_) => Self::Unavailable(error.to_string()),
        }
    }
}

pub fn build_router(state: ApiState) -> Router {
    let deployments = Router::new()
        .route("/deployments", get(list_deployments).post(submit_deployment))
        .route("/deployments/active", get(active_deployment))
        .route(
            "/deployments/{id}",
            get(get_deployment).delete(withdraw_deployment),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .merge(deployments)
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Deployment API listening on {addr}");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn require_token(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.token {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if provided != Some(expected.as_ref()) {
            log::warn!("Rejected unauthenticated request to {}", request.uri());
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

/// POST /deployments
async fn submit_deployment(
    State(state): State<ApiState>,
    body: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidSpec(e.body_text()))?;
    let id = state.intake.submit(request).await.map_err(|e| {
        log::warn!("Deployment request rejected: {e}");
        ApiError::from(e)
    })?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// GET /deployments
async fn list_deployments(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<DeploymentRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY).min(MAX_HISTORY);
    Json(state.store.history(limit))
}

/// GET /deployments/active
async fn active_deployment(
    State(state): State<ApiState>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    state
        .store
        .active()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no deployment has succeeded yet".to_string()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceView {
    name: String,
    image: String,
    digest: Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ServiceStatus>,
}

#[derive(Serialize)]
struct DeploymentView {
    id: Uuid,
    #[serde(flatten)]
    state: TrackedState,
    services: Vec<ServiceView>,
}

/// GET /deployments/{id}
async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeploymentView>, ApiError> {
    let tracked = state.queue.status(id);
    let record = match &tracked {
        Some(tracked) => match tracked.state {
            TrackedState::Completed { record_id, .. } => state.store.get(record_id),
            _ => None,
        },
        // Submitted before the last restart, or looked up by record id
        None => state
            .store
            .find_by_spec(id)
            .or_else(|| state.store.get(id)),
    };

    let view = match (tracked, record) {
        (tracked, Some(record)) => DeploymentView {
            id,
            state: tracked.map(|t| t.state).unwrap_or(TrackedState::Completed {
                result: record.result,
                record_id: record.id,
            }),
            services: record
                .services
                .values()
                .map(|service| ServiceView {
                    name: service.settings.name.clone(),
                    image: service.image.to_string(),
                    digest: service.digest,
                    container_id: service.container_id.clone(),
                    status: Some(service.status),
                })
                .collect(),
        },
        (Some(tracked), None) => DeploymentView {
            id,
            state: tracked.state,
            services: tracked
                .services
                .iter()
                .map(|service| ServiceView {
                    name: service.name().to_string(),
                    image: service.image.to_string(),
                    digest: service.digest,
                    container_id: None,
                    status: None,
                })
                .collect(),
        },
        (None, None) => return Err(ApiError::NotFound(format!("unknown deployment {id}"))),
    };
    Ok(Json(view))
}

/// DELETE /deployments/{id}
async fn withdraw_deployment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    match state.queue.withdraw(id) {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(WithdrawError::NotFound(_)) if state.store.find_by_spec(id).is_some() => Err(
            ApiError::Conflict(format!("deployment {id} already concluded"), Some(id)),
        ),
        Err(e @ WithdrawError::NotFound(_)) => Err(ApiError::NotFound(e.to_string())),
        Err(e @ WithdrawError::NotQueued(_)) => Err(ApiError::Conflict(e.to_string(), Some(id))),
    }
}

/// GET /status
async fn status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "phase": state.queue.phase(),
        "queueLength": state.queue.len(),
        "acceptedTotal": state.queue.accepted_total(),
        "activeId": state.store.active_id(),
        "halted": state.queue.is_halted(),
    }))
}

/// GET /healthz
async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    if state.queue.is_halted() {
        (StatusCode::SERVICE_UNAVAILABLE, "halted")
    } else {
        (StatusCode::OK, "ok")
    }
}
