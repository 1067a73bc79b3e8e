//! HTTP surface for the portal's UI and API collaborators.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::audit::AuditEntry;
use crate::config::ConfigHandle;
use crate::engine::{BatchResult, EscalationEngine, Trigger};
use crate::error::{ErrorKind, EscalationError};
use crate::lifecycle::{NewTicket, StatusService, TicketView};
use crate::state_machine::{Priority, Ticket, TicketId, TicketStatus};

/// Header the upstream auth layer sets to the acting user.
pub const ACTOR_HEADER: &str = "x-actor";
const ANONYMOUS: &str = "anonymous";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EscalationEngine>,
    pub status: Arc<StatusService>,
    pub config: ConfigHandle,
}

impl AppState {
    pub fn new(engine: Arc<EscalationEngine>, status: Arc<StatusService>, config: ConfigHandle) -> Self {
        Self {
            engine,
            status,
            config,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/priority-updates",
            get(priority_update_status).post(trigger_priority_update),
        )
        .route("/tickets", post(create_ticket))
        .route("/tickets/:id", get(get_ticket))
        .route("/tickets/:id/audit", get(get_audit))
        .route("/tickets/:id/status", post(set_status))
        .route("/tickets/:id/reopen", post(reopen_ticket))
        .route("/tickets/:id/assign", post(assign_ticket))
        .route("/config/reload", post(reload_config))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("listening on http://{}", bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    Ok(())
}

/// JSON error body `{error, message}` with a status code per error kind.
pub struct ApiError(EscalationError);

impl From<EscalationError> for ApiError {
    fn from(e: EscalationError) -> Self {
        ApiError(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidTransition
        | ErrorKind::ReopenWindowExpired
        | ErrorKind::ConcurrentModification
        | ErrorKind::Busy => StatusCode::CONFLICT,
        ErrorKind::Repository => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Config => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = Json(json!({
            "error": kind,
            "message": self.0.to_string(),
        }));
        (status_for(kind), body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RunMode {
    #[default]
    Join,
    Reject,
}

#[derive(Debug, Default, Deserialize)]
struct RunParams {
    #[serde(default)]
    mode: RunMode,
}

async fn trigger_priority_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RunParams>,
) -> ApiResult<Json<BatchResult>> {
    let trigger = Trigger::manual(actor(&headers));
    let result = match params.mode {
        RunMode::Join => state.engine.run(trigger).await?,
        RunMode::Reject => state.engine.try_run(trigger).await?,
    };
    Ok(Json(result))
}

async fn priority_update_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "running": state.engine.is_running() }))
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    category: String,
    #[serde(default)]
    sub_category: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

async fn create_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> ApiResult<(StatusCode, Json<Ticket>)> {
    let priority = body
        .priority
        .as_deref()
        .map(str::parse::<Priority>)
        .transpose()?;
    let new = NewTicket {
        category: body.category,
        sub_category: body.sub_category,
        priority,
    };
    let ticket = state.status.create(new, &actor(&headers)).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TicketView>> {
    Ok(Json(state.status.view(&TicketId::new(id)).await?))
}

async fn get_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    Ok(Json(state.status.history(&TicketId::new(id)).await?))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> ApiResult<Json<Ticket>> {
    let target: TicketStatus = body.status.parse()?;
    let ticket = state
        .status
        .transition(&TicketId::new(id), target, &actor(&headers))
        .await?;
    Ok(Json(ticket))
}

#[derive(Debug, Deserialize)]
struct ReopenBody {
    #[serde(default)]
    reason: String,
}

async fn reopen_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReopenBody>,
) -> ApiResult<Json<Ticket>> {
    let ticket = state
        .status
        .reopen(&TicketId::new(id), &actor(&headers), &body.reason)
        .await?;
    Ok(Json(ticket))
}

#[derive(Debug, Deserialize)]
struct AssignBody {
    assignee: String,
}

async fn assign_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AssignBody>,
) -> ApiResult<Json<Ticket>> {
    let ticket = state
        .status
        .assign(&TicketId::new(id), &body.assignee, &actor(&headers))
        .await?;
    Ok(Json(ticket))
}

async fn reload_config(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let settings = state.config.reload()?;
    Ok(Json(json!({
        "status": "reloaded",
        "scheduler_interval_secs": settings.scheduler_interval.as_secs(),
        "reopen_window_days": settings.reopen_window.num_days(),
    })))
}
