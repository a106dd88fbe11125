use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::AppError;
use crate::graph_client::{GraphClient, TokenManager};
use crate::orchestrator::{Pipeline, ProcessOutcome};
use crate::poller;
use crate::storage::IntakeStore;

/// Shared application state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub store: Arc<IntakeStore>,
    pub pipeline: Arc<Pipeline>,
    pub graph: GraphClient,
    pub tokens: Arc<TokenManager>,
}

/// Health check endpoint. Verifies database connectivity.
pub async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    sqlx::query("SELECT 1").execute(&state.pool).await?;
    Ok(Json(json!({
        "status": "ok",
        "database": "connected",
    })))
}

#[derive(Debug, Deserialize)]
pub struct RetryQuery {
    #[serde(default)]
    pub force_refresh: bool,
}

/// Manual retry of one event.
pub async fn retry_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<RetryQuery>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.pipeline.retry_event(id, query.force_refresh).await?;

    let (status, message) = match outcome {
        ProcessOutcome::Processed(lead_id) => {
            ("processed", format!("Lead record {} created", lead_id))
        }
        ProcessOutcome::AlreadyProcessed => {
            ("processed", "Event was already processed".to_string())
        }
        ProcessOutcome::Unconfigured => (
            "unconfigured",
            "No usable mapping configuration; see the event's error message".to_string(),
        ),
        ProcessOutcome::Disabled => (
            "disabled",
            "The matching mapping configuration is disabled".to_string(),
        ),
        ProcessOutcome::Failed(message) => ("error", message),
    };

    Ok(Json(json!({
        "status": status,
        "message": message,
    })))
}

#[derive(Debug, Deserialize)]
pub struct BulkRetryRequest {
    pub ids: Vec<Uuid>,
}

/// Bulk retry: schedules a background task per event. With a body the
/// given ids are retried; without one, every retryable event is.
pub async fn retry_all_events(
    State(state): State<AppState>,
    body: Option<Json<BulkRetryRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let scheduled = match body {
        Some(Json(request)) => state.pipeline.retry_many(request.ids).await?,
        None => state.pipeline.retry_all().await?,
    };
    Ok(Json(json!({
        "status": "scheduled",
        "scheduled": scheduled,
    })))
}

/// Re-syncs the form registry for one page from the provider.
pub async fn refresh_forms(
    State(state): State<AppState>,
    Path(page_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let refreshed =
        poller::refresh_forms_for_page(&state.store, &state.graph, &state.tokens, &page_id)
            .await?;
    Ok(Json(json!({
        "status": "ok",
        "page_id": page_id,
        "refreshed": refreshed,
    })))
}

/// Scans an ad's creatives for lead-gen form ids and registers each
/// discovered form.
pub async fn discover_ad_forms(
    State(state): State<AppState>,
    Path(ad_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let discovered =
        poller::discover_forms_from_ad(&state.store, &state.graph, &state.tokens, &ad_id).await?;
    Ok(Json(json!({
        "status": "ok",
        "ad_id": ad_id,
        "forms": discovered,
    })))
}

/// Inspects one intake event, state and diagnostics included.
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let event = state.store.fetch_event(id).await?;
    Ok(Json(event))
}
