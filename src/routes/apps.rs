use axum::{
    extract::{Path, Query, State},
    Json,
};
use tracing::instrument;
use validator::Validate;

use crate::{
    app_state::AppState,
    error::{ApiError, Result},
    middleware::OwnerIdentity,
    models::{
        apps::{
            AppListResponse, AppResponse, AppView, DeployData, DeployRequest, DeployResponse,
            LogsData, LogsQuery, LogsResponse,
        },
        common::SuccessResponse,
    },
    services::LogsOutput,
};

const MAX_TAIL_LINES: usize = 5000;

/// POST /api/v1/apps
#[instrument(skip(state, request), fields(owner = %identity.owner_id))]
pub async fn deploy(
    State(state): State<AppState>,
    identity: OwnerIdentity,
    Json(request): Json<DeployRequest>,
) -> Result<Json<DeployResponse>> {
    request
        .validate()
        .map_err(|e| ApiError::InvalidRequest(format!("Validation error: {}", e)))?;

    let outcome = state
        .deploy_service
        .deploy(&identity.owner_id, request.repo_url.trim(), request.memory_mb)
        .await?;

    Ok(Json(SuccessResponse::new(DeployData {
        app: AppView::from(&outcome.app),
        strategy: outcome.strategy.as_str().to_string(),
        credits_debited: outcome.credits_debited,
        credits_remaining: outcome.credits_remaining,
        teardown_warnings: outcome.teardown_warnings,
    })))
}

/// GET /api/v1/apps
#[instrument(skip(state, identity))]
pub async fn list_apps(
    State(state): State<AppState>,
    identity: OwnerIdentity,
) -> Result<Json<AppListResponse>> {
    let apps = state.registry_service.list(&identity.owner_id).await?;
    Ok(Json(SuccessResponse::new(
        apps.iter().map(AppView::from).collect(),
    )))
}

/// GET /api/v1/apps/{name}
#[instrument(skip(state, identity))]
pub async fn get_app(
    State(state): State<AppState>,
    identity: OwnerIdentity,
    Path(name): Path<String>,
) -> Result<Json<AppResponse>> {
    let app = state.registry_service.get(&identity.owner_id, &name).await?;
    Ok(Json(SuccessResponse::new(AppView::from(&app))))
}

/// POST /api/v1/apps/{name}/stop
#[instrument(skip(state, identity))]
pub async fn stop_app(
    State(state): State<AppState>,
    identity: OwnerIdentity,
    Path(name): Path<String>,
) -> Result<Json<AppResponse>> {
    let app = state.registry_service.stop(&identity.owner_id, &name).await?;
    Ok(Json(SuccessResponse::new(AppView::from(&app))))
}

/// GET /api/v1/apps/{name}/logs?tail=N
#[instrument(skip(state, identity))]
pub async fn app_logs(
    State(state): State<AppState>,
    identity: OwnerIdentity,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>> {
    let tail = query.tail.map(|n| n.clamp(1, MAX_TAIL_LINES));
    let logs = state
        .registry_service
        .fetch_logs(&identity.owner_id, &name, tail)
        .await?;

    let data = match logs {
        LogsOutput::Available(lines) => LogsData {
            name,
            available: true,
            lines: Some(lines),
            reason: None,
        },
        LogsOutput::Unavailable(reason) => LogsData {
            name,
            available: false,
            lines: None,
            reason: Some(reason),
        },
    };

    Ok(Json(SuccessResponse::new(data)))
}
