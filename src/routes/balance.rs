use axum::{extract::State, Json};
use tracing::instrument;

use crate::{
    app_state::AppState,
    error::Result,
    middleware::OwnerIdentity,
    models::{balance::BalanceResponse, common::{MessageResponse, SuccessResponse}},
};

/// GET /api/v1/balance
#[instrument(skip(state, identity))]
pub async fn get_balance(
    State(state): State<AppState>,
    identity: OwnerIdentity,
) -> Result<Json<BalanceResponse>> {
    let balance = state.admission_service.balance(&identity.owner_id).await?;
    Ok(Json(SuccessResponse::new(balance)))
}

/// GET /health
pub async fn health() -> Json<MessageResponse> {
    Json(MessageResponse::new("ok"))
}
