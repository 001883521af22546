use axum::{
    extract::{Path, State},
    Json,
};
use tracing::instrument;
use validator::Validate;

use crate::{
    app_state::AppState,
    error::{ApiError, Result},
    middleware::OwnerIdentity,
    models::{
        common::SuccessResponse,
        orders::{
            ApprovalData, ApprovalResponse, CreateOrderRequest, OrderListResponse, OrderResponse,
            OrderView,
        },
    },
};

/// POST /api/v1/orders
#[instrument(skip(state, request), fields(owner = %identity.owner_id))]
pub async fn create_order(
    State(state): State<AppState>,
    identity: OwnerIdentity,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<OrderResponse>> {
    request
        .validate()
        .map_err(|e| ApiError::InvalidRequest(format!("Validation error: {}", e)))?;

    let order = state
        .ledger_service
        .create_order(&identity.owner_id, request.amount)
        .await?;

    Ok(Json(SuccessResponse::new(OrderView::from(&order))))
}

/// GET /api/v1/orders
#[instrument(skip(state, identity))]
pub async fn list_orders(
    State(state): State<AppState>,
    identity: OwnerIdentity,
) -> Result<Json<OrderListResponse>> {
    let orders = state.ledger_service.list_orders(&identity.owner_id).await?;
    Ok(Json(SuccessResponse::new(
        orders.iter().map(OrderView::from).collect(),
    )))
}

/// POST /api/v1/orders/{order_id}/approve
///
/// The caller is the approver; only the administrator identity succeeds.
#[instrument(skip(state, identity))]
pub async fn approve_order(
    State(state): State<AppState>,
    identity: OwnerIdentity,
    Path(order_id): Path<String>,
) -> Result<Json<ApprovalResponse>> {
    let (order, balance) = state
        .ledger_service
        .approve(&order_id, &identity.owner_id)
        .await?;

    Ok(Json(SuccessResponse::new(ApprovalData {
        order: OrderView::from(&order),
        balance,
    })))
}

/// POST /api/v1/orders/{order_id}/cancel
#[instrument(skip(state, identity))]
pub async fn cancel_order(
    State(state): State<AppState>,
    identity: OwnerIdentity,
    Path(order_id): Path<String>,
) -> Result<Json<OrderResponse>> {
    let order = state
        .ledger_service
        .cancel(&order_id, &identity.owner_id)
        .await?;

    Ok(Json(SuccessResponse::new(OrderView::from(&order))))
}
