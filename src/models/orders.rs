use entity::{orders, sea_orm_active_enums::OrderStatus};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::common::SuccessResponse;

/// Request to propose a credit top-up
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(range(min = 1, max = 1_000_000))]
    pub amount: i32,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub order_id: String,
    pub owner_id: String,
    pub amount: i32,
    pub credits_requested: i32,
    pub status: OrderStatus,
    pub approved_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: time::OffsetDateTime,
}

impl From<&orders::Model> for OrderView {
    fn from(order: &orders::Model) -> Self {
        Self {
            order_id: order.order_id.clone(),
            owner_id: order.owner_id.clone(),
            amount: order.amount,
            credits_requested: order.credits_requested,
            status: order.status,
            approved_by: order.approved_by.clone(),
            created_at: order.created_at,
        }
    }
}

pub type OrderResponse = SuccessResponse<OrderView>;
pub type OrderListResponse = SuccessResponse<Vec<OrderView>>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalData {
    pub order: OrderView,
    /// Owner's balance after the credit was applied
    pub balance: i32,
}

pub type ApprovalResponse = SuccessResponse<ApprovalData>;
