use serde::{Deserialize, Serialize};

use super::common::SuccessResponse;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceInfo {
    pub credits: i32,
    /// Held by deploys still in flight
    pub reserved_credits: i32,
    pub used_mb: i32,
    pub free_allowance_mb: i32,
    pub free_available_mb: i32,
}

pub type BalanceResponse = SuccessResponse<BalanceInfo>;
