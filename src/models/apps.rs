use entity::{
    applications,
    sea_orm_active_enums::{ApplicationStatus, RuntimeKind},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::common::SuccessResponse;

// ============================================================================
// Request Models
// ============================================================================

/// Request body for deploying (or redeploying) a repository
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[validate(length(min = 1, max = 2048))]
    pub repo_url: String,
    /// Falls back to the configured default when omitted
    pub memory_mb: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

// ============================================================================
// Response Models
// ============================================================================

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AppView {
    pub name: String,
    pub repository_url: String,
    pub memory_mb: i32,
    pub status: ApplicationStatus,
    pub runtime_name: String,
    pub runtime_kind: Option<RuntimeKind>,
    /// Container name or process id; absent until the runtime is confirmed
    pub runtime_handle: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: time::OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: time::OffsetDateTime,
}

impl From<&applications::Model> for AppView {
    fn from(app: &applications::Model) -> Self {
        Self {
            name: app.name.clone(),
            repository_url: app.repository_url.clone(),
            memory_mb: app.memory_mb,
            status: app.status,
            runtime_name: app.runtime_name.clone(),
            runtime_kind: app.runtime_kind,
            runtime_handle: (!app.runtime_handle.is_empty()).then(|| app.runtime_handle.clone()),
            created_at: app.created_at,
            updated_at: app.updated_at,
        }
    }
}

pub type AppResponse = SuccessResponse<AppView>;
pub type AppListResponse = SuccessResponse<Vec<AppView>>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployData {
    pub app: AppView,
    /// containerized | interpreted
    pub strategy: String,
    pub credits_debited: i32,
    pub credits_remaining: i32,
    /// Runtimes of the previous deployment that could not be torn down
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub teardown_warnings: Vec<String>,
}

pub type DeployResponse = SuccessResponse<DeployData>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsData {
    pub name: String,
    pub available: bool,
    /// Present when available, possibly empty if the runtime printed nothing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub type LogsResponse = SuccessResponse<LogsData>;
