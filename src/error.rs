use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// A failed pipeline step. Each variant carries the captured output of the
/// external step verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeployError {
    #[error("clone failed:\n{0}")]
    CloneFailed(String),

    #[error("environment setup failed:\n{0}")]
    EnvironmentFailed(String),

    #[error("build failed:\n{0}")]
    BuildFailed(String),

    #[error("launch failed:\n{0}")]
    LaunchFailed(String),

    #[error("no entrypoint: {0}")]
    NoEntrypoint(String),
}

impl DeployError {
    /// Name of the pipeline step that failed
    pub fn step(&self) -> &'static str {
        match self {
            Self::CloneFailed(_) => "clone",
            Self::EnvironmentFailed(_) => "environment",
            Self::BuildFailed(_) => "build",
            Self::LaunchFailed(_) => "launch",
            Self::NoEntrypoint(_) => "detect",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::CloneFailed(_) => "CLONE_FAILED",
            Self::EnvironmentFailed(_) => "ENVIRONMENT_FAILED",
            Self::BuildFailed(_) => "BUILD_FAILED",
            Self::LaunchFailed(_) => "LAUNCH_FAILED",
            Self::NoEntrypoint(_) => "NO_ENTRYPOINT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StopError {
    #[error("application {0} not found")]
    NotFound(String),

    #[error("application {name} is {status}, not running")]
    NotRunning { name: String, status: String },

    #[error("runtime {0} no longer exists")]
    RuntimeNotFound(String),

    #[error("teardown failed:\n{0}")]
    TeardownFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order {order_id} is already {status}")]
    NotPending { order_id: String, status: String },

    #[error("{0} is not allowed to perform this operation")]
    Unauthorized(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient credit: {deficit} MB of credit needed to allocate {requested_mb} MB")]
    InsufficientCredit { requested_mb: i32, deficit: i32 },

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut details = None;
        let (status, error_code, message) = match self {
            ApiError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "An internal database error occurred".to_string(),
                )
            }
            ApiError::InvalidRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", msg.clone())
            }
            ApiError::InsufficientCredit {
                requested_mb,
                deficit,
            } => {
                details = Some(json!({ "requestedMb": requested_mb, "deficit": deficit }));
                (
                    StatusCode::PAYMENT_REQUIRED,
                    "INSUFFICIENT_CREDIT",
                    self.to_string(),
                )
            }
            ApiError::Deploy(ref e) => {
                details = Some(json!({ "step": e.step() }));
                (StatusCode::UNPROCESSABLE_ENTITY, e.code(), e.to_string())
            }
            ApiError::Stop(ref e) => {
                let (status, code) = match e {
                    StopError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                    StopError::NotRunning { .. } => (StatusCode::CONFLICT, "NOT_RUNNING"),
                    StopError::RuntimeNotFound(_) => (StatusCode::GONE, "RUNTIME_NOT_FOUND"),
                    StopError::TeardownFailed(_) => (StatusCode::BAD_GATEWAY, "TEARDOWN_FAILED"),
                };
                (status, code, e.to_string())
            }
            ApiError::Ledger(ref e) => {
                let (status, code) = match e {
                    LedgerError::OrderNotFound(_) => (StatusCode::NOT_FOUND, "ORDER_NOT_FOUND"),
                    LedgerError::NotPending { .. } => (StatusCode::CONFLICT, "NOT_PENDING"),
                    LedgerError::Unauthorized(_) => (StatusCode::FORBIDDEN, "UNAUTHORIZED"),
                    LedgerError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
                };
                (status, code, e.to_string())
            }
            ApiError::NotFound(ref msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Unauthorized(ref msg) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
            }
            ApiError::Internal(ref e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let mut error = json!({
            "code": error_code,
            "message": message,
        });
        if let Some(details) = details {
            error["details"] = details;
        }

        let body = json!({
            "success": false,
            "error": error,
        });

        (status, Json(body)).into_response()
    }
}

// Helper type for results
pub type Result<T> = std::result::Result<T, ApiError>;
