use crate::{
    app_state::AppState,
    error::{ApiError, Result},
    services::workspace_service::validate_owner_id,
};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};

pub const OWNER_HEADER: &str = "x-owner-id";

/// Request extension storing the end-user identity vouched for by the front-end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub owner_id: String,
}

/// Front-end authentication middleware
///
/// The chat front-end authenticates with a shared bearer token and names the
/// end user in `X-Owner-Id`. The identity is validated and stored in request
/// extensions.
///
/// Returns 401 Unauthorized if the token is missing or wrong, 400 if the
/// identity is missing or malformed.
pub async fn identity_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let headers = request.headers();

    // Extract Authorization header
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;

    // Parse "Bearer <token>" format
    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::Unauthorized(
            "Invalid Authorization format, expected 'Bearer <token>'".to_string(),
        )
    })?;

    if token != state.config.server.frontend_token {
        return Err(ApiError::Unauthorized("Invalid front-end token".to_string()));
    }

    let owner_id = headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidRequest("Missing X-Owner-Id header".to_string()))?
        .to_string();
    validate_owner_id(&owner_id)?;

    request.extensions_mut().insert(OwnerIdentity { owner_id });

    // Continue to next middleware/handler
    Ok(next.run(request).await)
}

/// Axum extractor for the owner identity
///
/// Only works on routes protected by identity_middleware.
impl<S> FromRequestParts<S> for OwnerIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OwnerIdentity>()
            .cloned()
            .ok_or_else(|| {
                ApiError::Unauthorized(
                    "Owner identity not found - route must be protected by identity_middleware"
                        .to_string(),
                )
            })
    }
}
