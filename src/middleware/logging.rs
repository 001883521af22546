use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use super::identity::OWNER_HEADER;

/// Middleware that logs one line per request and one per response.
///
/// Bodies are not logged: deploy responses carry full build output.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let owner = request
        .headers()
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let start = Instant::now();

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        owner = %owner,
        "→ Request"
    );

    let response = next.run(request).await;

    let status = response.status();
    let latency = start.elapsed();

    if status.is_server_error() {
        tracing::error!(
            request_id = %request_id,
            method = %method,
            uri = %uri,
            owner = %owner,
            status = %status.as_u16(),
            latency_ms = %latency.as_millis(),
            "← Response"
        );
    } else {
        tracing::info!(
            request_id = %request_id,
            method = %method,
            uri = %uri,
            owner = %owner,
            status = %status.as_u16(),
            latency_ms = %latency.as_millis(),
            "← Response"
        );
    }

    response
}
