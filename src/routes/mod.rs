// Route modules
pub mod apps;
pub mod balance;
pub mod orders;

use crate::{
    app_state::AppState,
    middleware::{identity_middleware, logging_middleware},
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(balance::health))
        .nest("/api/v1", api_v1_routes(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API v1 routes, all behind the front-end identity check
fn api_v1_routes(state: AppState) -> Router<AppState> {
    let app_routes = Router::new()
        .route("/apps", post(apps::deploy).get(apps::list_apps))
        .route("/apps/{name}", get(apps::get_app))
        .route("/apps/{name}/stop", post(apps::stop_app))
        .route("/apps/{name}/logs", get(apps::app_logs));

    let ledger_routes = Router::new()
        .route("/orders", post(orders::create_order).get(orders::list_orders))
        .route("/orders/{order_id}/approve", post(orders::approve_order))
        .route("/orders/{order_id}/cancel", post(orders::cancel_order))
        .route("/balance", get(balance::get_balance));

    Router::new()
        .merge(app_routes)
        .merge(ledger_routes)
        .layer(middleware::from_fn_with_state(state, identity_middleware))
        .layer(middleware::from_fn(logging_middleware))
}
