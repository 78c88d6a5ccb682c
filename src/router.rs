use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

/// Build the application router with all routes
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::healthcheck))
        // Instance routes
        .route(
            "/api/instances",
            get(handlers::instances::list_instances).post(handlers::instances::register_instance),
        )
        .route(
            "/api/instances/:id",
            get(handlers::instances::get_instance).delete(handlers::instances::deregister_instance),
        )
        // Session routes
        .route(
            "/api/instances/:id/session",
            post(handlers::sessions::open_session)
                .get(handlers::sessions::get_session)
                .delete(handlers::sessions::close_session),
        )
        // Intent routes
        .route(
            "/api/instances/:id/intents/:area",
            post(handlers::intents::apply_intent),
        )
        .route(
            "/api/instances/:id/intents/:area/preview",
            post(handlers::intents::preview_intent),
        )
        // Mapper registry routes
        .route("/api/feature-areas", get(handlers::versions::list_feature_areas))
        .route(
            "/api/feature-areas/:area/versions",
            get(handlers::versions::list_versions),
        )
        // WebSocket route
        .route("/ws", get(crate::ws_upgrade_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
