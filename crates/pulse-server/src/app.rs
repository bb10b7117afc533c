use crate::state::AppState;
use crate::{api, logging, ws};
use axum::routing::{get, post, put};
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/state", get(api::get_state))
        .route("/api/charts", get(api::get_charts))
        .route(
            "/api/config/nodes",
            get(api::list_nodes).post(api::create_node),
        )
        .route(
            "/api/config/nodes/:id",
            put(api::update_node).delete(api::delete_node),
        )
        .route(
            "/api/config/nodes/test-connection",
            post(api::test_connection),
        )
        .route(
            "/api/notifications/thresholds",
            get(api::get_thresholds).post(api::set_thresholds),
        )
        .route("/api/alerts/:id/ack", post(api::ack_alert))
        .route("/api/discover", get(api::get_discover))
        .route("/api/config/export", post(api::export_config))
        .route("/api/config/import", post(api::import_config))
        .route("/api/system", get(api::get_system))
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn(logging::request_logging))
}
