use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::api::rest::{handlers, logging_middleware::request_logging_middleware};
use crate::controller::lab_manager::LabOrchestrator;

pub fn create_router(orchestrator: Arc<LabOrchestrator>) -> Router {
    let api_routes = Router::new()
        .route("/version", get(version))
        .route(
            "/labs",
            get(handlers::labs::list_labs).post(handlers::labs::create_lab),
        )
        .route("/labs/{id}", get(handlers::labs::get_lab))
        .route("/labs/{id}/stop", post(handlers::labs::stop_lab))
        .route("/labs/{id}/pause", post(handlers::labs::pause_lab))
        .route("/labs/{id}/resume", post(handlers::labs::resume_lab))
        .route(
            "/labs/{id}/ide/{ide_type}/{action}",
            post(handlers::labs::proxy_action),
        )
        .route(
            "/labs/{id}/workspace",
            get(handlers::labs::download_workspace),
        )
        .route("/labs/{id}/files", get(handlers::labs::download_file))
        .with_state(orchestrator);

    Router::new()
        .nest("/api/v0", api_routes)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn version() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "api": "v0"
    }))
}
