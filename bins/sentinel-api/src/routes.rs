use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::submit_job))
        .route("/job/:id", get(handlers::get_job))
        .route("/load", get(handlers::get_load))
        .route("/health", get(handlers::get_health))
        .route("/languages", get(handlers::list_languages))
}
