use std::sync::Arc;
use axum::Router;
use axum::routing::{get, post};
use crate::backend::routes::generate::{cancel, generate, health};
use crate::backend::state::BackendState;

mod generate;

pub fn api_routes() -> Router<Arc<BackendState>> {
    Router::new()
        .route("/generate", post(generate))
        .route("/cancel", post(cancel))
        .route("/health", get(health))
}
