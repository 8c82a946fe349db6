use std::sync::Arc;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::info;
use crate::backend::error::BackendError;
use crate::backend::schemas::{CancelResponse, GenerateResponse, HealthResponse, RunStatus};
use crate::backend::state::BackendState;
use crate::error::GenerationError;
use crate::settings::Overrides;

/// Run one request to completion and report what was written
pub async fn generate(
    State(state): State<Arc<BackendState>>,
    Json(overrides): Json<Overrides>,
) -> Result<Json<GenerateResponse>, BackendError> {
    let mut ctx = state.try_acquire().ok_or(GenerationError::Busy)?;
    let request = ctx.settings.request(&overrides);
    let (id, seed, count) = (request.id, request.metadata.seed, request.image_count);

    info!(%id, count, "Generation requested over HTTP");

    // accepted before the first await, so `/cancel` can always reach it
    ctx.submit(request)?;

    // the next request clears the cancel flag, so read it under the lock
    let (written, cancelled, images_root) = tokio::task::spawn_blocking(move || {
        let written = ctx.wait_for_run(|_| {});
        let cancelled = ctx.worker().control().cancel_requested();
        (written, cancelled, ctx.config.images_path.clone())
    })
    .await
    .map_err(|e| BackendError::internal(format!("Generation task failed: {}", e)))?;
    let written = written?;

    let status = if written.len() as u32 == count {
        RunStatus::Completed
    } else if cancelled {
        RunStatus::Cancelled
    } else {
        RunStatus::Failed
    };

    let images = written
        .iter()
        .filter_map(|p| p.strip_prefix(&images_root).ok())
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect();

    Ok(Json(GenerateResponse { id, status, seed, images }))
}

pub async fn cancel(State(state): State<Arc<BackendState>>) -> (StatusCode, Json<CancelResponse>) {
    let cancelled = state.cancel();
    (StatusCode::ACCEPTED, Json(CancelResponse { cancelled }))
}

pub async fn health(State(state): State<Arc<BackendState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        busy: state.is_busy(),
    })
}
