mod error;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;
use crate::backend::routes::api_routes;
use crate::backend::state::BackendState;
use crate::context::AppContext;

pub use crate::backend::error::BackendError;
pub use crate::backend::schemas::{
    CancelResponse, ErrorResponse, GenerateResponse, HealthResponse, RunStatus,
};

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(Arc::new(BackendState::new(ctx)))
}

/// Serve the generation API on `0.0.0.0:PORT` until ctrl-c
pub async fn serve(ctx: AppContext) -> anyhow::Result<()> {
    let port = ctx.config.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;

    info!("Starting backend server on port {}", port);

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down backend server");
        })
        .await
        .context("Server failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use reqwest::StatusCode;
    use serde_json::json;
    use sa_diffusion::SyntheticLoader;
    use crate::config::AppConfig;

    async fn spawn_server(root: &Path) -> String {
        spawn_server_with(root, SyntheticLoader::new()).await
    }

    async fn spawn_server_with(root: &Path, loader: SyntheticLoader) -> String {
        let config = AppConfig {
            images_path: root.join("images"),
            thumbnails_path: root.join("thumbnails"),
            settings_path: root.join("settings.json"),
            port: 0,
            reduce_memory: false,
        };
        let ctx = AppContext::with_loader(config, Arc::new(loader)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(ctx)).await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_generate_writes_images() {
        let root = tempfile::tempdir().unwrap();
        let base = spawn_server(root.path()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/generate", base))
            .json(&json!({
                "prompt": "a red kite",
                "seed": 99,
                "steps": 3,
                "width": 64,
                "height": 64,
                "count": 2
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body: GenerateResponse = resp.json().await.unwrap();
        assert_eq!(body.status, RunStatus::Completed);
        assert_eq!(body.seed, 99);
        assert_eq!(body.images, vec!["outputs/00001.png", "outputs/00002.png"]);
        assert!(root.path().join("images/outputs/00002.png").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_request_is_bad_request() {
        let root = tempfile::tempdir().unwrap();
        let base = spawn_server(root.path()).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/generate", base))
            .json(&json!({ "width": 100 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: ErrorResponse = resp.json().await.unwrap();
        assert!(body.error.contains("100x512"), "{}", body.error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health_and_idle_cancel() {
        let root = tempfile::tempdir().unwrap();
        let base = spawn_server(root.path()).await;
        let client = reqwest::Client::new();

        let health: HealthResponse =
            client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(health.status, "ok");
        assert!(!health.busy);

        let resp = client.post(format!("{}/cancel", base)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: CancelResponse = resp.json().await.unwrap();
        assert!(!body.cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_and_unknown_requests_are_bad_requests() {
        let root = tempfile::tempdir().unwrap();
        let loader = SyntheticLoader::new().restricted_to(["runwayml/stable-diffusion-v1-5"]);
        let base = spawn_server_with(root.path(), loader).await;
        let client = reqwest::Client::new();

        for body in [
            json!({ "count": 4294967295u32 }),
            json!({ "steps": 1000 }),
            json!({ "width": 4096 }),
            json!({ "model": "nobody/unknown" }),
        ] {
            let resp = client.post(format!("{}/generate", base)).json(&body).send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", body);
        }

        let health: HealthResponse =
            client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
        assert!(!health.busy);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_busy_then_cancel() {
        let root = tempfile::tempdir().unwrap();
        let loader = SyntheticLoader::new().with_step_delay(Duration::from_millis(50));
        let base = spawn_server_with(root.path(), loader).await;
        let client = reqwest::Client::new();

        let long_run = {
            let client = client.clone();
            let url = format!("{}/generate", base);
            tokio::spawn(async move {
                client
                    .post(url)
                    .json(&json!({ "steps": 99, "width": 64, "height": 64 }))
                    .send()
                    .await
                    .unwrap()
            })
        };

        // wait for the worker to accept the run
        let mut busy = false;
        for _ in 0..200 {
            let health: HealthResponse =
                client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
            if health.busy {
                busy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(busy);

        let resp = client
            .post(format!("{}/generate", base))
            .json(&json!({ "steps": 2, "width": 64, "height": 64 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let cancel: CancelResponse =
            client.post(format!("{}/cancel", base)).send().await.unwrap().json().await.unwrap();
        assert!(cancel.cancelled);

        let resp = long_run.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: GenerateResponse = resp.json().await.unwrap();
        assert_eq!(body.status, RunStatus::Cancelled);
        assert!(body.images.is_empty());
    }
}
