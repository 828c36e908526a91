//! HTTP endpoints

use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::fal::FalClient;
use crate::storage::{FsImageStore, ImageStore};

mod generate;
mod images;
mod prelude;
mod views;

use generate::{generate_image_handler, generate_img2img_handler};
use views::{gallery_handler, image_handler, image_metadata_handler};

#[derive(Clone, Debug)]
pub(crate) struct AppState {
    store: Arc<dyn ImageStore>,
    fal: FalClient,
    http: reqwest::Client,
    upload_dir: PathBuf,
}

impl AppState {
    fn new(
        store: Arc<dyn ImageStore>,
        fal: FalClient,
        http: reqwest::Client,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            fal,
            http,
            upload_dir,
        }
    }
}

fn create_router(public_dir: &StdPath, max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/generate-image", axum::routing::post(generate_image_handler))
        .route(
            "/generate-img2img",
            axum::routing::post(generate_img2img_handler),
        )
        .route("/gallery", axum::routing::get(gallery_handler))
        .route(
            "/image-metadata/{filename}",
            axum::routing::get(image_metadata_handler),
        )
        .route("/images/{filename}", axum::routing::get(image_handler))
        .fallback_service(ServeDir::new(public_dir))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Creates the storage directories and serves until Ctrl-C.
pub async fn setup_server(config: &ServerConfig) -> Result<(), anyhow::Error> {
    let store = FsImageStore::new(&config.image_dir);
    store.ensure_root().await?;
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let http = reqwest::Client::new();
    let fal = FalClient::new(http.clone(), &config.fal);
    let state = AppState::new(Arc::new(store), fal, http, config.upload_dir.clone());
    let app = create_router(&config.public_dir, config.max_upload_bytes).with_state(state);

    let addr = format!("{}:{}", config.listen_address, config.port);
    info!("Server running on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", err);
    }
    Ok(())
}
