//! CLI parser
use clap::Parser;
use std::num::NonZeroU16;
use std::path::PathBuf;

#[derive(Parser, Debug)]
/// CLI Options
pub struct CliOptions {
    #[clap(long, help = "Enable debug logging", env = "FALGALLERY_DEBUG")]
    /// Enable debug logging. Env: FALGALLERY_DEBUG
    pub debug: bool,
    #[clap(long, short, default_value = "3000", env = "PORT")]
    /// http listener, defaults to `3000`.
    /// Env: PORT
    pub port: NonZeroU16,
    #[clap(long, short, default_value = "0.0.0.0", env = "FALGALLERY_LISTEN_ADDRESS")]
    /// Listen address, defaults to `0.0.0.0`.
    /// Env: FALGALLERY_LISTEN_ADDRESS
    pub listen_address: String,
    #[clap(long, env = "FAL_KEY", hide_env_values = true)]
    /// fal.ai API key.
    /// Env: FAL_KEY
    pub fal_key: String,

    #[clap(long, default_value = "./images", env = "FALGALLERY_IMAGE_DIR")]
    /// Where generated images are stored.
    /// Env: FALGALLERY_IMAGE_DIR
    pub image_dir: PathBuf,
    #[clap(long, default_value = "./uploads", env = "FALGALLERY_UPLOAD_DIR")]
    /// Temporary storage for image-to-image source uploads.
    /// Env: FALGALLERY_UPLOAD_DIR
    pub upload_dir: PathBuf,
    #[clap(long, default_value = "./public", env = "FALGALLERY_PUBLIC_DIR")]
    /// Static frontend files served at `/`.
    /// Env: FALGALLERY_PUBLIC_DIR
    pub public_dir: PathBuf,

    #[clap(long, default_value = "https://queue.fal.run", env = "FAL_QUEUE_URL")]
    /// Base URL of the fal.ai queue API.
    /// Env: FAL_QUEUE_URL
    pub fal_queue_url: String,
    #[clap(long, default_value = "https://rest.alpha.fal.ai", env = "FAL_REST_URL")]
    /// Base URL of the fal.ai REST API, used for storage uploads.
    /// Env: FAL_REST_URL
    pub fal_rest_url: String,
    #[clap(long, default_value = "500", env = "FALGALLERY_POLL_INTERVAL_MS")]
    /// How often to poll a queued job, in milliseconds.
    /// Env: FALGALLERY_POLL_INTERVAL_MS
    pub poll_interval_ms: u64,
    #[clap(long, default_value = "25", env = "FALGALLERY_MAX_UPLOAD_MB")]
    /// Largest accepted upload, in megabytes.
    /// Env: FALGALLERY_MAX_UPLOAD_MB
    pub max_upload_mb: usize,
}
