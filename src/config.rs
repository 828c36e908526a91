//! Config handling

use std::num::NonZeroU16;
use std::path::PathBuf;
use std::time::Duration;

use tracing::log::LevelFilter;
use url::Url;

use crate::cli::CliOptions;

/// Sets up logging based on the debug flag
pub fn setup_logging(debug: bool) -> Result<(), Box<std::io::Error>> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut logger = simple_logger::SimpleLogger::new().with_level(level);
    if !debug {
        logger = logger
            .with_module_level("tracing", LevelFilter::Warn)
            .with_module_level("rustls", LevelFilter::Info)
            .with_module_level("hyper_util", LevelFilter::Info)
            .with_module_level("reqwest", LevelFilter::Info)
            .with_module_level("h2", LevelFilter::Info);
    }
    logger.init().map_err(|err| {
        eprintln!("Failed to initialize logger: {}", err);
        Box::new(std::io::Error::other(err))
    })
}

/// How to reach fal.ai
#[derive(Clone, Debug)]
pub struct FalConfig {
    /// API key, sent as `Authorization: Key ...`
    pub credentials: String,
    /// Base of the queue API
    pub queue_url: Url,
    /// Base of the REST API used for storage uploads
    pub rest_url: Url,
    /// Delay between status polls
    pub poll_interval: Duration,
}

/// Everything the server needs to start
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address
    pub listen_address: String,
    /// Listen port
    pub port: NonZeroU16,
    /// Where generated images are stored
    pub image_dir: PathBuf,
    /// Scratch space for image-to-image uploads
    pub upload_dir: PathBuf,
    /// Static frontend files
    pub public_dir: PathBuf,
    /// Largest accepted request body, in bytes
    pub max_upload_bytes: usize,
    /// fal.ai settings
    pub fal: FalConfig,
}

impl TryFrom<&CliOptions> for ServerConfig {
    type Error = url::ParseError;

    fn try_from(cli: &CliOptions) -> Result<Self, Self::Error> {
        Ok(Self {
            listen_address: cli.listen_address.clone(),
            port: cli.port,
            image_dir: cli.image_dir.clone(),
            upload_dir: cli.upload_dir.clone(),
            public_dir: cli.public_dir.clone(),
            max_upload_bytes: cli.max_upload_mb.saturating_mul(1024 * 1024),
            fal: FalConfig {
                credentials: cli.fal_key.clone(),
                queue_url: Url::parse(&cli.fal_queue_url)?,
                rest_url: Url::parse(&cli.fal_rest_url)?,
                poll_interval: Duration::from_millis(cli.poll_interval_ms),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_the_documented_environment() {
        let cli = CliOptions::try_parse_from(["falgallery", "--fal-key", "secret"])
            .expect("parse cli");
        let config = ServerConfig::try_from(&cli).expect("config");
        assert_eq!(config.image_dir, PathBuf::from("./images"));
        assert_eq!(config.fal.queue_url.as_str(), "https://queue.fal.run/");
        assert_eq!(config.fal.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_upload_bytes, 25 * 1024 * 1024);
        assert_eq!(config.fal.credentials, "secret");
    }

    #[test]
    fn bad_urls_are_rejected() {
        let cli = CliOptions::try_parse_from([
            "falgallery",
            "--fal-key",
            "secret",
            "--fal-queue-url",
            "not a url",
        ])
        .expect("parse cli");
        assert!(ServerConfig::try_from(&cli).is_err());
    }
}
