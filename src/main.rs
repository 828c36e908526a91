use clap::Parser;
use falgallery::config::{ServerConfig, setup_logging};
use tracing::error;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    dotenv::dotenv().ok();
    let cli = falgallery::cli::CliOptions::parse();

    if setup_logging(cli.debug).is_err() {
        return;
    }

    let config = match ServerConfig::try_from(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid fal.ai URL: {}", err);
            return;
        }
    };

    if let Err(err) = falgallery::web::setup_server(&config).await {
        error!("Application error: {}", err);
    }
}
