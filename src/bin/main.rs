use log::{info, warn};
use std::sync::Arc;

use sigstream::load_config;
use sigstream::modules::ingest::FfmpegTranscoder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = load_config()?;
    info!("Starting sigstream on port {}", settings.port);
    match settings.hw_accel {
        Some(accel) => info!("Encoder profile forced to {}", accel),
        None => info!("Encoder profile probed per stream"),
    }

    let transcoder = Arc::new(FfmpegTranscoder::new(settings.transcoder_path.clone()));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };

    sigstream::run(&settings, transcoder, shutdown).await?;
    Ok(())
}
