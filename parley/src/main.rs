mod server;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use parley_sfu::bootstrap::load_config;
use parley_sfu::{logging, MeetingPool, WebRtcEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Parley server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Initialize the WebRTC engine
    let engine = Arc::new(WebRtcEngine::new(config.rtc.clone()));
    info!("WebRTC engine initialized");

    // 4. Initialize the meeting pool
    let pool = Arc::new(MeetingPool::new(config.clone(), engine));
    info!("Meeting pool initialized");

    // 5. Start the HTTP server and wait for shutdown
    server::ParleyServer::new(config, pool).start().await
}
