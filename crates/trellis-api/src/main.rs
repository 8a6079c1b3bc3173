//! # trellis: Binary Entry Point
//!
//! Reads configuration from the environment, assembles the application and
//! serves it on `0.0.0.0:$PORT` (default 3000) until a termination signal.

use trellis_core::{logging, AppConfig, LogFormat};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The subscriber goes up before config so config errors are logged.
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or_default();
    logging::init(format);

    let config = AppConfig::from_env().map_err(|e| {
        tracing::error!("Configuration invalid: {e}");
        e
    })?;

    trellis_api::run(config).await.map_err(|e| {
        tracing::error!("Startup failed: {e}");
        e
    })?;

    Ok(())
}
