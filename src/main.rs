//! Headless trading server.
//!
//! Runs the exchange-facing core without any UI: market data streams in over
//! WebSocket, periodic jobs keep state fresh, and a status line is pushed to
//! stdout on an interval. Metrics are exposed through the embedding surface;
//! here they are logged as a JSON line for log-based collection.
//!
//! # Usage
//! ```sh
//! API_KEY=... API_SECRET=... cargo run --bin server
//! ```

use anyhow::Result;
use bfxtrader::application::system::TradingCore;
use bfxtrader::config::ConfigSource;
use std::path::Path;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("bfxtrader {} starting...", env!("CARGO_PKG_VERSION"));

    let source = match std::env::var("CONFIG_FILE") {
        Ok(path) => ConfigSource::with_file(Path::new(&path))?,
        Err(_) => ConfigSource::new(),
    };

    let core = TradingCore::build(source).await?;
    core.start().await?;

    // Default market data subscriptions from SYMBOLS (comma separated).
    let symbols = std::env::var("SYMBOLS").unwrap_or_else(|_| "tBTCUSD".to_string());
    for symbol in symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Err(e) = core.subscribe("ticker", symbol, None).await {
            tracing::warn!("Could not subscribe ticker {}: {}", symbol, e);
        }
        if let Err(e) = core
            .subscribe("candles", symbol, Some("1m".parse()?))
            .await
        {
            tracing::warn!("Could not subscribe candles {}: {}", symbol, e);
        }
    }

    // Periodic status report until shutdown.
    let status_core = core.clone();
    let status = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let risk = status_core.risk_status();
            match serde_json::to_string(&risk) {
                Ok(json) => println!("STATUS_JSON:{}", json),
                Err(e) => tracing::warn!("Status serialization failed: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    status.abort();
    core.shutdown().await;
    Ok(())
}
