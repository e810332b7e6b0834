//! Configuration for the trading core.
//!
//! A [`ConfigSource`] resolves keys with precedence
//! [runtime overrides > environment > file defaults]; the typed [`Config`]
//! aggregate is built from it once at startup and rebuilt on reload.

mod exchange_config;
mod risk_env_config;
mod signal_config;
pub mod source;

pub use exchange_config::ExchangeConfig;
pub use risk_env_config::RiskConfig;
pub use signal_config::SignalConfig;
pub use source::ConfigSource;

use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub risk: RiskConfig,
    pub signal: SignalConfig,

    // Market data freshness
    pub ws_ticker_stale_secs: u64,
    pub candle_stale_secs: u64,
    /// Cached candles retained per (symbol, timeframe).
    pub candle_retention: usize,

    // Order pipeline
    pub dry_run_enabled: bool,
    pub idempotency_ttl_secs: u64,
    pub bracket_snapshot_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub equity_snapshot_path: PathBuf,

    // Scheduler
    pub scheduler_workers: usize,

    // Shutdown
    pub cancel_orders_on_exit: bool,
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// Build the typed aggregate from a source. Call again on reload.
    pub fn load(source: &ConfigSource) -> Result<Self> {
        let risk = RiskConfig::load(source).context("Failed to load risk config")?;
        risk.validate().context("Invalid risk config")?;

        Ok(Self {
            exchange: ExchangeConfig::load(source).context("Failed to load exchange config")?,
            risk,
            signal: SignalConfig::load(source).context("Failed to load signal config")?,
            ws_ticker_stale_secs: source.parse_u64("ws_ticker_stale_secs", 10)?,
            candle_stale_secs: source.parse_u64("candle_stale_secs", 120)?,
            candle_retention: source.parse_usize("candle_retention", 500)?,
            dry_run_enabled: source.parse_bool("dry_run_enabled", false),
            idempotency_ttl_secs: source.parse_u64("idempotency_ttl_secs", 3600)?,
            bracket_snapshot_path: PathBuf::from(
                source.get_string("bracket_snapshot_path", "state/brackets.json"),
            ),
            audit_log_path: PathBuf::from(
                source.get_string("audit_log_path", "state/audit.jsonl"),
            ),
            equity_snapshot_path: PathBuf::from(
                source.get_string("equity_snapshot_path", "state/equity.jsonl"),
            ),
            scheduler_workers: source.parse_usize("scheduler_workers", 4)?,
            cancel_orders_on_exit: source.parse_bool("cancel_orders_on_exit", false),
            shutdown_grace_secs: source.parse_u64("shutdown_grace_secs", 5)?,
        })
    }
}
