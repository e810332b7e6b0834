//! WS-first market data access with a single REST fallback path.
//!
//! No other module calls REST directly for real-time prices; everything
//! routes through here so freshness labelling and source counters stay
//! consistent.

use crate::application::market_data::cache::{CandleCache, TickerCache};
use crate::domain::errors::ApiError;
use crate::domain::ports::MarketApi;
use crate::domain::timeframe::Timeframe;
use crate::domain::types::{Candle, DataSource, MarketDataResponse, Ticker};
use crate::infrastructure::observability::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct MarketDataFacade {
    tickers: Arc<TickerCache>,
    candles: Arc<CandleCache>,
    rest: Arc<dyn MarketApi>,
    metrics: Metrics,
    ticker_stale_after: Duration,
    candle_stale_after: Duration,
}

impl MarketDataFacade {
    pub fn new(
        tickers: Arc<TickerCache>,
        candles: Arc<CandleCache>,
        rest: Arc<dyn MarketApi>,
        metrics: Metrics,
        ws_ticker_stale_secs: u64,
        candle_stale_secs: u64,
    ) -> Self {
        Self {
            tickers,
            candles,
            rest,
            metrics,
            ticker_stale_after: Duration::from_secs(ws_ticker_stale_secs),
            candle_stale_after: Duration::from_secs(candle_stale_secs),
        }
    }

    /// Fresh WS cache value, else REST; the response carries its source and
    /// age so callers can enforce their own staleness policies on top.
    pub async fn get_ticker(
        &self,
        symbol: &str,
    ) -> Result<MarketDataResponse<Ticker>, ApiError> {
        if let Some((ticker, age)) = self.tickers.get(symbol) {
            if age <= self.ticker_stale_after {
                self.metrics
                    .marketdata_ws_total
                    .with_label_values(&["ticker"])
                    .inc();
                return Ok(MarketDataResponse {
                    payload: ticker,
                    source: DataSource::Ws,
                    age_ms: age.as_millis() as u64,
                    reason: None,
                });
            }
            debug!(
                "MarketDataFacade: ticker {} stale ({:?}), falling back to REST",
                symbol, age
            );
            return self.ticker_via_rest(symbol, "ws_cache_stale").await;
        }
        self.ticker_via_rest(symbol, "ws_cache_miss").await
    }

    async fn ticker_via_rest(
        &self,
        symbol: &str,
        reason: &str,
    ) -> Result<MarketDataResponse<Ticker>, ApiError> {
        let ticker = self.rest.ticker(symbol).await?;
        self.tickers.upsert(symbol, ticker);
        self.metrics
            .marketdata_rest_total
            .with_label_values(&["ticker"])
            .inc();
        Ok(MarketDataResponse {
            payload: ticker,
            source: DataSource::Rest,
            age_ms: 0,
            reason: Some(reason.to_string()),
        })
    }

    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<MarketDataResponse<Vec<Candle>>, ApiError> {
        if let Some((candles, age)) = self.candles.get(symbol, timeframe, limit) {
            // A series shorter than requested is a miss for the range.
            if age <= self.candle_stale_after && candles.len() >= limit {
                self.metrics
                    .marketdata_ws_total
                    .with_label_values(&["candles"])
                    .inc();
                return Ok(MarketDataResponse {
                    payload: candles,
                    source: DataSource::Ws,
                    age_ms: age.as_millis() as u64,
                    reason: None,
                });
            }
        }

        let candles = self.rest.candles(symbol, timeframe, limit).await?;
        self.candles.replace(symbol, timeframe, candles.clone());
        self.metrics
            .marketdata_rest_total
            .with_label_values(&["candles"])
            .inc();
        let skip = candles.len().saturating_sub(limit);
        Ok(MarketDataResponse {
            payload: candles.into_iter().skip(skip).collect(),
            source: DataSource::Rest,
            age_ms: 0,
            reason: Some("ws_cache_miss_or_stale".to_string()),
        })
    }
}
