//! Signal computation per (symbol, timeframe): indicator rules decide the
//! side, normalized threshold distances the confidence, and a pluggable
//! scoring backend the probability. Scores are cached with a TTL and
//! invalidated when a candle closes for the symbol.

use crate::application::market_data::MarketDataFacade;
use crate::application::signal::indicators::IndicatorSet;
use crate::application::signal::model::{heuristic_probability, ProbabilityModel};
use crate::config::SignalConfig;
use crate::domain::errors::ApiError;
use crate::domain::timeframe::Timeframe;
use crate::domain::types::{SignalFeatures, SignalScore, SignalSide};
use crate::infrastructure::observability::Metrics;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Trend distance (|ema_fast/ema_slow - 1|) that counts as full strength.
const TREND_FULL_STRENGTH: f64 = 0.005;

struct CachedScore {
    score: SignalScore,
    computed_at: Instant,
}

pub struct SignalEngine {
    config: SignalConfig,
    facade: Arc<MarketDataFacade>,
    model: RwLock<Option<ProbabilityModel>>,
    cache: Mutex<HashMap<(String, Timeframe), CachedScore>>,
    ttl: Duration,
    metrics: Metrics,
}

impl SignalEngine {
    pub fn new(config: SignalConfig, facade: Arc<MarketDataFacade>, metrics: Metrics) -> Self {
        let model = Self::load_model(config.prob_model_file.as_deref());
        if model.is_none() {
            info!("SignalEngine: Heuristic probability backend active");
        }
        let ttl = Duration::from_secs(config.signal_ttl_secs);
        Self {
            config,
            facade,
            model: RwLock::new(model),
            cache: Mutex::new(HashMap::new()),
            ttl,
            metrics,
        }
    }

    fn load_model(path: Option<&str>) -> Option<ProbabilityModel> {
        let path = path?;
        match ProbabilityModel::load(Path::new(path)) {
            Ok(model) => Some(model),
            Err(e) => {
                warn!(
                    "SignalEngine: Could not load probability model ({:#}); using heuristic",
                    e
                );
                None
            }
        }
    }

    /// Revalidate and hot-swap the configured model file. Returns whether a
    /// model backend is active afterwards.
    pub fn reload_model(&self) -> bool {
        let model = Self::load_model(self.config.prob_model_file.as_deref());
        let active = model.is_some();
        *self.model.write().expect("model lock poisoned") = model;
        active
    }

    /// Recompute every cached score whose TTL has lapsed, keeping the
    /// per-symbol regime view warm between order evaluations.
    pub async fn refresh_expired(&self) -> usize {
        let expired: Vec<(String, Timeframe)> = {
            let cache = self.cache.lock().expect("signal cache lock poisoned");
            cache
                .iter()
                .filter(|(_, cached)| cached.computed_at.elapsed() > self.ttl)
                .map(|(key, _)| key.clone())
                .collect()
        };
        for (symbol, timeframe) in &expired {
            if let Err(e) = self.get_signal(symbol, *timeframe).await {
                warn!(
                    "SignalEngine: Refresh failed for {} {}: {}",
                    symbol, timeframe, e
                );
            }
        }
        expired.len()
    }

    /// Current signal, served from cache within the TTL.
    pub async fn get_signal(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<SignalScore, ApiError> {
        {
            let cache = self.cache.lock().expect("signal cache lock poisoned");
            if let Some(cached) = cache.get(&(symbol.to_string(), timeframe)) {
                if cached.computed_at.elapsed() <= self.ttl {
                    return Ok(cached.score.clone());
                }
            }
        }

        let candles = self
            .facade
            .get_candles(symbol, timeframe, self.config.candle_lookback)
            .await?;

        let mut set = IndicatorSet::new(
            self.config.ema_fast_period,
            self.config.ema_slow_period,
            self.config.rsi_period,
            self.config.atr_period,
            self.config.adx_period,
        );
        for candle in &candles.payload {
            set.update(candle);
        }

        let score = match set.features() {
            Some(features) => self.score(symbol, timeframe, features),
            None => SignalScore {
                symbol: symbol.to_string(),
                timeframe,
                side: SignalSide::Hold,
                confidence: 0.0,
                probability: 0.5,
                features: SignalFeatures::default(),
                generated_at_ms: Utc::now().timestamp_millis(),
            },
        };

        self.metrics
            .signals_total
            .with_label_values(&[symbol, &score.side.to_string()])
            .inc();
        self.cache
            .lock()
            .expect("signal cache lock poisoned")
            .insert(
                (symbol.to_string(), timeframe),
                CachedScore {
                    score: score.clone(),
                    computed_at: Instant::now(),
                },
            );
        Ok(score)
    }

    /// Drop cached scores for a symbol; called when one of its candles
    /// closes so the next read recomputes.
    pub fn invalidate(&self, symbol: &str) {
        self.cache
            .lock()
            .expect("signal cache lock poisoned")
            .retain(|(s, _), _| s != symbol);
    }

    fn score(&self, symbol: &str, timeframe: Timeframe, features: SignalFeatures) -> SignalScore {
        let trend_up = features.ema_fast > features.ema_slow;
        let trend_strength = if features.ema_slow.abs() > f64::EPSILON {
            ((features.ema_fast / features.ema_slow - 1.0).abs() / TREND_FULL_STRENGTH).min(1.0)
        } else {
            0.0
        };
        let trending = features.adx >= self.config.adx_threshold;

        let buy_momentum = features.rsi >= self.config.rsi_threshold;
        let sell_momentum = features.rsi <= 100.0 - self.config.rsi_threshold;

        // Trend and momentum must agree, and ADX must confirm a trend.
        let side = if trending && trend_up && buy_momentum {
            SignalSide::Buy
        } else if trending && !trend_up && sell_momentum {
            SignalSide::Sell
        } else {
            SignalSide::Hold
        };

        let confidence = if side == SignalSide::Hold {
            0.0
        } else {
            let momentum_span = (100.0 - self.config.rsi_threshold).max(1.0);
            let momentum_strength = match side {
                SignalSide::Buy => (features.rsi - self.config.rsi_threshold) / momentum_span,
                SignalSide::Sell => {
                    ((100.0 - self.config.rsi_threshold) - features.rsi) / momentum_span
                }
                SignalSide::Hold => 0.0,
            }
            .clamp(0.0, 1.0);
            let adx_span = (100.0 - self.config.adx_threshold).max(1.0);
            let adx_strength =
                ((features.adx - self.config.adx_threshold) / adx_span).clamp(0.0, 1.0);
            (trend_strength + momentum_strength + adx_strength) / 3.0
        };

        let probability = match &*self.model.read().expect("model lock poisoned") {
            Some(model) => model.probability(&features, side),
            None => match side {
                SignalSide::Hold => 0.5,
                _ => heuristic_probability(confidence),
            },
        };

        SignalScore {
            symbol: symbol.to_string(),
            timeframe,
            side,
            confidence,
            probability,
            features,
            generated_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::market_data::{CandleCache, TickerCache};
    use crate::config::ConfigSource;
    use crate::domain::types::Candle;
    use crate::infrastructure::mock::MockMarketApi;
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;

    fn engine_with(candles: Vec<Candle>) -> (SignalEngine, Arc<CandleCache>) {
        let cache = Arc::new(CandleCache::new(500));
        cache.replace("tBTCUSD", Timeframe::OneMin, candles);
        let facade = Arc::new(MarketDataFacade::new(
            Arc::new(TickerCache::new()),
            cache.clone(),
            Arc::new(MockMarketApi::new()),
            Metrics::new().unwrap(),
            10,
            3600,
        ));
        let config = SignalConfig::load(&ConfigSource::new()).unwrap();
        (
            SignalEngine::new(config, facade, Metrics::new().unwrap()),
            cache,
        )
    }

    fn trending_up(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                Candle {
                    mts: i * 60_000,
                    open: Decimal::from_f64_retain(base).unwrap(),
                    close: Decimal::from_f64_retain(base + 1.5).unwrap(),
                    high: Decimal::from_f64_retain(base + 2.0).unwrap(),
                    low: Decimal::from_f64_retain(base - 0.5).unwrap(),
                    volume: Decimal::ONE,
                }
            })
            .collect()
    }

    fn trending_down(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let base = 1000.0 - i as f64 * 2.0;
                Candle {
                    mts: i * 60_000,
                    open: Decimal::from_f64_retain(base).unwrap(),
                    close: Decimal::from_f64_retain(base - 1.5).unwrap(),
                    high: Decimal::from_f64_retain(base + 0.5).unwrap(),
                    low: Decimal::from_f64_retain(base - 2.0).unwrap(),
                    volume: Decimal::ONE,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_uptrend_scores_buy() {
        let (engine, _) = engine_with(trending_up(120));
        let score = engine.get_signal("tBTCUSD", Timeframe::OneMin).await.unwrap();
        assert_eq!(score.side, SignalSide::Buy);
        assert!(score.confidence > 0.0);
        assert!(score.probability > 0.5);
        assert!(score.features.adx > 20.0);
    }

    #[tokio::test]
    async fn test_downtrend_scores_sell() {
        let (engine, _) = engine_with(trending_down(120));
        let score = engine.get_signal("tBTCUSD", Timeframe::OneMin).await.unwrap();
        assert_eq!(score.side, SignalSide::Sell);
        assert!(score.probability > 0.5);
    }

    #[tokio::test]
    async fn test_insufficient_history_holds() {
        let (engine, _) = engine_with(trending_up(5));
        // 5 cached candles trigger the REST fallback (MockMarketApi serves a
        // choppy series), or a hold when warmup still fails.
        let score = engine.get_signal("tBTCUSD", Timeframe::OneMin).await.unwrap();
        assert!((0.0..=1.0).contains(&score.confidence));
        assert!((0.0..=1.0).contains(&score.probability));
    }

    #[tokio::test]
    async fn test_signal_cached_within_ttl_and_invalidated() {
        let (engine, cache) = engine_with(trending_up(120));
        let first = engine.get_signal("tBTCUSD", Timeframe::OneMin).await.unwrap();
        let second = engine.get_signal("tBTCUSD", Timeframe::OneMin).await.unwrap();
        assert_eq!(first.generated_at_ms, second.generated_at_ms);

        // New closed candle invalidates the cache for the symbol.
        cache.replace("tBTCUSD", Timeframe::OneMin, trending_down(120));
        engine.invalidate("tBTCUSD");
        let third = engine.get_signal("tBTCUSD", Timeframe::OneMin).await.unwrap();
        assert_eq!(third.side, SignalSide::Sell);
    }

    #[tokio::test]
    async fn test_rest_fallback_used_when_cache_empty() {
        let cache = Arc::new(CandleCache::new(500));
        let api = Arc::new(MockMarketApi::new());
        let facade = Arc::new(MarketDataFacade::new(
            Arc::new(TickerCache::new()),
            cache,
            api.clone(),
            Metrics::new().unwrap(),
            10,
            3600,
        ));
        let config = SignalConfig::load(&ConfigSource::new()).unwrap();
        let engine = SignalEngine::new(config, facade, Metrics::new().unwrap());

        let _ = engine.get_signal("tETHUSD", Timeframe::FiveMin).await.unwrap();
        assert_eq!(api.candle_calls.load(Ordering::SeqCst), 1);
    }
}
