//! The market-data cache: tickers and candle series fed by the stream
//! clients, read lock-free-style (short read locks, no awaits held) by the
//! facade and the signal engine.

use crate::domain::timeframe::Timeframe;
use crate::domain::types::{Candle, Ticker};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct CachedTicker {
    ticker: Ticker,
    stored_at: Instant,
}

pub struct TickerCache {
    inner: RwLock<HashMap<String, CachedTicker>>,
}

impl TickerCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, symbol: &str, ticker: Ticker) {
        let mut map = self.inner.write().expect("ticker cache lock poisoned");
        map.insert(
            symbol.to_string(),
            CachedTicker {
                ticker,
                stored_at: Instant::now(),
            },
        );
    }

    /// Latest ticker with its age, if any value has been stored.
    pub fn get(&self, symbol: &str) -> Option<(Ticker, Duration)> {
        let map = self.inner.read().expect("ticker cache lock poisoned");
        map.get(symbol)
            .map(|cached| (cached.ticker, cached.stored_at.elapsed()))
    }
}

impl Default for TickerCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a candle upsert, used to detect closed candles: Bitfinex keeps
/// restating the current candle under the same open time, so a new open time
/// means the previous candle just closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleUpsert {
    /// Current candle restated in place.
    Updated,
    /// A new open time appeared; the carried candle is the closed one.
    NewCandle,
}

struct CandleSeries {
    candles: VecDeque<Candle>,
    updated_at: Instant,
}

pub struct CandleCache {
    inner: RwLock<HashMap<(String, Timeframe), CandleSeries>>,
    retention: usize,
}

impl CandleCache {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            retention: retention.max(2),
        }
    }

    /// Replace a series from a snapshot (ascending open time).
    pub fn replace(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        let mut map = self.inner.write().expect("candle cache lock poisoned");
        let mut deque: VecDeque<Candle> = candles.into();
        while deque.len() > self.retention {
            deque.pop_front();
        }
        map.insert(
            (symbol.to_string(), timeframe),
            CandleSeries {
                candles: deque,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn upsert(&self, symbol: &str, timeframe: Timeframe, candle: Candle) -> CandleUpsert {
        let mut map = self.inner.write().expect("candle cache lock poisoned");
        let series = map
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| CandleSeries {
                candles: VecDeque::new(),
                updated_at: Instant::now(),
            });
        series.updated_at = Instant::now();

        match series.candles.back_mut() {
            Some(last) if last.mts == candle.mts => {
                *last = candle;
                CandleUpsert::Updated
            }
            Some(last) if last.mts > candle.mts => {
                // Late restatement of an older candle; patch it if present.
                if let Some(slot) = series.candles.iter_mut().find(|c| c.mts == candle.mts) {
                    *slot = candle;
                }
                CandleUpsert::Updated
            }
            _ => {
                series.candles.push_back(candle);
                while series.candles.len() > self.retention {
                    series.candles.pop_front();
                }
                CandleUpsert::NewCandle
            }
        }
    }

    /// Up to `limit` most recent candles (ascending) with the series age.
    pub fn get(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Option<(Vec<Candle>, Duration)> {
        let map = self.inner.read().expect("candle cache lock poisoned");
        map.get(&(symbol.to_string(), timeframe)).map(|series| {
            let skip = series.candles.len().saturating_sub(limit);
            (
                series.candles.iter().skip(skip).copied().collect(),
                series.updated_at.elapsed(),
            )
        })
    }

    /// The candle closed before the current one, if known.
    pub fn last_closed(&self, symbol: &str, timeframe: Timeframe) -> Option<Candle> {
        let map = self.inner.read().expect("candle cache lock poisoned");
        let series = map.get(&(symbol.to_string(), timeframe))?;
        let len = series.candles.len();
        if len >= 2 {
            series.candles.get(len - 2).copied()
        } else {
            None
        }
    }

    /// Drop series that have not been touched within `max_idle`.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let mut map = self.inner.write().expect("candle cache lock poisoned");
        let before = map.len();
        map.retain(|_, series| series.updated_at.elapsed() <= max_idle);
        before - map.len()
    }
}
