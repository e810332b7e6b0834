//! Incremental indicator state: EMA, RSI, ATR and ADX, each O(1) per new
//! candle after a seeding window.
//!
//! Seeding follows the standard constructions: EMA seeds with the SMA of the
//! first `period` closes; RSI/ATR/ADX use Wilder's smoothing with an SMA
//! seed. Non-finite inputs poison the state until `reset`.

use crate::domain::types::{Candle, SignalFeatures};
use rust_decimal::prelude::ToPrimitive;

/// Exponential moving average.
///
///   multiplier = 2 / (period + 1)
///   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: f64,
    seed: Vec<f64>,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            multiplier: 2.0 / (period.max(1) as f64 + 1.0),
            seed: Vec::new(),
            value: None,
        }
    }

    pub fn update(&mut self, close: f64) -> Option<f64> {
        if !close.is_finite() {
            return self.value;
        }
        match self.value {
            Some(prev) => {
                self.value = Some(close * self.multiplier + prev * (1.0 - self.multiplier));
            }
            None => {
                self.seed.push(close);
                if self.seed.len() >= self.period {
                    let sma = self.seed.iter().sum::<f64>() / self.period as f64;
                    self.value = Some(sma);
                    self.seed.clear();
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Relative Strength Index with Wilder's smoothing.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    seed_gains: Vec<f64>,
    seed_losses: Vec<f64>,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            seed_gains: Vec::new(),
            seed_losses: Vec::new(),
            avg_gain: None,
            avg_loss: None,
        }
    }

    pub fn update(&mut self, close: f64) -> Option<f64> {
        if !close.is_finite() {
            return self.value();
        }
        let Some(prev) = self.prev_close.replace(close) else {
            return None;
        };
        let delta = close - prev;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        let period_f = self.period as f64;

        match (self.avg_gain, self.avg_loss) {
            (Some(avg_gain), Some(avg_loss)) => {
                self.avg_gain = Some((avg_gain * (period_f - 1.0) + gain) / period_f);
                self.avg_loss = Some((avg_loss * (period_f - 1.0) + loss) / period_f);
            }
            _ => {
                self.seed_gains.push(gain);
                self.seed_losses.push(loss);
                if self.seed_gains.len() >= self.period {
                    self.avg_gain = Some(self.seed_gains.iter().sum::<f64>() / period_f);
                    self.avg_loss = Some(self.seed_losses.iter().sum::<f64>() / period_f);
                    self.seed_gains.clear();
                    self.seed_losses.clear();
                }
            }
        }
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        let (avg_gain, avg_loss) = (self.avg_gain?, self.avg_loss?);
        if avg_gain == 0.0 && avg_loss == 0.0 {
            return Some(50.0);
        }
        if avg_loss == 0.0 {
            return Some(100.0);
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

/// Average True Range with Wilder's smoothing.
///
///   TR = max(H - L, |H - prevClose|, |L - prevClose|)
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    prev_close: Option<f64>,
    seed: Vec<f64>,
    value: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            seed: Vec::new(),
            value: None,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        if !(high.is_finite() && low.is_finite() && close.is_finite()) {
            return self.value;
        }
        let prev_close = self.prev_close.replace(close);
        let Some(prev_close) = prev_close else {
            return None;
        };
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        let period_f = self.period as f64;

        match self.value {
            Some(prev) => {
                self.value = Some((prev * (period_f - 1.0) + tr) / period_f);
            }
            None => {
                self.seed.push(tr);
                if self.seed.len() >= self.period {
                    self.value = Some(self.seed.iter().sum::<f64>() / period_f);
                    self.seed.clear();
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Average Directional Index: trend strength regardless of direction.
#[derive(Debug, Clone)]
pub struct Adx {
    period: usize,
    prev: Option<(f64, f64, f64)>,
    // Wilder-smoothed +DM / -DM / TR, seeded by plain sums.
    seed_count: usize,
    sm_plus_dm: f64,
    sm_minus_dm: f64,
    sm_tr: f64,
    dx_seed: Vec<f64>,
    adx: Option<f64>,
}

impl Adx {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev: None,
            seed_count: 0,
            sm_plus_dm: 0.0,
            sm_minus_dm: 0.0,
            sm_tr: 0.0,
            dx_seed: Vec::new(),
            adx: None,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        if !(high.is_finite() && low.is_finite() && close.is_finite()) {
            return self.adx;
        }
        let Some((prev_high, prev_low, prev_close)) = self.prev.replace((high, low, close))
        else {
            return None;
        };

        let up_move = high - prev_high;
        let down_move = prev_low - low;
        let plus_dm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let minus_dm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        let period_f = self.period as f64;

        if self.seed_count < self.period {
            self.sm_plus_dm += plus_dm;
            self.sm_minus_dm += minus_dm;
            self.sm_tr += tr;
            self.seed_count += 1;
            if self.seed_count < self.period {
                return None;
            }
        } else {
            self.sm_plus_dm = self.sm_plus_dm - self.sm_plus_dm / period_f + plus_dm;
            self.sm_minus_dm = self.sm_minus_dm - self.sm_minus_dm / period_f + minus_dm;
            self.sm_tr = self.sm_tr - self.sm_tr / period_f + tr;
        }

        if self.sm_tr <= 0.0 {
            return self.adx;
        }
        let plus_di = 100.0 * self.sm_plus_dm / self.sm_tr;
        let minus_di = 100.0 * self.sm_minus_dm / self.sm_tr;
        let di_sum = plus_di + minus_di;
        if di_sum <= 0.0 {
            return self.adx;
        }
        let dx = 100.0 * (plus_di - minus_di).abs() / di_sum;

        match self.adx {
            Some(prev_adx) => {
                self.adx = Some((prev_adx * (period_f - 1.0) + dx) / period_f);
            }
            None => {
                self.dx_seed.push(dx);
                if self.dx_seed.len() >= self.period {
                    self.adx = Some(self.dx_seed.iter().sum::<f64>() / period_f);
                    self.dx_seed.clear();
                }
            }
        }
        self.adx
    }

    pub fn value(&self) -> Option<f64> {
        self.adx
    }
}

/// The full indicator set used by the signal engine, advanced candle by
/// candle in arrival order.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    ema_fast: Ema,
    ema_slow: Ema,
    rsi: Rsi,
    atr: Atr,
    adx: Adx,
    last_close: Option<f64>,
}

impl IndicatorSet {
    pub fn new(
        ema_fast_period: usize,
        ema_slow_period: usize,
        rsi_period: usize,
        atr_period: usize,
        adx_period: usize,
    ) -> Self {
        Self {
            ema_fast: Ema::new(ema_fast_period),
            ema_slow: Ema::new(ema_slow_period),
            rsi: Rsi::new(rsi_period),
            atr: Atr::new(atr_period),
            adx: Adx::new(adx_period),
            last_close: None,
        }
    }

    pub fn update(&mut self, candle: &Candle) {
        let close = candle.close.to_f64().unwrap_or(f64::NAN);
        let high = candle.high.to_f64().unwrap_or(f64::NAN);
        let low = candle.low.to_f64().unwrap_or(f64::NAN);
        self.ema_fast.update(close);
        self.ema_slow.update(close);
        self.rsi.update(close);
        self.atr.update(high, low, close);
        self.adx.update(high, low, close);
        if close.is_finite() {
            self.last_close = Some(close);
        }
    }

    /// Snapshot once every component has warmed up.
    pub fn features(&self) -> Option<SignalFeatures> {
        Some(SignalFeatures {
            ema_fast: self.ema_fast.value()?,
            ema_slow: self.ema_slow.value()?,
            rsi: self.rsi.value()?,
            atr: self.atr.value()?,
            adx: self.adx.value()?,
            last_close: self.last_close?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            mts: 0,
            open: Decimal::from_f64_retain(open).unwrap(),
            close: Decimal::from_f64_retain(close).unwrap(),
            high: Decimal::from_f64_retain(high).unwrap(),
            low: Decimal::from_f64_retain(low).unwrap(),
            volume: Decimal::ONE,
        }
    }

    #[test]
    fn test_ema_seeds_with_sma_then_smooths() {
        let mut ema = Ema::new(5);
        for close in [1.0, 2.0, 3.0, 4.0] {
            assert!(ema.update(close).is_none());
        }
        // Seed = SMA of first 5 = 3.0
        assert_eq!(ema.update(5.0), Some(3.0));

        let mult = 2.0 / 6.0;
        let expected = 6.0 * mult + 3.0 * (1.0 - mult);
        let next = ema.update(6.0).unwrap();
        assert!((next - expected).abs() < 1e-10);
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let mut rsi = Rsi::new(14);
        let mut last = None;
        for i in 1..=30 {
            last = rsi.update(i as f64);
        }
        assert!((last.unwrap() - 100.0).abs() < 1e-10);
    }

    #[test]
    fn test_rsi_all_losses_is_0() {
        let mut rsi = Rsi::new(14);
        let mut last = None;
        for i in (1..=30).rev() {
            last = rsi.update(i as f64);
        }
        assert!(last.unwrap().abs() < 1e-10);
    }

    #[test]
    fn test_rsi_flat_is_50() {
        let mut rsi = Rsi::new(14);
        let mut last = None;
        for _ in 0..30 {
            last = rsi.update(100.0);
        }
        assert!((last.unwrap() - 50.0).abs() < 1e-10);
    }

    #[test]
    fn test_rsi_in_range() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let mut rsi = Rsi::new(14);
        for close in closes {
            if let Some(value) = rsi.update(close) {
                assert!((0.0..=100.0).contains(&value), "RSI {} out of range", value);
            }
        }
        assert!(rsi.value().is_some());
    }

    #[test]
    fn test_atr_constant_range_converges() {
        let mut atr = Atr::new(14);
        let mut last = None;
        for i in 0..40 {
            let base = 100.0 + i as f64 * 0.1;
            last = atr.update(base + 5.0, base - 5.0, base);
        }
        let value = last.unwrap();
        assert!((value - 10.0).abs() < 1.0, "expected ATR near 10, got {}", value);
    }

    #[test]
    fn test_atr_uses_gap_over_range() {
        let mut atr = Atr::new(3);
        atr.update(105.0, 95.0, 95.0);
        // Gap up: |115 - 95| = 20 dominates the 7-point bar range.
        atr.update(115.0, 108.0, 112.0);
        atr.update(118.0, 110.0, 115.0);
        let value = atr.update(120.0, 113.0, 118.0).unwrap();
        assert!(value > 7.0, "ATR should reflect the gap, got {}", value);
    }

    #[test]
    fn test_adx_needs_two_periods_to_warm_up() {
        let mut adx = Adx::new(5);
        let mut produced_at = None;
        for i in 0..30 {
            let base = 100.0 + i as f64 * 2.0;
            if adx.update(base + 1.0, base - 1.0, base).is_some() && produced_at.is_none() {
                produced_at = Some(i);
            }
        }
        let first = produced_at.expect("ADX never produced a value");
        assert!(first >= 9, "ADX warmed up too early at bar {}", first);
    }

    #[test]
    fn test_adx_high_in_strong_trend() {
        let mut adx = Adx::new(14);
        let mut last = None;
        for i in 0..80 {
            let base = 100.0 + i as f64 * 3.0;
            last = adx.update(base + 1.0, base - 1.0, base + 0.5);
        }
        let value = last.unwrap();
        assert!(value > 60.0, "steady trend should yield high ADX, got {}", value);
    }

    #[test]
    fn test_indicator_set_features_complete_after_warmup() {
        let mut set = IndicatorSet::new(12, 26, 14, 14, 14);
        for i in 0..80 {
            let base = 100.0 + (i as f64 * 0.7).sin() * 10.0 + i as f64 * 0.2;
            set.update(&candle(base, base + 2.0, base - 2.0, base + 0.5));
        }
        let features = set.features().expect("all indicators warmed up");
        assert!(features.ema_fast > 0.0);
        assert!(features.ema_slow > 0.0);
        assert!((0.0..=100.0).contains(&features.rsi));
        assert!(features.atr > 0.0);
        assert!((0.0..=100.0).contains(&features.adx));
    }
}
