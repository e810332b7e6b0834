//! Signal engine configuration: indicator periods, decision thresholds and
//! the optional probability model.

use crate::config::source::ConfigSource;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub ema_fast_period: usize,
    pub ema_slow_period: usize,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub adx_period: usize,
    /// RSI above this supports buy momentum; 100 minus it supports sell.
    pub rsi_threshold: f64,
    /// Minimum ADX for a trend to be considered established.
    pub adx_threshold: f64,
    /// Candle history pulled per evaluation.
    pub candle_lookback: usize,
    pub signal_ttl_secs: u64,
    /// Optional path to logistic model weights + Platt calibration.
    pub prob_model_file: Option<String>,
}

impl SignalConfig {
    pub fn load(source: &ConfigSource) -> Result<Self> {
        Ok(Self {
            ema_fast_period: source.parse_usize("ema_fast_period", 12)?,
            ema_slow_period: source.parse_usize("ema_slow_period", 26)?,
            rsi_period: source.parse_usize("rsi_period", 14)?,
            atr_period: source.parse_usize("atr_period", 14)?,
            adx_period: source.parse_usize("adx_period", 14)?,
            rsi_threshold: source.parse_f64("rsi_threshold", 55.0)?,
            adx_threshold: source.parse_f64("adx_threshold", 20.0)?,
            candle_lookback: source.parse_usize("candle_lookback", 120)?,
            signal_ttl_secs: source.parse_u64("signal_ttl_secs", 30)?,
            prob_model_file: source.lookup("prob_model_file"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SignalConfig::load(&ConfigSource::new()).unwrap();
        assert_eq!(cfg.ema_fast_period, 12);
        assert_eq!(cfg.ema_slow_period, 26);
        assert!(cfg.prob_model_file.is_none());
    }
}
