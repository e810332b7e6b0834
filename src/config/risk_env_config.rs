//! Risk policy configuration: trade caps, cooldowns, equity guards and the
//! trading-window definition.

use crate::config::source::ConfigSource;
use anyhow::{Context, Result};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_trades_per_day: u32,
    pub max_trades_per_symbol_per_day: u32,
    pub trade_cooldown_seconds: u64,
    /// Daily loss fraction that trips the kill switch, e.g. 0.05.
    pub max_daily_loss_pct: f64,
    /// Drawdown fraction from peak equity that trips the kill switch.
    pub kill_switch_drawdown_pct: f64,
    /// How long an automatically tripped kill switch stays engaged.
    pub kill_switch_cooldown_hours: u64,
    /// Max position notional as a fraction of equity.
    pub max_position_pct: f64,
    /// Max summed notional exposure as a fraction of equity.
    pub max_total_exposure_pct: f64,
    /// Raw window spec, e.g. `Mon-Fri 08:00-22:00, Sat 10:00-14:00`.
    pub trading_windows: String,
    pub timezone: Tz,
    /// Hard deadline for the equity fetch inside a risk evaluation.
    pub equity_deadline_ms: u64,
    /// Constant fallback used before any successful equity fetch.
    pub equity_fallback_usd: f64,
}

impl RiskConfig {
    pub fn load(source: &ConfigSource) -> Result<Self> {
        let tz_name = source.get_string("timezone", "UTC");
        let timezone: Tz = tz_name
            .parse()
            .ok()
            .with_context(|| format!("Invalid timezone: {}", tz_name))?;

        Ok(Self {
            max_trades_per_day: source.parse_u32("max_trades_per_day", 20)?,
            max_trades_per_symbol_per_day: source.parse_u32("max_trades_per_symbol_per_day", 5)?,
            trade_cooldown_seconds: source.parse_u64("trade_cooldown_seconds", 300)?,
            max_daily_loss_pct: source.parse_f64("max_daily_loss_pct", 0.05)?,
            kill_switch_drawdown_pct: source.parse_f64("kill_switch_drawdown_pct", 0.10)?,
            kill_switch_cooldown_hours: source.parse_u64("kill_switch_cooldown_hours", 24)?,
            max_position_pct: source.parse_f64("max_position_pct", 0.10)?,
            max_total_exposure_pct: source.parse_f64("max_total_exposure_pct", 0.50)?,
            trading_windows: source.get_string("trading_windows", "Mon-Sun 00:00-23:59"),
            timezone,
            equity_deadline_ms: source.parse_u64("equity_deadline_ms", 2000)?,
            equity_fallback_usd: source.parse_f64("equity_fallback_usd", 0.0)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.max_daily_loss_pct) {
            anyhow::bail!(
                "max_daily_loss_pct must be in [0, 1), got {}",
                self.max_daily_loss_pct
            );
        }
        if !(0.0..1.0).contains(&self.kill_switch_drawdown_pct) {
            anyhow::bail!(
                "kill_switch_drawdown_pct must be in [0, 1), got {}",
                self.kill_switch_drawdown_pct
            );
        }
        if self.max_position_pct <= 0.0 || self.max_total_exposure_pct <= 0.0 {
            anyhow::bail!("exposure limits must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = RiskConfig::load(&ConfigSource::new()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_trades_per_day, 20);
        assert_eq!(cfg.timezone, chrono_tz::UTC);
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let source = ConfigSource::new();
        source.set_override("timezone", Some("Mars/Olympus".into()));
        assert!(RiskConfig::load(&source).is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_loss() {
        let source = ConfigSource::new();
        source.set_override("max_daily_loss_pct", Some("1.5".into()));
        let cfg = RiskConfig::load(&source).unwrap();
        assert!(cfg.validate().is_err());
    }
}
