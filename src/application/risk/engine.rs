//! Layered risk gate in front of every order.
//!
//! Gates run in a fixed order and the first denial wins; nothing downstream
//! (including the equity fetch) runs once a gate has denied. The engine never
//! retries; decisions derive from current state only.
//!
//! Gate order: kill switch, pause, trading window, global daily cap,
//! per-symbol daily cap, cooldown, max daily loss, max drawdown, exposure.

use crate::application::market_data::PrivateState;
use crate::application::risk::trading_window::TradingWindows;
use crate::config::RiskConfig;
use crate::domain::errors::ApiError;
use crate::domain::ports::EquityProvider;
use crate::domain::types::{OrderIntent, RiskStatus};
use crate::infrastructure::observability::Metrics;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

pub const GATE_KILL_SWITCH: &str = "kill_switch";
pub const GATE_PAUSED: &str = "trading_paused";
pub const GATE_WINDOW: &str = "trading_window";
pub const GATE_DAILY_CAP: &str = "max_trades_per_day";
pub const GATE_SYMBOL_CAP: &str = "max_trades_per_symbol";
pub const GATE_COOLDOWN: &str = "cooldown";
pub const GATE_DAILY_LOSS: &str = "max_daily_loss";
pub const GATE_DRAWDOWN: &str = "max_drawdown";
pub const GATE_POSITION_SIZE: &str = "max_position_size";
pub const GATE_TOTAL_EXPOSURE: &str = "max_exposure";

#[derive(Debug, Clone, PartialEq)]
pub struct RiskDecision {
    pub allowed: bool,
    pub gate: Option<String>,
    pub reason: String,
}

impl RiskDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            gate: None,
            reason: "ok".to_string(),
        }
    }

    fn deny(gate: &str, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            gate: Some(gate.to_string()),
            reason: reason.into(),
        }
    }

    pub fn to_error(&self) -> ApiError {
        ApiError::RiskDenied {
            gate: self.gate.clone().unwrap_or_else(|| "unknown".to_string()),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct KillSwitch {
    reason: String,
    until: Option<DateTime<Utc>>,
}

struct RiskState {
    kill_switch: Option<KillSwitch>,
    paused: bool,
    day_key: Option<NaiveDate>,
    daily_start_equity: Option<f64>,
    peak_equity: f64,
    last_known_equity: Option<f64>,
    trades_today: u32,
    trades_by_symbol: HashMap<String, u32>,
    last_trade_at: HashMap<String, DateTime<Utc>>,
    counted_order_ids: HashSet<i64>,
}

impl RiskState {
    fn new() -> Self {
        Self {
            kill_switch: None,
            paused: false,
            day_key: None,
            daily_start_equity: None,
            peak_equity: 0.0,
            last_known_equity: None,
            trades_today: 0,
            trades_by_symbol: HashMap::new(),
            last_trade_at: HashMap::new(),
            counted_order_ids: HashSet::new(),
        }
    }
}

pub struct RiskPolicyEngine {
    limits: RwLock<RiskConfig>,
    windows: RwLock<TradingWindows>,
    equity_provider: Arc<dyn EquityProvider>,
    private: Option<Arc<PrivateState>>,
    state: Mutex<RiskState>,
    metrics: Metrics,
}

impl RiskPolicyEngine {
    pub fn new(
        config: RiskConfig,
        equity_provider: Arc<dyn EquityProvider>,
        private: Option<Arc<PrivateState>>,
        metrics: Metrics,
    ) -> anyhow::Result<Self> {
        let windows = TradingWindows::parse(&config.trading_windows, config.timezone)?;
        Ok(Self {
            limits: RwLock::new(config),
            windows: RwLock::new(windows),
            equity_provider,
            private,
            state: Mutex::new(RiskState::new()),
            metrics,
        })
    }

    fn limits_snapshot(&self) -> RiskConfig {
        self.limits.read().expect("risk limits lock poisoned").clone()
    }

    /// Replace the active limits and trading windows (configuration reload).
    /// Counters, anchors and the kill switch are preserved.
    pub fn update_limits(&self, config: RiskConfig) -> anyhow::Result<()> {
        config.validate()?;
        let windows = TradingWindows::parse(&config.trading_windows, config.timezone)?;
        *self.windows.write().expect("trading windows lock poisoned") = windows;
        *self.limits.write().expect("risk limits lock poisoned") = config;
        info!("RiskPolicyEngine: Limits reloaded");
        Ok(())
    }

    /// Evaluate one order intent. `ref_price` is the price used for exposure
    /// projection (intent price, or the latest mark for market orders).
    pub async fn evaluate(&self, intent: &OrderIntent, ref_price: Decimal) -> RiskDecision {
        let now = Utc::now();

        // Stage 1: state-only gates, no suspension points.
        if let Some(denial) = self.check_state_gates(intent, now) {
            self.count_denial(&denial);
            return denial;
        }

        // Stage 2: equity-backed gates.
        let equity = self.fetch_equity_bounded().await;
        let denial = self.check_equity_gates(intent, ref_price, equity, now);
        if let Some(denial) = denial {
            self.count_denial(&denial);
            return denial;
        }
        RiskDecision::allow()
    }

    fn count_denial(&self, denial: &RiskDecision) {
        if let Some(gate) = &denial.gate {
            self.metrics
                .risk_denials_total
                .with_label_values(&[gate])
                .inc();
            info!(
                "RiskPolicyEngine: Denied by gate '{}': {}",
                gate, denial.reason
            );
        }
    }

    fn check_state_gates(&self, intent: &OrderIntent, now: DateTime<Utc>) -> Option<RiskDecision> {
        let cfg = self.limits_snapshot();
        let (window_open, window_tz) = {
            let windows = self.windows.read().expect("trading windows lock poisoned");
            (windows.is_open(now), windows.timezone())
        };
        let mut state = self.state.lock().expect("risk state lock poisoned");
        Self::roll_day(&mut state, now, cfg.timezone);

        // Gate 1: kill switch (manual or tripped by equity guards).
        let expired = matches!(
            &state.kill_switch,
            Some(KillSwitch { until: Some(until), .. }) if now >= *until
        );
        if expired {
            info!("RiskPolicyEngine: Kill switch cooldown elapsed, re-arming");
            state.kill_switch = None;
        }
        if let Some(kill) = &state.kill_switch {
            return Some(RiskDecision::deny(
                GATE_KILL_SWITCH,
                format!("kill switch engaged: {}", kill.reason),
            ));
        }

        // Gate 2: operator pause.
        if state.paused {
            return Some(RiskDecision::deny(GATE_PAUSED, "trading paused by operator"));
        }

        // Gate 3: trading window.
        if !window_open {
            return Some(RiskDecision::deny(
                GATE_WINDOW,
                format!("outside trading window ({})", window_tz),
            ));
        }

        // Gate 4: global per-day trade cap.
        if state.trades_today >= cfg.max_trades_per_day {
            return Some(RiskDecision::deny(
                GATE_DAILY_CAP,
                format!(
                    "daily trade cap reached ({}/{})",
                    state.trades_today, cfg.max_trades_per_day
                ),
            ));
        }

        // Gate 5: per-symbol per-day cap.
        let symbol_count = state
            .trades_by_symbol
            .get(&intent.symbol)
            .copied()
            .unwrap_or(0);
        if symbol_count >= cfg.max_trades_per_symbol_per_day {
            return Some(RiskDecision::deny(
                GATE_SYMBOL_CAP,
                format!(
                    "per-symbol cap reached for {} ({}/{})",
                    intent.symbol, symbol_count, cfg.max_trades_per_symbol_per_day
                ),
            ));
        }

        // Gate 6: cooldown since the symbol's last trade.
        if let Some(last) = state.last_trade_at.get(&intent.symbol) {
            let elapsed = now.signed_duration_since(*last);
            let cooldown = ChronoDuration::seconds(cfg.trade_cooldown_seconds as i64);
            if elapsed < cooldown {
                return Some(RiskDecision::deny(
                    GATE_COOLDOWN,
                    format!(
                        "cooldown active for {} ({}s of {}s elapsed)",
                        intent.symbol,
                        elapsed.num_seconds(),
                        cfg.trade_cooldown_seconds
                    ),
                ));
            }
        }

        None
    }

    /// Equity under a hard deadline; falls back to the last known good value
    /// (or the configured constant before any success), logging the event.
    async fn fetch_equity_bounded(&self) -> f64 {
        let cfg = self.limits_snapshot();
        let deadline = Duration::from_millis(cfg.equity_deadline_ms);
        match tokio::time::timeout(deadline, self.equity_provider.equity_usd()).await {
            Ok(Ok(equity)) => {
                let mut state = self.state.lock().expect("risk state lock poisoned");
                state.last_known_equity = Some(equity);
                self.metrics.equity_usd.set(equity);
                equity
            }
            Ok(Err(e)) => {
                self.metrics
                    .equity_fallback_total
                    .with_label_values(&["fetch_error"])
                    .inc();
                let fallback = self.fallback_equity();
                error!(
                    "RiskPolicyEngine: Equity fetch failed ({}), using fallback {}",
                    e, fallback
                );
                fallback
            }
            Err(_) => {
                self.metrics
                    .equity_fallback_total
                    .with_label_values(&["timeout"])
                    .inc();
                let fallback = self.fallback_equity();
                warn!(
                    "RiskPolicyEngine: Equity fetch exceeded {}ms deadline, using fallback {}",
                    cfg.equity_deadline_ms, fallback
                );
                fallback
            }
        }
    }

    fn fallback_equity(&self) -> f64 {
        self.state
            .lock()
            .expect("risk state lock poisoned")
            .last_known_equity
            .unwrap_or_else(|| self.limits_snapshot().equity_fallback_usd)
    }

    fn check_equity_gates(
        &self,
        intent: &OrderIntent,
        ref_price: Decimal,
        equity: f64,
        now: DateTime<Utc>,
    ) -> Option<RiskDecision> {
        let cfg = self.limits_snapshot();
        let mut state = self.state.lock().expect("risk state lock poisoned");

        // Anchor the daily baseline on the first equity observation of the
        // trading day; at most one change per day (P8).
        if state.daily_start_equity.is_none() && equity > 0.0 {
            state.daily_start_equity = Some(equity);
            info!(
                "RiskPolicyEngine: Anchored daily_start_equity = {:.2}",
                equity
            );
        }
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }

        // Gate 7: max daily loss → trips the kill switch.
        if let Some(start) = state.daily_start_equity {
            if start > 0.0 {
                let loss_pct = (start - equity) / start;
                if loss_pct >= cfg.max_daily_loss_pct {
                    let reason = format!(
                        "daily loss {:.2}% >= limit {:.2}%",
                        loss_pct * 100.0,
                        cfg.max_daily_loss_pct * 100.0
                    );
                    Self::trip_locked(&mut state, &reason, now, cfg.kill_switch_cooldown_hours);
                    return Some(RiskDecision::deny(GATE_DAILY_LOSS, reason));
                }
            }
        }

        // Gate 8: max drawdown from peak → trips the kill switch.
        if state.peak_equity > 0.0 {
            let drawdown_pct = (state.peak_equity - equity) / state.peak_equity;
            if drawdown_pct >= cfg.kill_switch_drawdown_pct {
                let reason = format!(
                    "drawdown {:.2}% >= limit {:.2}%",
                    drawdown_pct * 100.0,
                    cfg.kill_switch_drawdown_pct * 100.0
                );
                Self::trip_locked(&mut state, &reason, now, cfg.kill_switch_cooldown_hours);
                return Some(RiskDecision::deny(GATE_DRAWDOWN, reason));
            }
        }

        // Gate 9: exposure limits.
        if equity > 0.0 {
            let projected = (intent.amount * ref_price).to_f64().unwrap_or(0.0).abs();
            let position_pct = projected / equity;
            if position_pct > cfg.max_position_pct {
                return Some(RiskDecision::deny(
                    GATE_POSITION_SIZE,
                    format!(
                        "position {:.2}% of equity > limit {:.2}%",
                        position_pct * 100.0,
                        cfg.max_position_pct * 100.0
                    ),
                ));
            }

            let open_exposure: f64 = self
                .private
                .as_ref()
                .map(|p| {
                    p.positions()
                        .iter()
                        .map(|pos| {
                            (pos.amount * pos.base_price).to_f64().unwrap_or(0.0).abs()
                        })
                        .sum()
                })
                .unwrap_or(0.0);
            let total_pct = (open_exposure + projected) / equity;
            if total_pct > cfg.max_total_exposure_pct {
                return Some(RiskDecision::deny(
                    GATE_TOTAL_EXPOSURE,
                    format!(
                        "total exposure {:.2}% of equity > limit {:.2}%",
                        total_pct * 100.0,
                        cfg.max_total_exposure_pct * 100.0
                    ),
                ));
            }
        }

        None
    }

    fn roll_day(state: &mut RiskState, now: DateTime<Utc>, tz: chrono_tz::Tz) {
        let today = now.with_timezone(&tz).date_naive();
        if state.day_key != Some(today) {
            if state.day_key.is_some() {
                info!("RiskPolicyEngine: New trading day {}, resetting counters", today);
            }
            state.day_key = Some(today);
            state.daily_start_equity = None;
            state.trades_today = 0;
            state.trades_by_symbol.clear();
            state.counted_order_ids.clear();
        }
    }

    fn trip_locked(state: &mut RiskState, reason: &str, now: DateTime<Utc>, cooldown_hours: u64) {
        error!("RiskPolicyEngine: KILL SWITCH tripped: {}", reason);
        state.kill_switch = Some(KillSwitch {
            reason: reason.to_string(),
            until: Some(now + ChronoDuration::hours(cooldown_hours as i64)),
        });
    }

    /// Count an accepted trade; idempotent per exchange order id.
    pub fn record_trade(&self, symbol: &str, ts: DateTime<Utc>, exchange_order_id: i64) {
        let tz = self.limits_snapshot().timezone;
        let mut state = self.state.lock().expect("risk state lock poisoned");
        Self::roll_day(&mut state, ts, tz);
        if !state.counted_order_ids.insert(exchange_order_id) {
            return;
        }
        state.trades_today += 1;
        *state
            .trades_by_symbol
            .entry(symbol.to_string())
            .or_insert(0) += 1;
        state.last_trade_at.insert(symbol.to_string(), ts);
    }

    /// Manual kill switch with no automatic expiry.
    pub fn trip_kill_switch(&self, reason: &str) {
        let mut state = self.state.lock().expect("risk state lock poisoned");
        error!("RiskPolicyEngine: KILL SWITCH engaged manually: {}", reason);
        state.kill_switch = Some(KillSwitch {
            reason: reason.to_string(),
            until: None,
        });
    }

    pub fn clear_kill_switch(&self) {
        let mut state = self.state.lock().expect("risk state lock poisoned");
        if state.kill_switch.take().is_some() {
            info!("RiskPolicyEngine: Kill switch cleared");
        }
    }

    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock().expect("risk state lock poisoned");
        state.paused = paused;
        info!(
            "RiskPolicyEngine: Trading {}",
            if paused { "paused" } else { "resumed" }
        );
    }

    /// Feed an equity observation from outside an evaluation (the equity
    /// snapshot job), keeping peak/daily anchors warm.
    pub fn observe_equity(&self, equity: f64) {
        let tz = self.limits_snapshot().timezone;
        let mut state = self.state.lock().expect("risk state lock poisoned");
        Self::roll_day(&mut state, Utc::now(), tz);
        state.last_known_equity = Some(equity);
        if state.daily_start_equity.is_none() && equity > 0.0 {
            state.daily_start_equity = Some(equity);
        }
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        self.metrics.equity_usd.set(equity);
    }

    pub fn status(&self) -> RiskStatus {
        let state = self.state.lock().expect("risk state lock poisoned");
        let equity = state.last_known_equity.unwrap_or(0.0);
        let start = state.daily_start_equity.unwrap_or(equity);
        let daily_loss_pct = if start > 0.0 {
            ((start - equity) / start).max(0.0)
        } else {
            0.0
        };
        let drawdown_pct = if state.peak_equity > 0.0 {
            ((state.peak_equity - equity) / state.peak_equity).max(0.0)
        } else {
            0.0
        };
        RiskStatus {
            equity_usd: equity,
            daily_start_equity: start,
            peak_equity: state.peak_equity,
            daily_loss_pct,
            drawdown_pct,
            kill_switch_active: state.kill_switch.is_some(),
            kill_switch_reason: state.kill_switch.as_ref().map(|k| k.reason.clone()),
            trading_paused: state.paused,
            window_open: self
                .windows
                .read()
                .expect("trading windows lock poisoned")
                .is_open(Utc::now()),
            dms_enabled: self
                .private
                .as_ref()
                .map(|p| p.dms_active())
                .unwrap_or(false),
            trades_today: state.trades_today,
            trades_today_by_symbol: state
                .trades_by_symbol
                .iter()
                .map(|(s, c)| (s.clone(), *c))
                .collect(),
        }
    }
}
