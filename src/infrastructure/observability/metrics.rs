//! Prometheus metric definitions for the trading core.
//!
//! All metrics use the `bfxtrader_` prefix and are read-only for consumers;
//! the registry is exported by the embedding surface (out of scope here).

use prometheus::{
    core::{AtomicF64, GenericGauge, GenericGaugeVec},
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    /// Market-data responses served from the WS cache.
    pub marketdata_ws_total: CounterVec,
    /// Market-data responses served via REST fallback.
    pub marketdata_rest_total: CounterVec,
    /// Raw cache upserts from stream events.
    pub marketdata_cache_total: CounterVec,

    /// Token-bucket level per endpoint class.
    pub rate_tokens_available: GenericGaugeVec<AtomicF64>,
    /// Bucket utilization percentage per endpoint class.
    pub rate_utilization_pct: GenericGaugeVec<AtomicF64>,

    /// Breaker state per name (0=closed, 1=half-open, 2=open).
    pub breaker_state: GenericGaugeVec<AtomicF64>,

    /// REST attempts by endpoint and status class.
    pub api_requests_total: CounterVec,
    pub api_latency_seconds: HistogramVec,

    /// Order pipeline outcomes by side and terminal result.
    pub orders_total: CounterVec,
    pub risk_denials_total: CounterVec,
    pub idempotency_hits_total: CounterVec,
    pub dead_letter_total: CounterVec,

    pub ws_reconnects_total: CounterVec,
    pub ws_dropped_events_total: CounterVec,

    pub signals_total: CounterVec,

    pub equity_usd: GenericGauge<AtomicF64>,
    pub equity_fallback_total: CounterVec,

    pub scheduler_runs_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let marketdata_ws_total = CounterVec::new(
            Opts::new("bfxtrader_marketdata_ws_total", "Responses served from WS cache"),
            &["kind"],
        )?;
        registry.register(Box::new(marketdata_ws_total.clone()))?;

        let marketdata_rest_total = CounterVec::new(
            Opts::new(
                "bfxtrader_marketdata_rest_total",
                "Responses served via REST fallback",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(marketdata_rest_total.clone()))?;

        let marketdata_cache_total = CounterVec::new(
            Opts::new(
                "bfxtrader_marketdata_cache_total",
                "Cache upserts from stream events",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(marketdata_cache_total.clone()))?;

        let rate_tokens_available = GaugeVec::new(
            Opts::new(
                "bfxtrader_rate_tokens_available",
                "Token bucket level per endpoint class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(rate_tokens_available.clone()))?;

        let rate_utilization_pct = GaugeVec::new(
            Opts::new(
                "bfxtrader_rate_utilization_pct",
                "Bucket utilization percentage per endpoint class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(rate_utilization_pct.clone()))?;

        let breaker_state = GaugeVec::new(
            Opts::new(
                "bfxtrader_breaker_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["name"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let api_requests_total = CounterVec::new(
            Opts::new("bfxtrader_api_requests_total", "REST attempts by endpoint"),
            &["endpoint", "status"],
        )?;
        registry.register(Box::new(api_requests_total.clone()))?;

        let api_latency_seconds = HistogramVec::new(
            HistogramOpts::new("bfxtrader_api_latency_seconds", "REST attempt latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["endpoint"],
        )?;
        registry.register(Box::new(api_latency_seconds.clone()))?;

        let orders_total = CounterVec::new(
            Opts::new("bfxtrader_orders_total", "Order pipeline outcomes"),
            &["side", "outcome"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let risk_denials_total = CounterVec::new(
            Opts::new("bfxtrader_risk_denials_total", "Risk gate denials"),
            &["gate"],
        )?;
        registry.register(Box::new(risk_denials_total.clone()))?;

        let idempotency_hits_total = CounterVec::new(
            Opts::new(
                "bfxtrader_idempotency_hits_total",
                "Order submissions answered from the idempotency cache",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(idempotency_hits_total.clone()))?;

        let dead_letter_total = CounterVec::new(
            Opts::new(
                "bfxtrader_dead_letter_total",
                "Order submissions parked in the replay queue",
            ),
            &["symbol"],
        )?;
        registry.register(Box::new(dead_letter_total.clone()))?;

        let ws_reconnects_total = CounterVec::new(
            Opts::new("bfxtrader_ws_reconnects_total", "WebSocket reconnect attempts"),
            &["socket"],
        )?;
        registry.register(Box::new(ws_reconnects_total.clone()))?;

        let ws_dropped_events_total = CounterVec::new(
            Opts::new(
                "bfxtrader_ws_dropped_events_total",
                "Stream events dropped by bounded queues",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(ws_dropped_events_total.clone()))?;

        let signals_total = CounterVec::new(
            Opts::new("bfxtrader_signals_total", "Signals generated"),
            &["symbol", "side"],
        )?;
        registry.register(Box::new(signals_total.clone()))?;

        let equity_usd = Gauge::with_opts(Opts::new(
            "bfxtrader_equity_usd",
            "Last observed account equity in USD",
        ))?;
        registry.register(Box::new(equity_usd.clone()))?;

        let equity_fallback_total = CounterVec::new(
            Opts::new(
                "bfxtrader_equity_fallback_total",
                "Risk evaluations that used the equity fallback",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(equity_fallback_total.clone()))?;

        let scheduler_runs_total = CounterVec::new(
            Opts::new("bfxtrader_scheduler_runs_total", "Scheduler job executions"),
            &["job", "outcome"],
        )?;
        registry.register(Box::new(scheduler_runs_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            marketdata_ws_total,
            marketdata_rest_total,
            marketdata_cache_total,
            rate_tokens_available,
            rate_utilization_pct,
            breaker_state,
            api_requests_total,
            api_latency_seconds,
            orders_total,
            risk_denials_total,
            idempotency_hits_total,
            dead_letter_total,
            ws_reconnects_total,
            ws_dropped_events_total,
            signals_total,
            equity_usd,
            equity_fallback_total,
            scheduler_runs_total,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics
            .marketdata_ws_total
            .with_label_values(&["ticker"])
            .inc();
        metrics.equity_usd.set(12_345.0);

        let text = metrics.encode().unwrap();
        assert!(text.contains("bfxtrader_marketdata_ws_total"));
        assert!(text.contains("bfxtrader_equity_usd 12345"));
    }

    #[test]
    fn test_duplicate_registration_fails_fast() {
        // Two independent Metrics instances each own their registry, so
        // constructing twice must not collide.
        let a = Metrics::new();
        let b = Metrics::new();
        assert!(a.is_ok());
        assert!(b.is_ok());
    }
}
