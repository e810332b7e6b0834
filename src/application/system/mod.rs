//! Composition root: wires the exchange clients, caches, risk engine,
//! pipeline and scheduler together, and exposes the core API consumed by the
//! outer surfaces (HTTP/WS API, dashboard, notifier).

use crate::application::market_data::{
    CandleCache, MarketDataFacade, PrivateState, TickerCache,
};
use crate::application::orders::{
    BracketGroup, BracketManager, DeadLetter, OrderPipeline, PlaceOrderResult, TtlCache,
};
use crate::application::risk::RiskPolicyEngine;
use crate::application::scheduler::{Priority, Scheduler};
use crate::application::signal::SignalEngine;
use crate::config::{Config, ConfigSource, RiskConfig};
use crate::domain::errors::ApiError;
use crate::domain::ports::CancelScope;
use crate::domain::symbol::SymbolRegistry;
use crate::domain::timeframe::Timeframe;
use crate::domain::types::{
    Candle, MarketDataResponse, OrderIntent, RiskStatus, SignalScore, Ticker,
};
use crate::infrastructure::bitfinex::{
    BitfinexRestClient, PaperOrderApi, StreamEvent, SubscriptionKey, WsManager, WsSettings,
};
use crate::infrastructure::core::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use crate::infrastructure::core::rate_limiter::{EndpointClassifier, RateLimiter};
use crate::infrastructure::nonce::NonceService;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::audit_log::{AuditLog, EquityLog};
use crate::infrastructure::persistence::snapshot::SnapshotStore;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct TradingCore {
    config: Config,
    source: ConfigSource,
    metrics: Metrics,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    rest: Arc<BitfinexRestClient>,
    registry: Arc<SymbolRegistry>,
    private: Arc<PrivateState>,
    facade: Arc<MarketDataFacade>,
    signals: Arc<SignalEngine>,
    risk: Arc<RiskPolicyEngine>,
    pipeline: Arc<OrderPipeline>,
    brackets: Arc<BracketManager>,
    ws: Arc<WsManager>,
    equity_log: Arc<EquityLog>,
    idempotency: Arc<TtlCache<PlaceOrderResult>>,
    candles: Arc<CandleCache>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TradingCore {
    pub async fn build(source: ConfigSource) -> Result<Arc<Self>> {
        let config = Config::load(&source).context("Failed to load configuration")?;
        let metrics = Metrics::new().context("Failed to register metrics")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let breakers = Arc::new(CircuitBreakerRegistry::with_defaults());
        let classifier = match &config.exchange.rate_limit_patterns {
            Some(spec) => EndpointClassifier::from_spec(spec),
            None => EndpointClassifier::bitfinex_default(),
        };
        let limiter = Arc::new(RateLimiter::new(classifier, HashMap::new()));
        let nonce = Arc::new(
            NonceService::open(
                Path::new(&config.exchange.nonce_path),
                &config.exchange.api_key,
            )
            .context("Failed to open nonce store")?,
        );

        let rest = Arc::new(BitfinexRestClient::new(
            config.exchange.clone(),
            limiter.clone(),
            breakers.clone(),
            nonce.clone(),
            metrics.clone(),
        ));

        let registry = Arc::new(SymbolRegistry::new());
        let tickers = Arc::new(TickerCache::new());
        let candles = Arc::new(CandleCache::new(config.candle_retention));
        let private = Arc::new(PrivateState::new());

        let facade = Arc::new(MarketDataFacade::new(
            tickers.clone(),
            candles.clone(),
            rest.clone(),
            metrics.clone(),
            config.ws_ticker_stale_secs,
            config.candle_stale_secs,
        ));

        let signals = Arc::new(SignalEngine::new(
            config.signal.clone(),
            facade.clone(),
            metrics.clone(),
        ));

        let risk = Arc::new(
            RiskPolicyEngine::new(
                config.risk.clone(),
                rest.clone(),
                Some(private.clone()),
                metrics.clone(),
            )
            .context("Failed to build risk engine")?,
        );

        let audit = Arc::new(AuditLog::new(config.audit_log_path.clone()));
        let brackets = Arc::new(BracketManager::new(
            SnapshotStore::new(config.bracket_snapshot_path.clone()),
            rest.clone(),
            registry.clone(),
            audit.clone(),
        ));

        let idempotency = Arc::new(TtlCache::new(Duration::from_secs(
            config.idempotency_ttl_secs,
        )));
        let pipeline = Arc::new(OrderPipeline::new(
            registry.clone(),
            idempotency.clone(),
            risk.clone(),
            rest.clone(),
            Arc::new(PaperOrderApi::new()),
            facade.clone(),
            brackets.clone(),
            audit.clone(),
            metrics.clone(),
            config.dry_run_enabled,
        ));

        let ws = Arc::new(WsManager::new(
            WsSettings::from_config(&config.exchange),
            tickers,
            candles.clone(),
            private.clone(),
            nonce,
            metrics.clone(),
            shutdown_rx,
        ));

        let equity_log = Arc::new(EquityLog::new(config.equity_snapshot_path.clone()));

        Ok(Arc::new(Self {
            config,
            source,
            metrics,
            breakers,
            limiter,
            rest,
            registry,
            private,
            facade,
            signals,
            risk,
            pipeline,
            brackets,
            ws,
            equity_log,
            idempotency,
            candles,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }))
    }

    /// Load exchange state, connect streams and start periodic jobs.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Symbol registry first: validation depends on it.
        match self.rest.symbol_details().await {
            Ok(infos) => self.registry.replace_all(infos),
            Err(e) => warn!(
                "TradingCore: Symbol config fetch failed ({}); validation will use defaults",
                e
            ),
        }

        if let Err(e) = self.brackets.restore_and_reconcile().await {
            warn!("TradingCore: Bracket snapshot restore failed: {:#}", e);
        }

        let mut handles = Vec::new();
        if self.config.exchange.ws_connect_on_start {
            handles.extend(self.ws.spawn());
            handles.push(self.spawn_stream_consumer());
        } else {
            info!("TradingCore: ws_connect_on_start disabled, running REST-only");
        }
        handles.push(self.spawn_scheduler());
        self.handles.lock().expect("handle lock poisoned").extend(handles);

        info!("TradingCore: Started");
        Ok(())
    }

    /// Route stream events to the signal engine and bracket manager. Lagged
    /// drops are counted against the bounded queue.
    fn spawn_stream_consumer(self: &Arc<Self>) -> JoinHandle<()> {
        let core = self.clone();
        let mut events = self.ws.subscribe_events();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(StreamEvent::CandleClosed { symbol, .. }) => {
                            core.signals.invalidate(&symbol);
                        }
                        Ok(StreamEvent::OrderUpdate(record)) => {
                            core.brackets.on_order_event(&record).await;
                        }
                        Ok(StreamEvent::AuthDisconnected) => {
                            warn!("TradingCore: Auth stream disconnected");
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            core.metrics
                                .ws_dropped_events_total
                                .with_label_values(&["events"])
                                .inc_by(n as f64);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            info!("TradingCore: Stream consumer stopped");
        })
    }

    fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let mut scheduler = Scheduler::new(
            self.config.scheduler_workers,
            self.shutdown_tx.subscribe(),
            self.metrics.clone(),
        );

        // critical: stream health + breaker/limiter gauge export.
        {
            let core = self.clone();
            scheduler.add_job("health_check", Priority::Critical, Arc::new(move || {
                let core = core.clone();
                Box::pin(async move {
                    core.export_health_gauges();
                    Ok(())
                })
            }));
        }
        {
            let core = self.clone();
            scheduler.add_job("cb_monitor", Priority::Critical, Arc::new(move || {
                let core = core.clone();
                Box::pin(async move {
                    for snapshot in core.breakers.snapshots() {
                        core.metrics
                            .breaker_state
                            .with_label_values(&[&snapshot.name])
                            .set(match snapshot.state {
                                crate::infrastructure::core::circuit_breaker::BreakerState::Closed => 0.0,
                                crate::infrastructure::core::circuit_breaker::BreakerState::HalfOpen => 1.0,
                                crate::infrastructure::core::circuit_breaker::BreakerState::Open => 2.0,
                            });
                    }
                    Ok(())
                })
            }));
        }

        // high: equity snapshot + bracket reconcile.
        {
            let core = self.clone();
            scheduler.add_job("equity_snapshot", Priority::High, Arc::new(move || {
                let core = core.clone();
                Box::pin(async move {
                    use crate::domain::ports::EquityProvider;
                    let equity = core.rest.equity_usd().await?;
                    core.risk.observe_equity(equity);
                    core.equity_log.record(equity)?;
                    Ok(())
                })
            }));
        }
        {
            let core = self.clone();
            scheduler.add_job("bracket_reconcile", Priority::High, Arc::new(move || {
                let core = core.clone();
                Box::pin(async move {
                    core.brackets.reconcile().await;
                    Ok(())
                })
            }));
        }

        // medium: model revalidation + regime refresh.
        {
            let core = self.clone();
            scheduler.add_job("prob_validation", Priority::Medium, Arc::new(move || {
                let core = core.clone();
                Box::pin(async move {
                    core.signals.reload_model();
                    Ok(())
                })
            }));
        }
        {
            let core = self.clone();
            scheduler.add_job("regime_update", Priority::Medium, Arc::new(move || {
                let core = core.clone();
                Box::pin(async move {
                    let refreshed = core.signals.refresh_expired().await;
                    if refreshed > 0 {
                        info!("TradingCore: Refreshed {} expired signal(s)", refreshed);
                    }
                    Ok(())
                })
            }));
        }

        // low: cache retention + symbol registry refresh (2h gating inside).
        {
            let core = self.clone();
            scheduler.add_job("cache_retention", Priority::Low, Arc::new(move || {
                let core = core.clone();
                Box::pin(async move {
                    let purged = core.idempotency.purge_expired();
                    let pruned = core.candles.prune_idle(Duration::from_secs(6 * 3600));
                    if purged + pruned > 0 {
                        info!(
                            "TradingCore: Retention purged {} idempotency entries, {} candle series",
                            purged, pruned
                        );
                    }
                    Ok(())
                })
            }));
        }
        {
            let core = self.clone();
            scheduler.add_job_with(
                "symbol_refresh",
                Priority::Low,
                Duration::from_secs(2 * 3600),
                Duration::from_secs(300),
                Arc::new(move || {
                    let core = core.clone();
                    Box::pin(async move {
                        let infos = core.rest.symbol_details().await?;
                        core.registry.replace_all(infos);
                        Ok(())
                    })
                }),
            );
        }

        tokio::spawn(scheduler.run())
    }

    fn export_health_gauges(&self) {
        for usage in self.limiter.usage() {
            let class = usage.class.to_string();
            self.metrics
                .rate_tokens_available
                .with_label_values(&[&class])
                .set(usage.tokens_available);
            self.metrics
                .rate_utilization_pct
                .with_label_values(&[&class])
                .set(usage.utilization_pct);
        }
        if self.config.exchange.ws_connect_on_start {
            let clocks = self.ws.clocks();
            let hb = Duration::from_secs(self.config.exchange.hb_timeout_secs);
            if clocks.public_silence() > hb * 2 {
                warn!(
                    "TradingCore: Public stream silent for {:?}",
                    clocks.public_silence()
                );
            }
        }
    }

    // ---- Core API -------------------------------------------------------

    pub async fn place_order(&self, intent: OrderIntent) -> PlaceOrderResult {
        self.pipeline.place_order(intent).await
    }

    pub async fn cancel_order(&self, scope: CancelScope) -> Result<(), ApiError> {
        self.pipeline.cancel(scope).await
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<MarketDataResponse<Ticker>, ApiError> {
        self.facade.get_ticker(symbol).await
    }

    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<MarketDataResponse<Vec<Candle>>, ApiError> {
        self.facade.get_candles(symbol, timeframe, limit).await
    }

    pub async fn get_signal(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<SignalScore, ApiError> {
        self.signals.get_signal(symbol, timeframe).await
    }

    pub fn risk_status(&self) -> RiskStatus {
        self.risk.status()
    }

    pub async fn subscribe(
        &self,
        channel: &str,
        symbol: &str,
        timeframe: Option<Timeframe>,
    ) -> Result<(), ApiError> {
        let key = Self::subscription_key(channel, symbol, timeframe)?;
        self.ws.subscribe(key).await
    }

    pub async fn unsubscribe(
        &self,
        channel: &str,
        symbol: &str,
        timeframe: Option<Timeframe>,
    ) -> Result<(), ApiError> {
        let key = Self::subscription_key(channel, symbol, timeframe)?;
        self.ws.unsubscribe(&key).await;
        Ok(())
    }

    fn subscription_key(
        channel: &str,
        symbol: &str,
        timeframe: Option<Timeframe>,
    ) -> Result<SubscriptionKey, ApiError> {
        match channel {
            "ticker" => Ok(SubscriptionKey::Ticker {
                symbol: symbol.to_string(),
            }),
            "trades" => Ok(SubscriptionKey::Trades {
                symbol: symbol.to_string(),
            }),
            "book" => Ok(SubscriptionKey::Book {
                symbol: symbol.to_string(),
                precision: "P0".to_string(),
            }),
            "candles" => {
                let timeframe = timeframe.ok_or_else(|| ApiError::Validation {
                    reason: "candles subscription requires a timeframe".to_string(),
                })?;
                Ok(SubscriptionKey::Candles {
                    symbol: symbol.to_string(),
                    timeframe,
                })
            }
            other => Err(ApiError::Validation {
                reason: format!("unknown channel '{}'", other),
            }),
        }
    }

    // ---- Operational controls ------------------------------------------

    pub fn pause_trading(&self) {
        self.risk.set_paused(true);
    }

    pub fn resume_trading(&self) {
        self.risk.set_paused(false);
    }

    pub fn set_dry_run(&self, enabled: bool) {
        self.pipeline.set_dry_run(enabled);
    }

    /// Reset one breaker, or all of them when no name is given.
    pub fn reset_circuit_breaker(&self, name: Option<&str>) -> bool {
        match name {
            Some(name) => self.breakers.reset(name),
            None => {
                self.breakers.force_recovery();
                true
            }
        }
    }

    pub fn force_recovery(&self) {
        self.breakers.force_recovery();
        self.risk.clear_kill_switch();
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.pipeline.dead_letters()
    }

    pub async fn open_bracket_groups(&self) -> Vec<BracketGroup> {
        self.brackets.open_groups().await
    }

    pub async fn force_snapshot(&self) {
        self.brackets.force_snapshot().await;
    }

    /// Set a runtime config override (highest precedence) and reapply the
    /// reloadable sections.
    pub fn set_config_override(&self, key: &str, value: Option<String>) -> Result<()> {
        self.source.set_override(key, value);
        self.reload_config()
    }

    /// Re-read the configuration sources and apply the reloadable parts:
    /// risk limits, trading windows and the dry-run flag.
    pub fn reload_config(&self) -> Result<()> {
        let risk = RiskConfig::load(&self.source).context("Failed to reload risk config")?;
        self.risk.update_limits(risk)?;
        let source = &self.source;
        self.pipeline
            .set_dry_run(source.parse_bool("dry_run_enabled", self.config.dry_run_enabled));
        info!("TradingCore: Configuration reloaded");
        Ok(())
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn private_state(&self) -> &Arc<PrivateState> {
        &self.private
    }

    /// Signal shutdown, stop background tasks, flush state and close
    /// sockets within the configured grace period.
    pub async fn shutdown(&self) {
        info!("TradingCore: Initiating graceful shutdown");
        if self.config.cancel_orders_on_exit && !self.pipeline.dry_run() {
            info!("TradingCore: Cancelling all open orders (cancel_orders_on_exit)");
            if let Err(e) = self.pipeline.cancel(CancelScope::All).await {
                error!("TradingCore: Cancel-all on exit failed: {}", e);
            }
        }

        let _ = self.shutdown_tx.send(true);
        self.brackets.force_snapshot().await;

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("handle lock poisoned");
            guard.drain(..).collect()
        };
        let joined = futures::future::join_all(handles);
        if tokio::time::timeout(grace, joined).await.is_err() {
            warn!(
                "TradingCore: Background tasks did not stop within {:?}",
                grace
            );
        }
        info!("TradingCore: Shutdown complete");
    }
}
