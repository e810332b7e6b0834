//! Shared fixtures for the integration suites.

use bfxtrader::application::market_data::{CandleCache, MarketDataFacade, TickerCache};
use bfxtrader::application::orders::{BracketManager, OrderPipeline, PlaceOrderResult, TtlCache};
use bfxtrader::application::risk::RiskPolicyEngine;
use bfxtrader::config::{ConfigSource, RiskConfig};
use bfxtrader::domain::symbol::{SymbolInfo, SymbolRegistry};
use bfxtrader::infrastructure::bitfinex::PaperOrderApi;
use bfxtrader::infrastructure::mock::{MockEquityProvider, MockMarketApi, MockOrderApi};
use bfxtrader::infrastructure::observability::Metrics;
use bfxtrader::infrastructure::persistence::audit_log::AuditLog;
use bfxtrader::infrastructure::persistence::snapshot::SnapshotStore;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct TestRig {
    pub pipeline: Arc<OrderPipeline>,
    pub brackets: Arc<BracketManager>,
    pub order_api: Arc<MockOrderApi>,
    pub market_api: Arc<MockMarketApi>,
    pub equity: Arc<MockEquityProvider>,
    pub risk: Arc<RiskPolicyEngine>,
    pub idempotency: Arc<TtlCache<PlaceOrderResult>>,
    pub state_dir: PathBuf,
}

pub fn state_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "bfxtrader-it-{}-{}-{}",
        tag,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
    ));
    std::fs::create_dir_all(&dir).expect("test state dir");
    dir
}

pub fn btc_registry() -> Arc<SymbolRegistry> {
    let registry = SymbolRegistry::new();
    registry.replace_all(vec![
        SymbolInfo {
            symbol: "tBTCUSD".into(),
            base: "BTC".into(),
            quote: "USD".into(),
            min_order_size: dec!(0.0001),
            max_order_size: dec!(2000),
            amount_step: dec!(0.0001),
            tradable: true,
        },
        SymbolInfo {
            symbol: "tETHUSD".into(),
            base: "ETH".into(),
            quote: "USD".into(),
            min_order_size: dec!(0.001),
            max_order_size: dec!(5000),
            amount_step: dec!(0.001),
            tradable: true,
        },
        SymbolInfo {
            symbol: "tDELISTED".into(),
            base: "DEL".into(),
            quote: "USD".into(),
            min_order_size: dec!(1),
            max_order_size: dec!(0),
            amount_step: dec!(1),
            tradable: false,
        },
    ]);
    Arc::new(registry)
}

/// Build a full pipeline over mocks. `configure` tweaks risk settings.
pub fn build_rig(tag: &str, configure: impl FnOnce(&ConfigSource)) -> TestRig {
    let dir = state_dir(tag);
    let source = ConfigSource::new();
    // Integration defaults: generous caps so individual suites pick their
    // own binding constraint.
    source.set_override("trade_cooldown_seconds", Some("0".into()));
    source.set_override("max_trades_per_day", Some("1000".into()));
    source.set_override("max_trades_per_symbol_per_day", Some("1000".into()));
    configure(&source);

    let metrics = Metrics::new().expect("metrics");
    let registry = btc_registry();
    let order_api = Arc::new(MockOrderApi::new());
    let market_api = Arc::new(MockMarketApi::new());
    let equity = Arc::new(MockEquityProvider::new(100_000.0));

    let facade = Arc::new(MarketDataFacade::new(
        Arc::new(TickerCache::new()),
        Arc::new(CandleCache::new(500)),
        market_api.clone(),
        metrics.clone(),
        10,
        120,
    ));

    let risk_config = RiskConfig::load(&source).expect("risk config");
    let risk = Arc::new(
        RiskPolicyEngine::new(risk_config, equity.clone(), None, metrics.clone())
            .expect("risk engine"),
    );

    let audit = Arc::new(AuditLog::new(dir.join("audit.jsonl")));
    let brackets = Arc::new(BracketManager::new(
        SnapshotStore::new(dir.join("brackets.json")),
        order_api.clone(),
        registry.clone(),
        audit.clone(),
    ));

    let idempotency = Arc::new(TtlCache::new(Duration::from_secs(3600)));
    let pipeline = Arc::new(OrderPipeline::new(
        registry,
        idempotency.clone(),
        risk.clone(),
        order_api.clone(),
        Arc::new(PaperOrderApi::new()),
        facade,
        brackets.clone(),
        audit,
        metrics,
        false,
    ));

    TestRig {
        pipeline,
        brackets,
        order_api,
        market_api,
        equity,
        risk,
        idempotency,
        state_dir: dir,
    }
}
