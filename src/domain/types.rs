use crate::domain::timeframe::Timeframe;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Bitfinex order types for the exchange wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    ExchangeMarket,
    ExchangeLimit,
    ExchangeStop,
}

impl OrderType {
    /// Wire string expected by `order/submit`.
    pub fn as_bitfinex_str(&self) -> &'static str {
        match self {
            OrderType::ExchangeMarket => "EXCHANGE MARKET",
            OrderType::ExchangeLimit => "EXCHANGE LIMIT",
            OrderType::ExchangeStop => "EXCHANGE STOP",
        }
    }

    pub fn requires_price(&self) -> bool {
        matches!(self, OrderType::ExchangeLimit | OrderType::ExchangeStop)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_bitfinex_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Active,
    PartiallyFilled,
    Executed,
    Cancelled,
    Rejected,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Optional flags carried on an order intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFlags {
    pub reduce_only: bool,
    pub post_only: bool,
}

/// Bracket specification attached to an entry intent: a stop-loss and a
/// take-profit linked under one group id, cancelled OCO-style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketSpec {
    pub entry_type: OrderType,
    pub entry_price: Option<Decimal>,
    pub sl_price: Decimal,
    pub tp_price: Decimal,
    pub post_only: bool,
    pub reduce_only_exits: bool,
}

/// Caller-supplied order request; transient, discarded after submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Idempotency key. Auto-generated UUID when absent.
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub flags: OrderFlags,
    pub bracket: Option<BracketSpec>,
}

impl OrderIntent {
    pub fn market(symbol: &str, side: OrderSide, amount: Decimal) -> Self {
        Self {
            client_order_id: None,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::ExchangeMarket,
            amount,
            price: None,
            flags: OrderFlags::default(),
            bracket: None,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, amount: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: None,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::ExchangeLimit,
            amount,
            price: Some(price),
            flags: OrderFlags::default(),
            bracket: None,
        }
    }
}

/// Exchange acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub group_id: Option<i64>,
}

/// Order lifecycle record as tracked from auth WS events and history calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub exchange_id: i64,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub order_type: String,
    pub status: OrderStatus,
    pub amount_orig: Decimal,
    pub amount_remaining: Decimal,
    pub price: Decimal,
    pub avg_fill_price: Decimal,
    pub group_id: Option<i64>,
    pub updated_at_ms: i64,
}

impl OrderRecord {
    pub fn filled_amount(&self) -> Decimal {
        self.amount_orig.abs() - self.amount_remaining.abs()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Executed | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Latest best bid/ask snapshot for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last_price: Decimal,
    pub volume: Decimal,
    /// Exchange/event timestamp in epoch milliseconds.
    pub ts_ms: i64,
}

impl Ticker {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds.
    pub mts: i64,
    pub open: Decimal,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
}

/// Margin/derivative position as streamed on the auth socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed amount; positive long, negative short.
    pub amount: Decimal,
    pub base_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_type: WalletType,
    pub currency: String,
    pub balance: Decimal,
    pub available: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletType {
    Exchange,
    Margin,
    Funding,
}

impl WalletType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exchange" => Some(WalletType::Exchange),
            "margin" => Some(WalletType::Margin),
            "funding" => Some(WalletType::Funding),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSide {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalSide::Buy => write!(f, "buy"),
            SignalSide::Sell => write!(f, "sell"),
            SignalSide::Hold => write!(f, "hold"),
        }
    }
}

/// Indicator snapshot attached to a signal for audit and model features.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalFeatures {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub atr: f64,
    pub adx: f64,
    pub last_close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalScore {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub side: SignalSide,
    /// Normalized indicator distance from thresholds, in [0, 1].
    pub confidence: f64,
    /// Calibrated model output when a model is loaded, else a heuristic
    /// mapping of confidence. In [0, 1].
    pub probability: f64,
    pub features: SignalFeatures,
    pub generated_at_ms: i64,
}

/// One aggregated order-book level (point-in-time REST snapshot).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub count: i64,
    /// Signed: positive bids, negative asks.
    pub amount: Decimal,
}

/// Public trade print from the trades history endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PublicTrade {
    pub id: i64,
    pub mts: i64,
    /// Signed: positive buys, negative sells.
    pub amount: Decimal,
    pub price: Decimal,
}

/// Own execution from the private trades history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFill {
    pub id: i64,
    pub symbol: String,
    pub order_id: i64,
    pub exec_amount: Decimal,
    pub exec_price: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub mts: i64,
}

/// One ledger movement (fees, transfers, settlements).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub currency: String,
    pub mts: i64,
    pub amount: Decimal,
    pub balance: Decimal,
    pub description: String,
}

/// Base margin figures from the margin info endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginInfo {
    pub user_pl: Decimal,
    pub user_swaps: Decimal,
    pub margin_balance: Decimal,
    pub margin_net: Decimal,
}

/// Where a market-data response was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    Ws,
    Rest,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Ws => write!(f, "ws"),
            DataSource::Rest => write!(f, "rest"),
        }
    }
}

/// Envelope tagging each facade response with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataResponse<T> {
    pub payload: T,
    pub source: DataSource,
    pub age_ms: u64,
    pub reason: Option<String>,
}

/// Point-in-time risk engine status, derived on each evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskStatus {
    pub equity_usd: f64,
    pub daily_start_equity: f64,
    pub peak_equity: f64,
    pub daily_loss_pct: f64,
    pub drawdown_pct: f64,
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    pub trading_paused: bool,
    pub window_open: bool,
    pub dms_enabled: bool,
    pub trades_today: u32,
    pub trades_today_by_symbol: Vec<(String, u32)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_type_wire_strings() {
        assert_eq!(OrderType::ExchangeMarket.as_bitfinex_str(), "EXCHANGE MARKET");
        assert_eq!(OrderType::ExchangeLimit.as_bitfinex_str(), "EXCHANGE LIMIT");
        assert!(OrderType::ExchangeLimit.requires_price());
        assert!(!OrderType::ExchangeMarket.requires_price());
    }

    #[test]
    fn test_ticker_mid() {
        let t = Ticker {
            bid: dec!(100),
            ask: dec!(102),
            last_price: dec!(101),
            volume: dec!(5),
            ts_ms: 0,
        };
        assert_eq!(t.mid(), dec!(101));
    }

    #[test]
    fn test_order_record_filled_amount() {
        let rec = OrderRecord {
            exchange_id: 1,
            client_order_id: Some("co-1".into()),
            symbol: "tBTCUSD".into(),
            order_type: "EXCHANGE LIMIT".into(),
            status: OrderStatus::PartiallyFilled,
            amount_orig: dec!(-2.0),
            amount_remaining: dec!(-0.5),
            price: dec!(30000),
            avg_fill_price: dec!(30010),
            group_id: None,
            updated_at_ms: 0,
        };
        assert_eq!(rec.filled_amount(), dec!(1.5));
        assert!(!rec.is_terminal());
    }
}
