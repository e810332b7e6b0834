use crate::domain::errors::ApiError;
use crate::domain::timeframe::Timeframe;
use crate::domain::types::{Candle, OrderAck, OrderIntent, OrderRecord, Ticker, Wallet};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Cancellation scope for [`OrderApi::cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelScope {
    ById(i64),
    BySymbol(String),
    All,
}

/// Private trading surface of the exchange. Implemented by the signed REST
/// client; mocked in tests.
#[async_trait]
pub trait OrderApi: Send + Sync {
    /// Submit one order. `group_id` links bracket legs server-side.
    async fn submit_order(
        &self,
        intent: &OrderIntent,
        client_order_id: &str,
        group_id: Option<i64>,
    ) -> Result<OrderAck, ApiError>;

    /// Resize an active order in place.
    async fn update_order(&self, exchange_id: i64, new_amount: Decimal) -> Result<(), ApiError>;

    async fn cancel(&self, scope: CancelScope) -> Result<(), ApiError>;

    async fn active_orders(&self) -> Result<Vec<OrderRecord>, ApiError>;
}

/// Public market-data surface used by the facade's REST fallback path.
#[async_trait]
pub trait MarketApi: Send + Sync {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ApiError>;

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ApiError>;
}

/// Account equity source consumed by the risk engine under a hard deadline.
#[async_trait]
pub trait EquityProvider: Send + Sync {
    /// Total account equity in USD terms.
    async fn equity_usd(&self) -> Result<f64, ApiError>;
}

/// Wallet snapshot source, used by the equity snapshot job.
#[async_trait]
pub trait WalletApi: Send + Sync {
    async fn wallets(&self) -> Result<Vec<Wallet>, ApiError>;
}
