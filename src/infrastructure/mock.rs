//! Mock implementations of the exchange ports for tests.

use crate::domain::errors::ApiError;
use crate::domain::ports::{CancelScope, EquityProvider, MarketApi, OrderApi, WalletApi};
use crate::domain::timeframe::Timeframe;
use crate::domain::types::{
    Candle, OrderAck, OrderIntent, OrderRecord, OrderStatus, Ticker, Wallet,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted order API: counts submissions, optionally failing with queued
/// errors before succeeding.
pub struct MockOrderApi {
    submissions: Mutex<Vec<(OrderIntent, String, Option<i64>)>>,
    cancels: Mutex<Vec<CancelScope>>,
    scripted: Mutex<VecDeque<Option<ApiError>>>,
    active: Mutex<Vec<OrderRecord>>,
    next_id: AtomicI64,
}

impl MockOrderApi {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            active: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        }
    }

    /// Queue an error for the next submit attempt; attempts after the
    /// queue drains succeed.
    pub fn push_error(&self, error: ApiError) {
        self.scripted
            .lock()
            .expect("mock lock poisoned")
            .push_back(Some(error));
    }

    /// Queue an explicit success, letting a later `push_error` target a
    /// specific call in a sequence.
    pub fn push_ok(&self) {
        self.scripted
            .lock()
            .expect("mock lock poisoned")
            .push_back(None);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().expect("mock lock poisoned").len()
    }

    pub fn submissions(&self) -> Vec<(OrderIntent, String, Option<i64>)> {
        self.submissions
            .lock()
            .expect("mock lock poisoned")
            .clone()
    }

    pub fn cancels(&self) -> Vec<CancelScope> {
        self.cancels.lock().expect("mock lock poisoned").clone()
    }

    pub fn set_active_orders(&self, orders: Vec<OrderRecord>) {
        *self.active.lock().expect("mock lock poisoned") = orders;
    }
}

impl Default for MockOrderApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderApi for MockOrderApi {
    async fn submit_order(
        &self,
        intent: &OrderIntent,
        client_order_id: &str,
        group_id: Option<i64>,
    ) -> Result<OrderAck, ApiError> {
        if let Some(Some(error)) = self
            .scripted
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
        {
            return Err(error);
        }
        self.submissions.lock().expect("mock lock poisoned").push((
            intent.clone(),
            client_order_id.to_string(),
            group_id,
        ));
        Ok(OrderAck {
            exchange_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            client_order_id: client_order_id.to_string(),
            symbol: intent.symbol.clone(),
            status: OrderStatus::Active,
            group_id,
        })
    }

    async fn update_order(&self, _exchange_id: i64, _new_amount: Decimal) -> Result<(), ApiError> {
        Ok(())
    }

    async fn cancel(&self, scope: CancelScope) -> Result<(), ApiError> {
        self.cancels.lock().expect("mock lock poisoned").push(scope);
        Ok(())
    }

    async fn active_orders(&self) -> Result<Vec<OrderRecord>, ApiError> {
        Ok(self.active.lock().expect("mock lock poisoned").clone())
    }
}

/// Market API serving a fixed ticker/candle shape, counting calls.
pub struct MockMarketApi {
    pub ticker_calls: AtomicUsize,
    pub candle_calls: AtomicUsize,
    last_price: Mutex<Decimal>,
}

impl MockMarketApi {
    pub fn new() -> Self {
        Self {
            ticker_calls: AtomicUsize::new(0),
            candle_calls: AtomicUsize::new(0),
            last_price: Mutex::new(dec!(30000)),
        }
    }

    pub fn set_price(&self, price: Decimal) {
        *self.last_price.lock().expect("mock lock poisoned") = price;
    }
}

impl Default for MockMarketApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketApi for MockMarketApi {
    async fn ticker(&self, _symbol: &str) -> Result<Ticker, ApiError> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        let price = *self.last_price.lock().expect("mock lock poisoned");
        Ok(Ticker {
            bid: price - dec!(1),
            ask: price + dec!(1),
            last_price: price,
            volume: dec!(100),
            ts_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn candles(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ApiError> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        let price = *self.last_price.lock().expect("mock lock poisoned");
        let step_ms = timeframe.to_seconds() * 1000;
        Ok((0..limit as i64)
            .map(|i| Candle {
                mts: i * step_ms,
                open: price,
                close: price + Decimal::from(i % 7) - dec!(3),
                high: price + dec!(5),
                low: price - dec!(5),
                volume: dec!(10),
            })
            .collect())
    }
}

/// Equity source with a settable value and optional artificial latency.
pub struct MockEquityProvider {
    equity: Mutex<f64>,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl MockEquityProvider {
    pub fn new(equity: f64) -> Self {
        Self {
            equity: Mutex::new(equity),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_equity(&self, equity: f64) {
        *self.equity.lock().expect("mock lock poisoned") = equity;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("mock lock poisoned") = delay;
    }
}

#[async_trait]
impl EquityProvider for MockEquityProvider {
    async fn equity_usd(&self) -> Result<f64, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().expect("mock lock poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(*self.equity.lock().expect("mock lock poisoned"))
    }
}

pub struct MockWalletApi {
    wallets: Mutex<Vec<Wallet>>,
}

impl MockWalletApi {
    pub fn new(wallets: Vec<Wallet>) -> Self {
        Self {
            wallets: Mutex::new(wallets),
        }
    }
}

#[async_trait]
impl WalletApi for MockWalletApi {
    async fn wallets(&self) -> Result<Vec<Wallet>, ApiError> {
        Ok(self.wallets.lock().expect("mock lock poisoned").clone())
    }
}
