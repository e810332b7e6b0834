//! Bitfinex v2 REST client.
//!
//! Single enforcement point for invariant I6: every outbound call consults
//! the rate limiter and the circuit-breaker registry before dispatch, and
//! reports its outcome back to the registry. Retries with exponential
//! backoff + jitter stay inside the per-call deadline; a server
//! `Retry-After` overrides the local backoff and freezes the class bucket.

use crate::config::ExchangeConfig;
use crate::domain::errors::ApiError;
use crate::domain::ports::{CancelScope, EquityProvider, MarketApi, OrderApi, WalletApi};
use crate::domain::symbol::{split_pair, SymbolInfo};
use crate::domain::timeframe::Timeframe;
use crate::domain::types::{
    BookLevel, Candle, LedgerEntry, MarginInfo, OrderAck, OrderIntent, OrderRecord, OrderSide,
    OrderStatus, Position, PublicTrade, Ticker, TradeFill, Wallet,
};
use crate::infrastructure::bitfinex::events::{
    parse_book_level, parse_candle, parse_error_body, parse_ledger_entry, parse_margin_base,
    parse_notification, parse_order, parse_position, parse_public_trade, parse_ticker,
    parse_trade_fill,
};
use crate::infrastructure::bitfinex::signing::sign_rest;
use crate::infrastructure::core::circuit_breaker::{
    CircuitBreakerRegistry, TRADING_BREAKER, TRANSPORT_BREAKER,
};
use crate::infrastructure::core::http_client_factory::HttpClientFactory;
use crate::infrastructure::core::rate_limiter::{EndpointClass, RateLimiter};
use crate::infrastructure::nonce::NonceService;
use crate::infrastructure::observability::Metrics;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bitfinex order flags (bitmask on submit).
const FLAG_REDUCE_ONLY: i64 = 1024;
const FLAG_POST_ONLY: i64 = 4096;

/// Auth error codes that indicate bad credentials rather than a bad request.
const AUTH_ERROR_CODES: &[i64] = &[10100, 10111];

enum Call {
    Public { path: String },
    Auth { path: String, body: Value },
}

impl Call {
    fn path(&self) -> &str {
        match self {
            Call::Public { path } => path,
            Call::Auth { path, .. } => path,
        }
    }

    /// Short label for metrics: the first two path segments.
    fn endpoint_label(&self) -> String {
        self.path()
            .split('/')
            .take(2)
            .collect::<Vec<_>>()
            .join("/")
    }
}

pub struct BitfinexRestClient {
    client: reqwest::Client,
    config: ExchangeConfig,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    nonce: Arc<NonceService>,
    metrics: Metrics,
}

impl BitfinexRestClient {
    pub fn new(
        config: ExchangeConfig,
        limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        nonce: Arc<NonceService>,
        metrics: Metrics,
    ) -> Self {
        let client = HttpClientFactory::create_client(
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        );
        Self {
            client,
            config,
            limiter,
            breakers,
            nonce,
            metrics,
        }
    }

    async fn get_public(&self, path: String) -> Result<Value, ApiError> {
        self.request(Call::Public { path }).await
    }

    async fn post_auth(&self, path: String, body: Value) -> Result<Value, ApiError> {
        self.request(Call::Auth { path, body }).await
    }

    /// Retry loop around [`Self::send_once`]; collapses transient failures
    /// into a single terminal outcome.
    async fn request(&self, call: Call) -> Result<Value, ApiError> {
        let endpoint = call.endpoint_label();
        let class = self.limiter.classify(call.path());
        let call_started = Instant::now();
        let deadline = call_started + Duration::from_secs(self.config.call_deadline_secs);
        let mut nonce_bumped = false;
        let mut attempt: u32 = 0;

        loop {
            self.breakers.check(TRANSPORT_BREAKER)?;
            if class == EndpointClass::PrivateTrading {
                self.breakers.check(TRADING_BREAKER)?;
            }

            let permit = self.limiter.acquire(class).await;
            let started = Instant::now();
            let result = self.send_once(&call).await;
            let latency = started.elapsed();
            drop(permit);

            self.metrics
                .api_latency_seconds
                .with_label_values(&[&endpoint])
                .observe(latency.as_secs_f64());

            match result {
                Ok(value) => {
                    self.metrics
                        .api_requests_total
                        .with_label_values(&[&endpoint, "ok"])
                        .inc();
                    self.breakers.record_success(TRANSPORT_BREAKER);
                    if class == EndpointClass::PrivateTrading {
                        self.breakers.record_success(TRADING_BREAKER);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    self.metrics
                        .api_requests_total
                        .with_label_values(&[&endpoint, err.kind()])
                        .inc();
                    debug!(
                        endpoint = endpoint.as_str(),
                        kind = err.kind(),
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        "BitfinexRestClient: attempt failed"
                    );

                    let retry_after = match &err {
                        ApiError::RateLimited { retry_after_secs } => {
                            retry_after_secs.map(Duration::from_secs)
                        }
                        _ => None,
                    };
                    if err.trips_breaker() {
                        self.breakers.record_failure(TRANSPORT_BREAKER, retry_after);
                        if class == EndpointClass::PrivateTrading {
                            self.breakers.record_failure(TRADING_BREAKER, retry_after);
                        }
                    }
                    if let Some(pause) = retry_after {
                        self.limiter.freeze(class, pause);
                    }

                    // One-shot nonce recovery, then retry immediately.
                    if err.is_nonce_too_small() && !nonce_bumped {
                        let floor = self.nonce.current();
                        self.nonce
                            .bump_past(floor)
                            .map_err(|e| ApiError::Auth {
                                reason: format!("nonce bump failed: {:#}", e),
                            })?;
                        nonce_bumped = true;
                        continue;
                    }

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = retry_after.unwrap_or_else(|| self.backoff_delay(attempt));
                    if Instant::now() + delay >= deadline {
                        return Err(ApiError::Timeout {
                            endpoint,
                            elapsed_ms: call_started.elapsed().as_millis() as u64,
                        });
                    }
                    warn!(
                        "BitfinexRestClient: retrying {} after {:?} (attempt {})",
                        endpoint, delay, attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(6));
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(exp + jitter)
    }

    async fn send_once(&self, call: &Call) -> Result<Value, ApiError> {
        let endpoint = call.endpoint_label();
        let builder = match call {
            Call::Public { path } => {
                let url = format!("{}/v2/{}", self.config.rest_public_url, path);
                self.client.get(url)
            }
            Call::Auth { path, body } => {
                let nonce = self.nonce.next().map_err(|e| ApiError::Auth {
                    reason: format!("nonce issuance failed: {:#}", e),
                })?;
                let body_str = body.to_string();
                let signature = sign_rest(&self.config.api_secret, path, nonce, &body_str);
                let url = format!("{}/v2/{}", self.config.rest_auth_url, path);
                self.client
                    .post(url)
                    .header("bfx-apikey", &self.config.api_key)
                    .header("bfx-nonce", nonce.to_string())
                    .header("bfx-signature", signature)
                    .header("content-type", "application/json")
                    .body(body_str)
            }
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout {
                    endpoint: endpoint.clone(),
                    elapsed_ms: self.config.request_timeout_secs * 1000,
                }
            } else {
                ApiError::Transport {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<Value>().await.map_err(|e| ApiError::Transport {
                endpoint,
                reason: format!("invalid JSON body: {}", e),
            });
        }

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ApiError::RateLimited { retry_after_secs });
        }

        if status.is_server_error() {
            return Err(ApiError::Transport {
                endpoint,
                reason: format!("HTTP {}", status),
            });
        }

        // Other 4xx: not retried, never trips the breaker.
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if let Some((code, message)) = parse_error_body(&body) {
            if AUTH_ERROR_CODES.contains(&code) {
                return Err(ApiError::Auth {
                    reason: format!("{} ({})", message, code),
                });
            }
            return Err(ApiError::Exchange { code, message });
        }
        Err(ApiError::Exchange {
            code: status.as_u16() as i64,
            message: format!("HTTP {}", status),
        })
    }

    /// Fetch the pair configuration backing the symbol registry.
    pub async fn symbol_details(&self) -> Result<Vec<SymbolInfo>, ApiError> {
        let value = self.get_public("conf/pub:info:pair".to_string()).await?;
        let list = value
            .as_array()
            .and_then(|outer| outer.first())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut infos = Vec::with_capacity(list.len());
        for item in &list {
            let Some(entry) = item.as_array() else { continue };
            let Some(pair) = entry.first().and_then(Value::as_str) else {
                continue;
            };
            let details = entry.get(1).and_then(Value::as_array);
            let min_order_size = details
                .and_then(|d| d.get(3))
                .and_then(parse_decimal_field)
                .unwrap_or(Decimal::ZERO);
            let max_order_size = details
                .and_then(|d| d.get(4))
                .and_then(parse_decimal_field)
                .unwrap_or(Decimal::ZERO);

            let symbol = format!("t{}", pair);
            let (base, quote) = split_pair(&symbol);
            infos.push(SymbolInfo {
                symbol,
                base,
                quote,
                min_order_size,
                max_order_size,
                amount_step: Decimal::new(1, 8),
                tradable: true,
            });
        }
        info!("BitfinexRestClient: Loaded {} pair configs", infos.len());
        Ok(infos)
    }

    /// Batched tickers; `symbols` empty requests the full set.
    pub async fn tickers(&self, symbols: &[&str]) -> Result<Vec<(String, Ticker)>, ApiError> {
        let query = if symbols.is_empty() {
            "ALL".to_string()
        } else {
            symbols.join(",")
        };
        let value = self
            .get_public(format!("tickers?symbols={}", query))
            .await?;
        let now = Utc::now().timestamp_millis();
        Ok(value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let arr = row.as_array()?;
                        let symbol = arr.first()?.as_str()?.to_string();
                        let fields = Value::Array(arr[1..].to_vec());
                        let ticker = parse_ticker(&fields, now)?;
                        Some((symbol, ticker))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Point-in-time aggregated book snapshot.
    pub async fn order_book(
        &self,
        symbol: &str,
        precision: &str,
        len: usize,
    ) -> Result<Vec<BookLevel>, ApiError> {
        let value = self
            .get_public(format!("book/{}/{}?len={}", symbol, precision, len))
            .await?;
        Ok(value
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_book_level).collect())
            .unwrap_or_default())
    }

    /// Recent public trade prints, newest first on the wire.
    pub async fn public_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<PublicTrade>, ApiError> {
        let value = self
            .get_public(format!("trades/{}/hist?limit={}", symbol, limit))
            .await?;
        Ok(value
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_public_trade).collect())
            .unwrap_or_default())
    }

    /// Current margin positions snapshot.
    pub async fn positions(&self) -> Result<Vec<Position>, ApiError> {
        let value = self
            .post_auth("auth/r/positions".to_string(), json!({}))
            .await?;
        Ok(value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(parse_position)
                    .filter(|(_, closed)| !closed)
                    .map(|(p, _)| p)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn orders_history(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, ApiError> {
        let path = match symbol {
            Some(symbol) => format!("auth/r/orders/{}/hist", symbol),
            None => "auth/r/orders/hist".to_string(),
        };
        let value = self.post_auth(path, json!({ "limit": limit })).await?;
        Ok(value
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_order).collect())
            .unwrap_or_default())
    }

    pub async fn trades_history(&self, limit: usize) -> Result<Vec<TradeFill>, ApiError> {
        let value = self
            .post_auth("auth/r/trades/hist".to_string(), json!({ "limit": limit }))
            .await?;
        Ok(value
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_trade_fill).collect())
            .unwrap_or_default())
    }

    pub async fn ledgers(
        &self,
        currency: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, ApiError> {
        let value = self
            .post_auth(
                format!("auth/r/ledgers/{}/hist", currency),
                json!({ "limit": limit }),
            )
            .await?;
        Ok(value
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_ledger_entry).collect())
            .unwrap_or_default())
    }

    pub async fn margin_base(&self) -> Result<MarginInfo, ApiError> {
        let value = self
            .post_auth("auth/r/info/margin/base".to_string(), json!({}))
            .await?;
        parse_margin_base(&value).ok_or_else(|| ApiError::Exchange {
            code: 0,
            message: "malformed margin info payload".to_string(),
        })
    }

    fn order_ack_from_notification(value: &Value) -> Result<OrderRecord, ApiError> {
        let (status, text, data) =
            parse_notification(value).ok_or_else(|| ApiError::Exchange {
                code: 0,
                message: "malformed order notification".to_string(),
            })?;
        if status != "SUCCESS" {
            if let Some((code, message)) = parse_error_body(value) {
                return Err(ApiError::Exchange { code, message });
            }
            return Err(ApiError::Exchange {
                code: 0,
                message: text,
            });
        }
        data.as_array()
            .and_then(|orders| orders.first())
            .and_then(parse_order)
            .ok_or_else(|| ApiError::Exchange {
                code: 0,
                message: "order notification without order payload".to_string(),
            })
    }
}

/// Numeric fields in conf payloads arrive either as strings or numbers.
fn parse_decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(_) => value.as_f64().and_then(Decimal::from_f64_retain),
        _ => None,
    }
}

/// Bitfinex `cid` is a 45-bit integer; the UUID idempotency key is folded
/// into it deterministically and carried verbatim in the order meta.
pub fn derive_cid(client_order_id: &str) -> i64 {
    let digest = Sha256::digest(client_order_id.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (i64::from_be_bytes(raw) & 0x0000_0FFF_FFFF_FFFF).max(1)
}

#[async_trait]
impl MarketApi for BitfinexRestClient {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ApiError> {
        let value = self.get_public(format!("ticker/{}", symbol)).await?;
        parse_ticker(&value, Utc::now().timestamp_millis()).ok_or_else(|| ApiError::Exchange {
            code: 0,
            message: format!("malformed ticker payload for {}", symbol),
        })
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ApiError> {
        let path = format!(
            "candles/{}/hist?limit={}",
            timeframe.candle_key(symbol),
            limit
        );
        let value = self.get_public(path).await?;
        let mut candles: Vec<Candle> = value
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_candle).collect())
            .unwrap_or_default();
        // hist returns newest first; callers expect ascending open time.
        candles.sort_by_key(|c| c.mts);
        Ok(candles)
    }
}

#[async_trait]
impl OrderApi for BitfinexRestClient {
    async fn submit_order(
        &self,
        intent: &OrderIntent,
        client_order_id: &str,
        group_id: Option<i64>,
    ) -> Result<OrderAck, ApiError> {
        let signed_amount = match intent.side {
            OrderSide::Buy => intent.amount,
            OrderSide::Sell => -intent.amount,
        };

        let mut flags = 0i64;
        if intent.flags.reduce_only {
            flags |= FLAG_REDUCE_ONLY;
        }
        // Post-only is meaningless on market orders; drop it silently there.
        if intent.flags.post_only && intent.order_type.requires_price() {
            flags |= FLAG_POST_ONLY;
        }

        let mut body = json!({
            "type": intent.order_type.as_bitfinex_str(),
            "symbol": intent.symbol,
            "amount": signed_amount.to_string(),
            "cid": derive_cid(client_order_id),
            "meta": { "lbl": client_order_id },
        });
        if let Some(price) = intent.price {
            body["price"] = Value::String(price.to_string());
        }
        if let Some(gid) = group_id {
            body["gid"] = json!(gid);
        }
        if flags != 0 {
            body["flags"] = json!(flags);
        }

        let value = self.post_auth("auth/w/order/submit".to_string(), body).await?;
        let order = Self::order_ack_from_notification(&value)?;
        info!(
            "BitfinexRestClient: Order accepted id={} cid={} symbol={}",
            order.exchange_id, client_order_id, order.symbol
        );
        Ok(OrderAck {
            exchange_id: order.exchange_id,
            client_order_id: client_order_id.to_string(),
            symbol: order.symbol,
            status: order.status,
            group_id: order.group_id,
        })
    }

    async fn update_order(&self, exchange_id: i64, new_amount: Decimal) -> Result<(), ApiError> {
        let body = json!({ "id": exchange_id, "amount": new_amount.to_string() });
        self.post_auth("auth/w/order/update".to_string(), body)
            .await?;
        Ok(())
    }

    async fn cancel(&self, scope: CancelScope) -> Result<(), ApiError> {
        match scope {
            CancelScope::ById(id) => {
                self.post_auth("auth/w/order/cancel".to_string(), json!({ "id": id }))
                    .await?;
            }
            CancelScope::BySymbol(symbol) => {
                let ids: Vec<i64> = self
                    .active_orders()
                    .await?
                    .into_iter()
                    .filter(|o| o.symbol == symbol)
                    .map(|o| o.exchange_id)
                    .collect();
                if ids.is_empty() {
                    return Ok(());
                }
                self.post_auth(
                    "auth/w/order/cancel/multi".to_string(),
                    json!({ "id": ids }),
                )
                .await?;
            }
            CancelScope::All => {
                self.post_auth(
                    "auth/w/order/cancel/multi".to_string(),
                    json!({ "all": 1 }),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn active_orders(&self) -> Result<Vec<OrderRecord>, ApiError> {
        let value = self
            .post_auth("auth/r/orders".to_string(), json!({}))
            .await?;
        Ok(value
            .as_array()
            .map(|rows| rows.iter().filter_map(parse_order).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl WalletApi for BitfinexRestClient {
    async fn wallets(&self) -> Result<Vec<Wallet>, ApiError> {
        let value = self
            .post_auth("auth/r/wallets".to_string(), json!({}))
            .await?;
        Ok(value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(crate::infrastructure::bitfinex::events::parse_wallet)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl EquityProvider for BitfinexRestClient {
    /// USD-denominated equity: the sum of USD/UST wallet balances. Non-USD
    /// holdings are not marked to market here.
    async fn equity_usd(&self) -> Result<f64, ApiError> {
        let wallets = self.wallets().await?;
        let mut total = Decimal::ZERO;
        for wallet in &wallets {
            if wallet.currency == "USD" || wallet.currency == "UST" {
                total += wallet.balance;
            }
        }
        Ok(total.to_f64().unwrap_or(0.0))
    }
}

/// Paper trading backend: accepts everything locally without touching the
/// exchange. Swapped in for the live client when dry-run is enabled.
pub struct PaperOrderApi {
    next_id: std::sync::atomic::AtomicI64,
}

impl PaperOrderApi {
    pub fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicI64::new(900_000_000),
        }
    }
}

impl Default for PaperOrderApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderApi for PaperOrderApi {
    async fn submit_order(
        &self,
        intent: &OrderIntent,
        client_order_id: &str,
        group_id: Option<i64>,
    ) -> Result<OrderAck, ApiError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        info!(
            "PaperOrderApi: Simulated submit {} {} {} (id={})",
            intent.side, intent.amount, intent.symbol, id
        );
        Ok(OrderAck {
            exchange_id: id,
            client_order_id: client_order_id.to_string(),
            symbol: intent.symbol.clone(),
            status: OrderStatus::Active,
            group_id,
        })
    }

    async fn update_order(&self, _exchange_id: i64, _new_amount: Decimal) -> Result<(), ApiError> {
        Ok(())
    }

    async fn cancel(&self, _scope: CancelScope) -> Result<(), ApiError> {
        Ok(())
    }

    async fn active_orders(&self) -> Result<Vec<OrderRecord>, ApiError> {
        Ok(Vec::new())
    }
}
