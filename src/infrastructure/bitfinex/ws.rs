//! Bitfinex v2 WebSocket clients: one public market-data socket and one
//! authenticated account socket.
//!
//! Each socket runs as its own task with exponential reconnect + jitter,
//! replays the desired subscription set on every connect, and force-reconnects
//! when no message arrives within the heartbeat timeout. Received events
//! mutate the shared caches and fan out on a bounded broadcast bus
//! (drop-oldest for lagging consumers).

use crate::application::market_data::{CandleCache, CandleUpsert, PrivateState, TickerCache};
use crate::config::ExchangeConfig;
use crate::domain::errors::ApiError;
use crate::domain::timeframe::Timeframe;
use crate::domain::types::{Candle, OrderRecord, Position, Ticker, Wallet};
use crate::infrastructure::bitfinex::events::{
    parse_candle, parse_frame, parse_order, parse_position, parse_ticker, parse_trade_exec,
    parse_wallet, ControlEvent, WireFrame,
};
use crate::infrastructure::bitfinex::signing::sign_ws_auth;
use crate::infrastructure::nonce::NonceService;
use crate::infrastructure::observability::Metrics;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// DMS scope value understood by the exchange ("cancel all on disconnect").
const DMS_CANCEL_ALL: i64 = 4;

/// Info codes that require the client to reconnect.
const INFO_RECONNECT: i64 = 20051;
const INFO_MAINTENANCE_START: i64 = 20060;

#[derive(Debug, Clone)]
pub struct WsSettings {
    pub public_url: String,
    pub auth_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub hb_timeout: Duration,
    pub max_subs_per_socket: usize,
    pub queue_capacity: usize,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub dms_enabled: bool,
}

impl WsSettings {
    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self {
            public_url: config.ws_public_url.clone(),
            auth_url: config.ws_auth_url.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            hb_timeout: Duration::from_secs(config.hb_timeout_secs),
            max_subs_per_socket: config.max_subs_per_socket,
            queue_capacity: config.ws_queue_capacity,
            reconnect_base: Duration::from_secs(config.reconnect_base_secs.max(1)),
            reconnect_cap: Duration::from_secs(config.reconnect_cap_secs.max(1)),
            dms_enabled: config.dms_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Ticker { symbol: String },
    Candles { symbol: String, timeframe: Timeframe },
    Trades { symbol: String },
    Book { symbol: String, precision: String },
}

impl SubscriptionKey {
    pub fn subscribe_frame(&self) -> Value {
        match self {
            SubscriptionKey::Ticker { symbol } => json!({
                "event": "subscribe", "channel": "ticker", "symbol": symbol,
            }),
            SubscriptionKey::Candles { symbol, timeframe } => json!({
                "event": "subscribe", "channel": "candles",
                "key": timeframe.candle_key(symbol),
            }),
            SubscriptionKey::Trades { symbol } => json!({
                "event": "subscribe", "channel": "trades", "symbol": symbol,
            }),
            SubscriptionKey::Book { symbol, precision } => json!({
                "event": "subscribe", "channel": "book", "symbol": symbol,
                "prec": precision,
            }),
        }
    }

    fn from_subscribed(channel: &str, symbol: Option<&str>, key: Option<&str>) -> Option<Self> {
        match channel {
            "ticker" => Some(SubscriptionKey::Ticker {
                symbol: symbol?.to_string(),
            }),
            "trades" => Some(SubscriptionKey::Trades {
                symbol: symbol?.to_string(),
            }),
            "book" => Some(SubscriptionKey::Book {
                symbol: symbol?.to_string(),
                precision: "P0".to_string(),
            }),
            "candles" => {
                // key = trade:{tf}:{symbol}
                let mut parts = key?.splitn(3, ':');
                let _prefix = parts.next()?;
                let timeframe: Timeframe = parts.next()?.parse().ok()?;
                let symbol = parts.next()?.to_string();
                Some(SubscriptionKey::Candles { symbol, timeframe })
            }
            _ => None,
        }
    }
}

/// Events fanned out to in-process consumers (signal engine, bracket
/// manager, core status). Arrival time is stamped by the socket task.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TickerUpdate {
        symbol: String,
        ticker: Ticker,
    },
    CandleClosed {
        symbol: String,
        timeframe: Timeframe,
        candle: Candle,
    },
    PublicTrade {
        symbol: String,
        amount: Decimal,
        price: Decimal,
    },
    OrderUpdate(OrderRecord),
    TradeExecuted {
        symbol: String,
        exchange_order_id: i64,
        amount: Decimal,
        price: Decimal,
    },
    PositionUpdate(Position),
    WalletUpdate(Wallet),
    AuthConnected,
    AuthDisconnected,
}

enum SocketCommand {
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
}

/// Last-message clocks for the health check job.
#[derive(Clone)]
pub struct StreamClocks {
    public: Arc<StdMutex<Instant>>,
    auth: Arc<StdMutex<Instant>>,
}

impl StreamClocks {
    fn new() -> Self {
        Self {
            public: Arc::new(StdMutex::new(Instant::now())),
            auth: Arc::new(StdMutex::new(Instant::now())),
        }
    }

    fn touch_public(&self) {
        *self.public.lock().expect("clock lock poisoned") = Instant::now();
    }

    fn touch_auth(&self) {
        *self.auth.lock().expect("clock lock poisoned") = Instant::now();
    }

    pub fn public_silence(&self) -> Duration {
        self.public.lock().expect("clock lock poisoned").elapsed()
    }

    pub fn auth_silence(&self) -> Duration {
        self.auth.lock().expect("clock lock poisoned").elapsed()
    }
}

pub struct WsManager {
    settings: WsSettings,
    desired: Arc<RwLock<HashSet<SubscriptionKey>>>,
    tickers: Arc<TickerCache>,
    candles: Arc<CandleCache>,
    private: Arc<PrivateState>,
    nonce: Arc<NonceService>,
    metrics: Metrics,
    event_tx: broadcast::Sender<StreamEvent>,
    cmd_tx: mpsc::Sender<SocketCommand>,
    cmd_rx: StdMutex<Option<mpsc::Receiver<SocketCommand>>>,
    shutdown: watch::Receiver<bool>,
    clocks: StreamClocks,
}

impl WsManager {
    pub fn new(
        settings: WsSettings,
        tickers: Arc<TickerCache>,
        candles: Arc<CandleCache>,
        private: Arc<PrivateState>,
        nonce: Arc<NonceService>,
        metrics: Metrics,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(settings.queue_capacity.max(16));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        Self {
            settings,
            desired: Arc::new(RwLock::new(HashSet::new())),
            tickers,
            candles,
            private,
            nonce,
            metrics,
            event_tx,
            cmd_tx,
            cmd_rx: StdMutex::new(Some(cmd_rx)),
            shutdown,
            clocks: StreamClocks::new(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_tx.subscribe()
    }

    pub fn clocks(&self) -> StreamClocks {
        self.clocks.clone()
    }

    /// Add a desired subscription. The bounded per-socket budget is enforced
    /// here; beyond it the call is rejected with a clear error.
    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<(), ApiError> {
        {
            let mut desired = self.desired.write().await;
            if desired.contains(&key) {
                return Ok(());
            }
            if desired.len() >= self.settings.max_subs_per_socket {
                return Err(ApiError::Validation {
                    reason: format!(
                        "subscription limit reached ({} per socket)",
                        self.settings.max_subs_per_socket
                    ),
                });
            }
            desired.insert(key.clone());
        }
        let _ = self.cmd_tx.send(SocketCommand::Subscribe(key)).await;
        Ok(())
    }

    pub async fn unsubscribe(&self, key: &SubscriptionKey) {
        self.desired.write().await.remove(key);
        let _ = self
            .cmd_tx
            .send(SocketCommand::Unsubscribe(key.clone()))
            .await;
    }

    pub async fn desired_count(&self) -> usize {
        self.desired.read().await.len()
    }

    /// Spawn the socket tasks. The auth task is only started when
    /// credentials are configured.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let cmd_rx = self
            .cmd_rx
            .lock()
            .expect("cmd_rx lock poisoned")
            .take()
            .expect("WsManager::spawn called twice");
        let manager = self.clone();
        handles.push(tokio::spawn(async move {
            manager.run_public_loop(cmd_rx).await;
        }));

        if !self.settings.api_key.is_empty() && !self.settings.api_secret.is_empty() {
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                manager.run_auth_loop().await;
            }));
        } else {
            info!("WsManager: No credentials, auth socket not started");
        }

        handles
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        let jitter_ms = rand::rng().random_range(0..=backoff.as_millis().max(1) as u64 / 4);
        backoff + Duration::from_millis(jitter_ms)
    }

    async fn run_public_loop(&self, mut cmd_rx: mpsc::Receiver<SocketCommand>) {
        let mut backoff = self.settings.reconnect_base;
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.metrics
                .ws_reconnects_total
                .with_label_values(&["public"])
                .inc();
            match self.run_public_socket(&mut cmd_rx, &mut shutdown).await {
                Ok(true) => break,
                Ok(false) => {
                    info!("WsManager: Public socket closed by server, reconnecting");
                    backoff = self.settings.reconnect_base;
                }
                Err(e) => {
                    error!(
                        "WsManager: Public socket error: {:#}. Reconnecting in {:?}",
                        e, backoff
                    );
                }
            }
            tokio::time::sleep(self.jittered(backoff)).await;
            backoff = (backoff * 2).min(self.settings.reconnect_cap);
        }
        info!("WsManager: Public loop stopped");
    }

    /// Returns `Ok(true)` on shutdown, `Ok(false)` on clean server close.
    async fn run_public_socket(
        &self,
        cmd_rx: &mut mpsc::Receiver<SocketCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let (ws, _) = connect_async(&self.settings.public_url)
            .await
            .context("Failed to connect public WebSocket")?;
        info!("WsManager: Public socket connected");
        let (mut write, mut read) = ws.split();

        // Commands queued while disconnected are already reflected in the
        // desired set; drop them so the replay below does not duplicate.
        while cmd_rx.try_recv().is_ok() {}

        // Replay every desired subscription on each (re)connect.
        let desired: Vec<SubscriptionKey> =
            self.desired.read().await.iter().cloned().collect();
        for key in &desired {
            write
                .send(Message::Text(key.subscribe_frame().to_string().into()))
                .await
                .context("Failed to send subscribe frame")?;
        }
        debug!("WsManager: Replayed {} subscription(s)", desired.len());

        let mut chan_map: HashMap<i64, SubscriptionKey> = HashMap::new();
        let mut last_msg = Instant::now();
        let mut hb_check = tokio::time::interval(Duration::from_secs(1));
        hb_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(true);
                    }
                }
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        SocketCommand::Subscribe(key) => {
                            write
                                .send(Message::Text(key.subscribe_frame().to_string().into()))
                                .await
                                .context("Failed to send subscribe frame")?;
                        }
                        SocketCommand::Unsubscribe(key) => {
                            let chan_id = chan_map
                                .iter()
                                .find(|(_, k)| **k == key)
                                .map(|(id, _)| *id);
                            if let Some(chan_id) = chan_id {
                                let frame = json!({"event": "unsubscribe", "chanId": chan_id});
                                write
                                    .send(Message::Text(frame.to_string().into()))
                                    .await
                                    .context("Failed to send unsubscribe frame")?;
                            }
                        }
                    }
                }
                _ = hb_check.tick() => {
                    // A socket with no subscriptions is legitimately quiet.
                    if !chan_map.is_empty() && last_msg.elapsed() > self.settings.hb_timeout {
                        bail!(
                            "no message for {:?}, forcing reconnect",
                            self.settings.hb_timeout
                        );
                    }
                }
                msg = read.next() => {
                    last_msg = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.clocks.touch_public();
                            if let Some(frame) = parse_frame(&text) {
                                self.handle_public_frame(frame, &mut chan_map)?;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) => return Ok(false),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => bail!("read error: {}", e),
                        None => bail!("stream ended"),
                    }
                }
            }
        }
    }

    fn handle_public_frame(
        &self,
        frame: WireFrame,
        chan_map: &mut HashMap<i64, SubscriptionKey>,
    ) -> Result<()> {
        match frame {
            WireFrame::Control(ControlEvent::Subscribed {
                chan_id,
                channel,
                symbol,
                key,
            }) => {
                if let Some(sub) = SubscriptionKey::from_subscribed(
                    &channel,
                    symbol.as_deref(),
                    key.as_deref(),
                ) {
                    debug!("WsManager: Channel {} bound to {:?}", chan_id, sub);
                    chan_map.insert(chan_id, sub);
                }
            }
            WireFrame::Control(ControlEvent::Unsubscribed { chan_id }) => {
                chan_map.remove(&chan_id);
            }
            WireFrame::Control(ControlEvent::Info { code, .. }) => match code {
                Some(INFO_RECONNECT) => bail!("server requested reconnect (20051)"),
                Some(INFO_MAINTENANCE_START) => {
                    warn!("WsManager: Exchange entering maintenance (20060)")
                }
                _ => {}
            },
            WireFrame::Control(ControlEvent::Error { code, message }) => {
                warn!("WsManager: Public channel error {:?}: {}", code, message);
            }
            WireFrame::Control(_) => {}
            WireFrame::Heartbeat { .. } => {}
            WireFrame::Account { .. } => {}
            WireFrame::Channel { chan_id, args } => {
                let Some(sub) = chan_map.get(&chan_id).cloned() else {
                    return Ok(());
                };
                self.dispatch_channel_data(&sub, &args);
            }
        }
        Ok(())
    }

    fn dispatch_channel_data(&self, sub: &SubscriptionKey, args: &[Value]) {
        let Some(first) = args.first() else { return };
        match sub {
            SubscriptionKey::Ticker { symbol } => {
                if let Some(ticker) = parse_ticker(first, Utc::now().timestamp_millis()) {
                    self.tickers.upsert(symbol, ticker);
                    self.metrics
                        .marketdata_cache_total
                        .with_label_values(&["ticker"])
                        .inc();
                    let _ = self.event_tx.send(StreamEvent::TickerUpdate {
                        symbol: symbol.clone(),
                        ticker,
                    });
                }
            }
            SubscriptionKey::Candles { symbol, timeframe } => {
                self.apply_candle_payload(symbol, *timeframe, first);
            }
            SubscriptionKey::Trades { symbol } => {
                // [chanId,"te",TRADE] for executions; snapshots are ignored.
                if first.as_str() == Some("te") {
                    if let Some(arr) = args.get(1).and_then(Value::as_array) {
                        let amount = arr
                            .get(2)
                            .and_then(Value::as_f64)
                            .and_then(Decimal::from_f64_retain)
                            .unwrap_or(Decimal::ZERO);
                        let price = arr
                            .get(3)
                            .and_then(Value::as_f64)
                            .and_then(Decimal::from_f64_retain)
                            .unwrap_or(Decimal::ZERO);
                        let _ = self.event_tx.send(StreamEvent::PublicTrade {
                            symbol: symbol.clone(),
                            amount,
                            price,
                        });
                    }
                }
            }
            SubscriptionKey::Book { .. } => {
                self.metrics
                    .marketdata_cache_total
                    .with_label_values(&["book"])
                    .inc();
            }
        }
    }

    fn apply_candle_payload(&self, symbol: &str, timeframe: Timeframe, payload: &Value) {
        let Some(arr) = payload.as_array() else { return };
        if arr.first().map(Value::is_array).unwrap_or(false) {
            // Snapshot: newest first on the wire, cache wants ascending.
            let mut candles: Vec<Candle> = arr.iter().filter_map(parse_candle).collect();
            candles.sort_by_key(|c| c.mts);
            self.candles.replace(symbol, timeframe, candles);
            self.metrics
                .marketdata_cache_total
                .with_label_values(&["candles"])
                .inc();
            return;
        }

        if let Some(candle) = parse_candle(payload) {
            let outcome = self.candles.upsert(symbol, timeframe, candle);
            self.metrics
                .marketdata_cache_total
                .with_label_values(&["candles"])
                .inc();
            if outcome == CandleUpsert::NewCandle {
                if let Some(closed) = self.candles.last_closed(symbol, timeframe) {
                    let _ = self.event_tx.send(StreamEvent::CandleClosed {
                        symbol: symbol.to_string(),
                        timeframe,
                        candle: closed,
                    });
                }
            }
        }
    }

    async fn run_auth_loop(&self) {
        let mut backoff = self.settings.reconnect_base;
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.metrics
                .ws_reconnects_total
                .with_label_values(&["auth"])
                .inc();
            match self.run_auth_socket(&mut shutdown).await {
                Ok(true) => break,
                Ok(false) => {
                    info!("WsManager: Auth socket closed by server, reconnecting");
                    backoff = self.settings.reconnect_base;
                }
                Err(e) => {
                    error!(
                        "WsManager: Auth socket error: {:#}. Reconnecting in {:?}",
                        e, backoff
                    );
                }
            }
            self.private.set_auth_connected(false);
            let _ = self.event_tx.send(StreamEvent::AuthDisconnected);
            tokio::time::sleep(self.jittered(backoff)).await;
            backoff = (backoff * 2).min(self.settings.reconnect_cap);
        }
        info!("WsManager: Auth loop stopped");
    }

    async fn run_auth_socket(&self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let (ws, _) = connect_async(&self.settings.auth_url)
            .await
            .context("Failed to connect auth WebSocket")?;
        let (mut write, mut read) = ws.split();

        let nonce = self.nonce.next().context("Failed to issue auth nonce")?;
        let (auth_payload, auth_sig) = sign_ws_auth(&self.settings.api_secret, nonce);
        let mut auth_frame = json!({
            "event": "auth",
            "apiKey": self.settings.api_key,
            "authSig": auth_sig,
            "authNonce": nonce,
            "authPayload": auth_payload,
        });
        if self.settings.dms_enabled {
            auth_frame["dms"] = json!(DMS_CANCEL_ALL);
        }
        write
            .send(Message::Text(auth_frame.to_string().into()))
            .await
            .context("Failed to send auth payload")?;

        let mut last_msg = Instant::now();
        let mut hb_check = tokio::time::interval(Duration::from_secs(1));
        hb_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(true);
                    }
                }
                _ = hb_check.tick() => {
                    if last_msg.elapsed() > self.settings.hb_timeout {
                        bail!(
                            "no auth message for {:?}, forcing reconnect",
                            self.settings.hb_timeout
                        );
                    }
                }
                msg = read.next() => {
                    last_msg = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.clocks.touch_auth();
                            if let Some(frame) = parse_frame(&text) {
                                self.handle_auth_frame(frame)?;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) => return Ok(false),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => bail!("read error: {}", e),
                        None => bail!("stream ended"),
                    }
                }
            }
        }
    }

    fn handle_auth_frame(&self, frame: WireFrame) -> Result<()> {
        match frame {
            WireFrame::Control(ControlEvent::AuthOk { user_id }) => {
                info!(
                    "WsManager: Auth socket authenticated (user {:?}, dms={})",
                    user_id, self.settings.dms_enabled
                );
                self.private.set_auth_connected(true);
                self.private.set_dms_active(self.settings.dms_enabled);
                let _ = self.event_tx.send(StreamEvent::AuthConnected);
            }
            WireFrame::Control(ControlEvent::AuthFailed { code, message }) => {
                bail!("auth rejected: {} ({:?})", message, code);
            }
            WireFrame::Control(ControlEvent::Info { code, .. }) => {
                if code == Some(INFO_RECONNECT) {
                    bail!("server requested reconnect (20051)");
                }
            }
            WireFrame::Control(_) | WireFrame::Heartbeat { .. } => {}
            WireFrame::Channel { .. } => {}
            WireFrame::Account { msg_type, data } => self.apply_account_event(&msg_type, &data),
        }
        Ok(())
    }

    fn apply_account_event(&self, msg_type: &str, data: &Value) {
        match msg_type {
            "os" => {
                let orders: Vec<OrderRecord> = data
                    .as_array()
                    .map(|rows| rows.iter().filter_map(parse_order).collect())
                    .unwrap_or_default();
                debug!("WsManager: Order snapshot ({} open)", orders.len());
                self.private.replace_orders(orders);
            }
            "on" | "ou" | "oc" => {
                if let Some(order) = parse_order(data) {
                    self.private.apply_order(order.clone());
                    let _ = self.event_tx.send(StreamEvent::OrderUpdate(order));
                }
            }
            "te" | "tu" => {
                if let Some((symbol, order_id, amount, price)) = parse_trade_exec(data) {
                    let _ = self.event_tx.send(StreamEvent::TradeExecuted {
                        symbol,
                        exchange_order_id: order_id,
                        amount,
                        price,
                    });
                }
            }
            "ps" => {
                let positions: Vec<Position> = data
                    .as_array()
                    .map(|rows| {
                        rows.iter()
                            .filter_map(parse_position)
                            .filter(|(_, closed)| !closed)
                            .map(|(p, _)| p)
                            .collect()
                    })
                    .unwrap_or_default();
                self.private.replace_positions(positions);
            }
            "pn" | "pu" | "pc" => {
                if let Some((position, closed)) = parse_position(data) {
                    let closed = closed || msg_type == "pc";
                    self.private.apply_position(position.clone(), closed);
                    let _ = self.event_tx.send(StreamEvent::PositionUpdate(position));
                }
            }
            "ws" => {
                let wallets: Vec<Wallet> = data
                    .as_array()
                    .map(|rows| rows.iter().filter_map(parse_wallet).collect())
                    .unwrap_or_default();
                self.private.replace_wallets(wallets);
            }
            "wu" => {
                if let Some(wallet) = parse_wallet(data) {
                    self.private.apply_wallet(wallet.clone());
                    let _ = self.event_tx.send(StreamEvent::WalletUpdate(wallet));
                }
            }
            "n" => {
                debug!("WsManager: Notification event");
            }
            other => {
                debug!("WsManager: Unhandled account event '{}'", other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_settings() -> WsSettings {
        WsSettings {
            public_url: "wss://example.invalid/ws/2".into(),
            auth_url: "wss://example.invalid/ws/2".into(),
            api_key: String::new(),
            api_secret: String::new(),
            hb_timeout: Duration::from_secs(15),
            max_subs_per_socket: 3,
            queue_capacity: 16,
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(60),
            dms_enabled: false,
        }
    }

    fn test_manager() -> Arc<WsManager> {
        let (_tx, rx) = watch::channel(false);
        Arc::new(WsManager::new(
            test_settings(),
            Arc::new(TickerCache::new()),
            Arc::new(CandleCache::new(100)),
            Arc::new(PrivateState::new()),
            Arc::new(
                NonceService::open(
                    &std::env::temp_dir().join(format!("bfxtrader-ws-{}", std::process::id())),
                    "test-key",
                )
                .unwrap(),
            ),
            Metrics::new().unwrap(),
            rx,
        ))
    }

    #[test]
    fn test_subscription_key_frames() {
        let ticker = SubscriptionKey::Ticker {
            symbol: "tBTCUSD".into(),
        };
        let frame = ticker.subscribe_frame();
        assert_eq!(frame["channel"], "ticker");
        assert_eq!(frame["symbol"], "tBTCUSD");

        let candles = SubscriptionKey::Candles {
            symbol: "tBTCUSD".into(),
            timeframe: Timeframe::OneMin,
        };
        assert_eq!(candles.subscribe_frame()["key"], "trade:1m:tBTCUSD");
    }

    #[test]
    fn test_subscription_key_roundtrip_from_subscribed() {
        let key = SubscriptionKey::from_subscribed("candles", None, Some("trade:5m:tETHUSD"));
        assert_eq!(
            key,
            Some(SubscriptionKey::Candles {
                symbol: "tETHUSD".into(),
                timeframe: Timeframe::FiveMin,
            })
        );
        let ticker = SubscriptionKey::from_subscribed("ticker", Some("tBTCUSD"), None);
        assert_eq!(
            ticker,
            Some(SubscriptionKey::Ticker {
                symbol: "tBTCUSD".into()
            })
        );
    }

    #[tokio::test]
    async fn test_subscription_budget_enforced() {
        let manager = test_manager();
        for symbol in ["tBTCUSD", "tETHUSD", "tLTCUSD"] {
            manager
                .subscribe(SubscriptionKey::Ticker {
                    symbol: symbol.into(),
                })
                .await
                .unwrap();
        }
        let err = manager
            .subscribe(SubscriptionKey::Ticker {
                symbol: "tXRPUSD".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation { .. }));

        // Duplicates are idempotent, not rejected.
        manager
            .subscribe(SubscriptionKey::Ticker {
                symbol: "tBTCUSD".into(),
            })
            .await
            .unwrap();
        assert_eq!(manager.desired_count().await, 3);
    }

    #[tokio::test]
    async fn test_ticker_frame_updates_cache_and_bus() {
        let manager = test_manager();
        let mut events = manager.subscribe_events();
        let mut chan_map = HashMap::new();

        let subscribed = parse_frame(
            r#"{"event":"subscribed","channel":"ticker","chanId":5,"symbol":"tBTCUSD"}"#,
        )
        .unwrap();
        manager
            .handle_public_frame(subscribed, &mut chan_map)
            .unwrap();

        let data =
            parse_frame(r#"[5,[30000,1,30001,2,0,0,30000.5,100,31000,29000]]"#).unwrap();
        manager.handle_public_frame(data, &mut chan_map).unwrap();

        let (ticker, _) = manager.tickers.get("tBTCUSD").unwrap();
        assert_eq!(ticker.bid, dec!(30000));

        match events.try_recv().unwrap() {
            StreamEvent::TickerUpdate { symbol, ticker } => {
                assert_eq!(symbol, "tBTCUSD");
                assert_eq!(ticker.ask, dec!(30001));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_candle_close_emitted_on_new_open_time() {
        let manager = test_manager();
        let mut events = manager.subscribe_events();
        let mut chan_map = HashMap::new();
        chan_map.insert(
            9,
            SubscriptionKey::Candles {
                symbol: "tBTCUSD".into(),
                timeframe: Timeframe::OneMin,
            },
        );

        let first = parse_frame(r#"[9,[60000,10,11,12,9,100]]"#).unwrap();
        manager.handle_public_frame(first, &mut chan_map).unwrap();
        let update = parse_frame(r#"[9,[60000,10,11.5,12,9,120]]"#).unwrap();
        manager.handle_public_frame(update, &mut chan_map).unwrap();
        let next = parse_frame(r#"[9,[120000,11.5,11.6,12,11,10]]"#).unwrap();
        manager.handle_public_frame(next, &mut chan_map).unwrap();

        let mut closed = None;
        while let Ok(event) = events.try_recv() {
            if let StreamEvent::CandleClosed { candle, .. } = event {
                closed = Some(candle);
            }
        }
        let closed = closed.expect("expected a CandleClosed event");
        assert_eq!(closed.mts, 60_000);
        assert_eq!(closed.close, dec!(11.5));
    }

    #[tokio::test]
    async fn test_auth_events_mutate_private_state() {
        let manager = test_manager();

        let wallet_frame = parse_frame(r#"[0,"wu",["exchange","USD",5000,0,4900]]"#).unwrap();
        manager.handle_auth_frame(wallet_frame).unwrap();
        assert_eq!(manager.private.wallets().len(), 1);

        let order_frame = parse_frame(
            r#"[0,"on",[901,null,7,"tBTCUSD",1,2,0.5,0.5,"EXCHANGE LIMIT",null,null,null,0,"ACTIVE",null,null,30000,0,0,0,null,null,null,0,0,null]]"#,
        )
        .unwrap();
        manager.handle_auth_frame(order_frame).unwrap();
        assert_eq!(manager.private.open_orders().len(), 1);

        let cancel_frame = parse_frame(
            r#"[0,"oc",[901,null,7,"tBTCUSD",1,2,0.5,0.5,"EXCHANGE LIMIT",null,null,null,0,"CANCELED",null,null,30000,0,0,0,null,null,null,0,0,null]]"#,
        )
        .unwrap();
        manager.handle_auth_frame(cancel_frame).unwrap();
        assert!(manager.private.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failed_frame_errors_for_reconnect() {
        let manager = test_manager();
        let frame =
            parse_frame(r#"{"event":"auth","status":"FAILED","code":10100,"msg":"apikey"}"#)
                .unwrap();
        assert!(manager.handle_auth_frame(frame).is_err());
    }
}
