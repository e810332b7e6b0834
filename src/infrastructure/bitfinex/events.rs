//! Parsing of Bitfinex v2 wire frames.
//!
//! The v2 protocol speaks positional JSON arrays; control traffic comes as
//! JSON objects with an `event` field. Channel payload shape depends on the
//! subscription a channel id belongs to, so the socket task interprets raw
//! values through the typed helpers here.

use crate::domain::types::{
    BookLevel, Candle, LedgerEntry, MarginInfo, OrderRecord, OrderStatus, Position, PublicTrade,
    Ticker, TradeFill, Wallet, WalletType,
};
use rust_decimal::Decimal;
use serde_json::Value;

/// Control events delivered as JSON objects.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Info {
        version: Option<i64>,
        code: Option<i64>,
    },
    Subscribed {
        chan_id: i64,
        channel: String,
        symbol: Option<String>,
        key: Option<String>,
    },
    Unsubscribed {
        chan_id: i64,
    },
    AuthOk {
        user_id: Option<i64>,
    },
    AuthFailed {
        code: Option<i64>,
        message: String,
    },
    Error {
        code: Option<i64>,
        message: String,
    },
    Pong,
}

/// One inbound frame, either control or a channel data array.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Control(ControlEvent),
    /// `[chanId, ...args]`; args left raw for the subscription map.
    Channel { chan_id: i64, args: Vec<Value> },
    /// `[chanId, "hb"]`
    Heartbeat { chan_id: i64 },
    /// Auth channel message `[0, type, data]`.
    Account { msg_type: String, data: Value },
}

pub fn parse_frame(text: &str) -> Option<WireFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    match &value {
        Value::Object(map) => {
            let event = map.get("event")?.as_str()?;
            let control = match event {
                "info" => ControlEvent::Info {
                    version: map.get("version").and_then(Value::as_i64),
                    code: map.get("code").and_then(Value::as_i64),
                },
                "subscribed" => ControlEvent::Subscribed {
                    chan_id: map.get("chanId")?.as_i64()?,
                    channel: map.get("channel")?.as_str()?.to_string(),
                    symbol: map
                        .get("symbol")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    key: map.get("key").and_then(Value::as_str).map(str::to_string),
                },
                "unsubscribed" => ControlEvent::Unsubscribed {
                    chan_id: map.get("chanId")?.as_i64()?,
                },
                "auth" => {
                    if map.get("status").and_then(Value::as_str) == Some("OK") {
                        ControlEvent::AuthOk {
                            user_id: map.get("userId").and_then(Value::as_i64),
                        }
                    } else {
                        ControlEvent::AuthFailed {
                            code: map.get("code").and_then(Value::as_i64),
                            message: map
                                .get("msg")
                                .and_then(Value::as_str)
                                .unwrap_or("auth failed")
                                .to_string(),
                        }
                    }
                }
                "error" => ControlEvent::Error {
                    code: map.get("code").and_then(Value::as_i64),
                    message: map
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                },
                "pong" => ControlEvent::Pong,
                _ => return None,
            };
            Some(WireFrame::Control(control))
        }
        Value::Array(items) => {
            let chan_id = items.first()?.as_i64()?;
            if items.get(1).and_then(Value::as_str) == Some("hb") {
                return Some(WireFrame::Heartbeat { chan_id });
            }
            if chan_id == 0 {
                let msg_type = items.get(1)?.as_str()?.to_string();
                let data = items.get(2).cloned().unwrap_or(Value::Null);
                return Some(WireFrame::Account { msg_type, data });
            }
            Some(WireFrame::Channel {
                chan_id,
                args: items[1..].to_vec(),
            })
        }
        _ => None,
    }
}

fn dec_at(arr: &[Value], idx: usize) -> Decimal {
    arr.get(idx)
        .and_then(Value::as_f64)
        .and_then(Decimal::from_f64_retain)
        .unwrap_or(Decimal::ZERO)
}

fn i64_at(arr: &[Value], idx: usize) -> Option<i64> {
    arr.get(idx).and_then(Value::as_i64)
}

fn str_at<'a>(arr: &'a [Value], idx: usize) -> Option<&'a str> {
    arr.get(idx).and_then(Value::as_str)
}

/// Ticker payload: `[BID, BID_SIZE, ASK, ASK_SIZE, DAILY_CHANGE,
/// DAILY_CHANGE_REL, LAST_PRICE, VOLUME, HIGH, LOW]`.
pub fn parse_ticker(payload: &Value, ts_ms: i64) -> Option<Ticker> {
    let arr = payload.as_array()?;
    if arr.len() < 8 {
        return None;
    }
    Some(Ticker {
        bid: dec_at(arr, 0),
        ask: dec_at(arr, 2),
        last_price: dec_at(arr, 6),
        volume: dec_at(arr, 7),
        ts_ms,
    })
}

/// Candle payload: `[MTS, OPEN, CLOSE, HIGH, LOW, VOLUME]`.
pub fn parse_candle(payload: &Value) -> Option<Candle> {
    let arr = payload.as_array()?;
    if arr.len() < 6 {
        return None;
    }
    Some(Candle {
        mts: i64_at(arr, 0)?,
        open: dec_at(arr, 1),
        close: dec_at(arr, 2),
        high: dec_at(arr, 3),
        low: dec_at(arr, 4),
        volume: dec_at(arr, 5),
    })
}

/// A candle channel delivers either a snapshot (array of candle arrays,
/// newest first) or a single update.
pub fn parse_candle_payload(payload: &Value) -> Vec<Candle> {
    let Some(arr) = payload.as_array() else {
        return Vec::new();
    };
    if arr.first().map(Value::is_array).unwrap_or(false) {
        let mut candles: Vec<Candle> = arr.iter().filter_map(parse_candle).collect();
        candles.sort_by_key(|c| c.mts);
        candles
    } else {
        parse_candle(payload).into_iter().collect()
    }
}

fn parse_order_status(raw: &str) -> OrderStatus {
    if raw.starts_with("ACTIVE") {
        OrderStatus::Active
    } else if raw.starts_with("EXECUTED") {
        OrderStatus::Executed
    } else if raw.contains("PARTIALLY FILLED") {
        OrderStatus::PartiallyFilled
    } else if raw.contains("CANCELED") {
        OrderStatus::Cancelled
    } else if raw.contains("REJECTED") {
        OrderStatus::Rejected
    } else {
        OrderStatus::Active
    }
}

/// Order array: `[ID, GID, CID, SYMBOL, MTS_CREATE, MTS_UPDATE, AMOUNT,
/// AMOUNT_ORIG, TYPE, _, _, _, FLAGS, STATUS, _, _, PRICE, PRICE_AVG, ...]`.
pub fn parse_order(payload: &Value) -> Option<OrderRecord> {
    let arr = payload.as_array()?;
    if arr.len() < 18 {
        return None;
    }
    Some(OrderRecord {
        exchange_id: i64_at(arr, 0)?,
        client_order_id: i64_at(arr, 2).map(|cid| cid.to_string()),
        symbol: str_at(arr, 3)?.to_string(),
        order_type: str_at(arr, 8).unwrap_or("").to_string(),
        status: parse_order_status(str_at(arr, 13).unwrap_or("ACTIVE")),
        amount_orig: dec_at(arr, 7),
        amount_remaining: dec_at(arr, 6),
        price: dec_at(arr, 16),
        avg_fill_price: dec_at(arr, 17),
        group_id: i64_at(arr, 1),
        updated_at_ms: i64_at(arr, 5).unwrap_or(0),
    })
}

/// Position array: `[SYMBOL, STATUS, AMOUNT, BASE_PRICE, _, _, PL, ...]`.
/// Returns `(position, is_closed)`.
pub fn parse_position(payload: &Value) -> Option<(Position, bool)> {
    let arr = payload.as_array()?;
    if arr.len() < 7 {
        return None;
    }
    let closed = str_at(arr, 1).map(|s| s != "ACTIVE").unwrap_or(false);
    Some((
        Position {
            symbol: str_at(arr, 0)?.to_string(),
            amount: dec_at(arr, 2),
            base_price: dec_at(arr, 3),
            unrealized_pnl: dec_at(arr, 6),
        },
        closed,
    ))
}

/// Wallet array: `[WALLET_TYPE, CURRENCY, BALANCE, UNSETTLED, AVAILABLE, ...]`.
pub fn parse_wallet(payload: &Value) -> Option<Wallet> {
    let arr = payload.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    Some(Wallet {
        wallet_type: WalletType::parse(str_at(arr, 0)?)?,
        currency: str_at(arr, 1)?.to_string(),
        balance: dec_at(arr, 2),
        available: arr
            .get(4)
            .and_then(Value::as_f64)
            .and_then(Decimal::from_f64_retain),
    })
}

/// Trade execution `te`/`tu` array: `[ID, SYMBOL, MTS, ORDER_ID, EXEC_AMOUNT,
/// EXEC_PRICE, ...]`. Returns `(symbol, order_id, amount, price)`.
pub fn parse_trade_exec(payload: &Value) -> Option<(String, i64, Decimal, Decimal)> {
    let arr = payload.as_array()?;
    if arr.len() < 6 {
        return None;
    }
    Some((
        str_at(arr, 1)?.to_string(),
        i64_at(arr, 3)?,
        dec_at(arr, 4),
        dec_at(arr, 5),
    ))
}

/// Book level: `[PRICE, COUNT, AMOUNT]`.
pub fn parse_book_level(payload: &Value) -> Option<BookLevel> {
    let arr = payload.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    Some(BookLevel {
        price: dec_at(arr, 0),
        count: i64_at(arr, 1)?,
        amount: dec_at(arr, 2),
    })
}

/// Public trade print: `[ID, MTS, AMOUNT, PRICE]`.
pub fn parse_public_trade(payload: &Value) -> Option<PublicTrade> {
    let arr = payload.as_array()?;
    if arr.len() < 4 {
        return None;
    }
    Some(PublicTrade {
        id: i64_at(arr, 0)?,
        mts: i64_at(arr, 1)?,
        amount: dec_at(arr, 2),
        price: dec_at(arr, 3),
    })
}

/// Own fill from trades history: `[ID, PAIR, MTS, ORDER_ID, EXEC_AMOUNT,
/// EXEC_PRICE, ORDER_TYPE, ORDER_PRICE, MAKER, FEE, FEE_CURRENCY]`.
pub fn parse_trade_fill(payload: &Value) -> Option<TradeFill> {
    let arr = payload.as_array()?;
    if arr.len() < 11 {
        return None;
    }
    Some(TradeFill {
        id: i64_at(arr, 0)?,
        symbol: str_at(arr, 1)?.to_string(),
        mts: i64_at(arr, 2)?,
        order_id: i64_at(arr, 3)?,
        exec_amount: dec_at(arr, 4),
        exec_price: dec_at(arr, 5),
        fee: dec_at(arr, 9),
        fee_currency: str_at(arr, 10).unwrap_or("").to_string(),
    })
}

/// Ledger row: `[ID, CURRENCY, null, MTS, null, AMOUNT, BALANCE, null,
/// DESCRIPTION]`.
pub fn parse_ledger_entry(payload: &Value) -> Option<LedgerEntry> {
    let arr = payload.as_array()?;
    if arr.len() < 9 {
        return None;
    }
    Some(LedgerEntry {
        id: i64_at(arr, 0)?,
        currency: str_at(arr, 1)?.to_string(),
        mts: i64_at(arr, 3)?,
        amount: dec_at(arr, 5),
        balance: dec_at(arr, 6),
        description: str_at(arr, 8).unwrap_or("").to_string(),
    })
}

/// Margin base info: `["base", [USER_PL, USER_SWAPS, MARGIN_BALANCE,
/// MARGIN_NET, ...]]`.
pub fn parse_margin_base(value: &Value) -> Option<MarginInfo> {
    let arr = value.as_array()?;
    if str_at(arr, 0)? != "base" {
        return None;
    }
    let data = arr.get(1)?.as_array()?;
    if data.len() < 4 {
        return None;
    }
    Some(MarginInfo {
        user_pl: dec_at(data, 0),
        user_swaps: dec_at(data, 1),
        margin_balance: dec_at(data, 2),
        margin_net: dec_at(data, 3),
    })
}

/// REST write notification: `[MTS, TYPE, MESSAGE_ID, null, DATA, CODE,
/// STATUS, TEXT]`. Returns `(status, text, data)`.
pub fn parse_notification(value: &Value) -> Option<(String, String, Value)> {
    let arr = value.as_array()?;
    if arr.len() < 8 {
        return None;
    }
    Some((
        str_at(arr, 6)?.to_string(),
        str_at(arr, 7).unwrap_or("").to_string(),
        arr.get(4).cloned().unwrap_or(Value::Null),
    ))
}

/// Error body: `["error", CODE, "message"]`.
pub fn parse_error_body(value: &Value) -> Option<(i64, String)> {
    let arr = value.as_array()?;
    if str_at(arr, 0)? != "error" {
        return None;
    }
    Some((
        i64_at(arr, 1).unwrap_or(0),
        str_at(arr, 2).unwrap_or("").to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_subscribed_event() {
        let frame = parse_frame(
            r#"{"event":"subscribed","channel":"ticker","chanId":17,"symbol":"tBTCUSD"}"#,
        )
        .unwrap();
        match frame {
            WireFrame::Control(ControlEvent::Subscribed {
                chan_id,
                channel,
                symbol,
                ..
            }) => {
                assert_eq!(chan_id, 17);
                assert_eq!(channel, "ticker");
                assert_eq!(symbol.as_deref(), Some("tBTCUSD"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_parse_auth_events() {
        let ok = parse_frame(r#"{"event":"auth","status":"OK","userId":77}"#).unwrap();
        assert!(matches!(
            ok,
            WireFrame::Control(ControlEvent::AuthOk { user_id: Some(77) })
        ));

        let failed =
            parse_frame(r#"{"event":"auth","status":"FAILED","code":10100,"msg":"apikey"}"#)
                .unwrap();
        assert!(matches!(
            failed,
            WireFrame::Control(ControlEvent::AuthFailed {
                code: Some(10100),
                ..
            })
        ));
    }

    #[test]
    fn test_parse_heartbeat_and_channel() {
        assert_eq!(
            parse_frame(r#"[17,"hb"]"#),
            Some(WireFrame::Heartbeat { chan_id: 17 })
        );
        match parse_frame(r#"[17,[30000,1,30001,2,0,0,30000.5,100,31000,29000]]"#).unwrap() {
            WireFrame::Channel { chan_id, args } => {
                assert_eq!(chan_id, 17);
                let ticker = parse_ticker(&args[0], 1000).unwrap();
                assert_eq!(ticker.bid, dec!(30000));
                assert_eq!(ticker.ask, dec!(30001));
                assert_eq!(ticker.last_price, dec!(30000.5));
                assert_eq!(ticker.ts_ms, 1000);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_parse_account_frame() {
        match parse_frame(r#"[0,"wu",["exchange","USD",1000,0,995]]"#).unwrap() {
            WireFrame::Account { msg_type, data } => {
                assert_eq!(msg_type, "wu");
                let wallet = parse_wallet(&data).unwrap();
                assert_eq!(wallet.currency, "USD");
                assert_eq!(wallet.balance, dec!(1000));
                assert_eq!(wallet.available, Some(dec!(995)));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_parse_candle_snapshot_sorted_ascending() {
        let payload: Value = serde_json::from_str(
            "[[120000,10,11,12,9,100],[60000,9,10,11,8,50],[180000,11,12,13,10,70]]",
        )
        .unwrap();
        let candles = parse_candle_payload(&payload);
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].mts, 60000);
        assert_eq!(candles[2].mts, 180000);
    }

    #[test]
    fn test_parse_candle_single_update() {
        let payload: Value = serde_json::from_str("[60000,9,10,11,8,50]").unwrap();
        let candles = parse_candle_payload(&payload);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, dec!(10));
        assert_eq!(candles[0].high, dec!(11));
    }

    #[test]
    fn test_parse_order_and_status_mapping() {
        let payload: Value = serde_json::from_str(
            r#"[12345,99,7,"tBTCUSD",1,2,0.5,1.0,"EXCHANGE LIMIT",null,null,null,0,"PARTIALLY FILLED @ 30000.0(0.5)",null,null,30000,30000,0,0,null,null,null,0,0,null]"#,
        )
        .unwrap();
        let order = parse_order(&payload).unwrap();
        assert_eq!(order.exchange_id, 12345);
        assert_eq!(order.group_id, Some(99));
        assert_eq!(order.client_order_id.as_deref(), Some("7"));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_amount(), dec!(0.5));
    }

    #[test]
    fn test_parse_position_closed_flag() {
        let payload: Value =
            serde_json::from_str(r#"["tBTCUSD","CLOSED",0,30000,0,0,-12.5,0,0,0]"#).unwrap();
        let (position, closed) = parse_position(&payload).unwrap();
        assert!(closed);
        assert_eq!(position.unrealized_pnl, dec!(-12.5));
    }

    #[test]
    fn test_parse_notification_success() {
        let value: Value = serde_json::from_str(
            r#"[1700000000000,"on-req",null,null,[[12345,null,7,"tBTCUSD",1,2,1.0,1.0,"EXCHANGE MARKET",null,null,null,0,"ACTIVE",null,null,0,0,0,0,null,null,null,0,0,null]],0,"SUCCESS","Submitting order"]"#,
        )
        .unwrap();
        let (status, text, data) = parse_notification(&value).unwrap();
        assert_eq!(status, "SUCCESS");
        assert!(text.contains("Submitting"));
        let order = parse_order(data.as_array().unwrap().first().unwrap()).unwrap();
        assert_eq!(order.exchange_id, 12345);
    }

    #[test]
    fn test_parse_book_level_and_public_trade() {
        let level: Value = serde_json::from_str("[30000.5,3,-1.25]").unwrap();
        let level = parse_book_level(&level).unwrap();
        assert_eq!(level.count, 3);
        assert_eq!(level.amount, dec!(-1.25));

        let trade: Value = serde_json::from_str("[901,1700000000000,0.5,30000]").unwrap();
        let trade = parse_public_trade(&trade).unwrap();
        assert_eq!(trade.id, 901);
        assert_eq!(trade.price, dec!(30000));
    }

    #[test]
    fn test_parse_trade_fill() {
        let value: Value = serde_json::from_str(
            r#"[77,"tBTCUSD",1700000000000,12345,0.5,30000,"EXCHANGE LIMIT",30000,1,-0.001,"BTC"]"#,
        )
        .unwrap();
        let fill = parse_trade_fill(&value).unwrap();
        assert_eq!(fill.order_id, 12345);
        assert_eq!(fill.fee, dec!(-0.001));
        assert_eq!(fill.fee_currency, "BTC");
    }

    #[test]
    fn test_parse_ledger_entry() {
        let value: Value = serde_json::from_str(
            r#"[5001,"USD",null,1700000000000,null,-12.5,987.5,null,"Trading fee"]"#,
        )
        .unwrap();
        let entry = parse_ledger_entry(&value).unwrap();
        assert_eq!(entry.currency, "USD");
        assert_eq!(entry.balance, dec!(987.5));
        assert_eq!(entry.description, "Trading fee");
    }

    #[test]
    fn test_parse_margin_base() {
        let value: Value =
            serde_json::from_str(r#"["base",[12.5,-1.0,5000,5011.5,null,null]]"#).unwrap();
        let info = parse_margin_base(&value).unwrap();
        assert_eq!(info.user_pl, dec!(12.5));
        assert_eq!(info.margin_net, dec!(5011.5));
    }

    #[test]
    fn test_parse_error_body() {
        let value: Value = serde_json::from_str(r#"["error",10114,"nonce: small"]"#).unwrap();
        let (code, message) = parse_error_body(&value).unwrap();
        assert_eq!(code, 10114);
        assert_eq!(message, "nonce: small");
    }
}
