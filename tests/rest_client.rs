//! REST client behaviour against a local HTTP stub: retry on 5xx, 429
//! `Retry-After` honoring, nonce-too-small recovery, and fatal 4xx.

use bfxtrader::config::{ConfigSource, ExchangeConfig};
use bfxtrader::domain::errors::ApiError;
use bfxtrader::domain::ports::{MarketApi, OrderApi};
use bfxtrader::domain::types::{OrderIntent, OrderSide};
use bfxtrader::infrastructure::bitfinex::BitfinexRestClient;
use bfxtrader::infrastructure::core::circuit_breaker::{
    BreakerState, CircuitBreakerRegistry, TRANSPORT_BREAKER,
};
use bfxtrader::infrastructure::core::rate_limiter::RateLimiter;
use bfxtrader::infrastructure::nonce::NonceService;
use bfxtrader::infrastructure::observability::Metrics;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One canned response per inbound request; connections are closed after
/// each exchange so every request dials fresh.
struct StubExchange {
    addr: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StubExchange {
    async fn start(responses: Vec<(u16, &'static str, Vec<(&'static str, String)>)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let captured = requests.clone();

        tokio::spawn(async move {
            for (status, body, headers) in responses {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let raw = read_http_request(&mut sock).await;
                captured.lock().unwrap().push(raw);

                let mut response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n",
                    status,
                    body.len()
                );
                for (name, value) in &headers {
                    response.push_str(&format!("{}: {}\r\n", name, value));
                }
                response.push_str("\r\n");
                response.push_str(body);
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });

        Self { addr, requests }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, idx: usize) -> String {
        self.requests.lock().unwrap()[idx].clone()
    }
}

async fn read_http_request(sock: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Ok(n) = sock.read(&mut chunk).await else {
            break;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn client_for(
    stub: &StubExchange,
    tag: &str,
) -> (BitfinexRestClient, Arc<CircuitBreakerRegistry>, Arc<NonceService>) {
    let source = ConfigSource::new();
    source.set_override("rest_public_url", Some(stub.addr.clone()));
    source.set_override("rest_auth_url", Some(stub.addr.clone()));
    source.set_override("api_key", Some("test-key".into()));
    source.set_override("api_secret", Some("test-secret".into()));
    source.set_override("retry_base_delay_ms", Some("10".into()));
    source.set_override("call_deadline_secs", Some("10".into()));
    let config = ExchangeConfig::load(&source).unwrap();

    let breakers = Arc::new(CircuitBreakerRegistry::with_defaults());
    let nonce_dir = std::env::temp_dir().join(format!(
        "bfxtrader-rest-it-{}-{}",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&nonce_dir);
    let nonce = Arc::new(NonceService::open(&nonce_dir, "test-key").unwrap());
    let client = BitfinexRestClient::new(
        config,
        Arc::new(RateLimiter::bitfinex_default()),
        breakers.clone(),
        nonce.clone(),
        Metrics::new().unwrap(),
    );
    (client, breakers, nonce)
}

const TICKER_BODY: &str = "[30000,1,30001,2,0,0,30000.5,100,31000,29000]";

#[tokio::test]
async fn test_5xx_retried_then_succeeds() {
    let stub = StubExchange::start(vec![
        (500, "oops", vec![]),
        (200, TICKER_BODY, vec![]),
    ])
    .await;
    let (client, breakers, _) = client_for(&stub, "retry5xx");

    let ticker = client.ticker("tBTCUSD").await.unwrap();
    assert_eq!(ticker.bid, dec!(30000));
    assert_eq!(stub.request_count(), 2);
    // One transient failure does not open the transport breaker.
    assert_eq!(
        breakers.state(TRANSPORT_BREAKER),
        Some(BreakerState::Closed)
    );
}

#[tokio::test]
async fn test_429_waits_for_retry_after() {
    let stub = StubExchange::start(vec![
        (429, "slow down", vec![("Retry-After", "1".to_string())]),
        (200, TICKER_BODY, vec![]),
    ])
    .await;
    let (client, _, _) = client_for(&stub, "retry429");

    let start = Instant::now();
    let ticker = client.ticker("tBTCUSD").await.unwrap();
    assert_eq!(ticker.last_price, dec!(30000.5));
    assert!(
        start.elapsed() >= Duration::from_millis(950),
        "Retry-After not honored: {:?}",
        start.elapsed()
    );
    assert_eq!(stub.request_count(), 2);
}

#[tokio::test]
async fn test_nonce_too_small_bumps_and_retries_once() {
    const SUBMIT_OK: &str = r#"[1700000000000,"on-req",null,null,[[12345,null,7,"tBTCUSD",1,2,0.001,0.001,"EXCHANGE MARKET",null,null,null,0,"ACTIVE",null,null,0,0,0,0,null,null,null,0,0,null]],0,"SUCCESS","Submitting order"]"#;
    let stub = StubExchange::start(vec![
        (400, r#"["error",10114,"nonce: small"]"#, vec![]),
        (200, SUBMIT_OK, vec![]),
    ])
    .await;
    let (client, _, nonce) = client_for(&stub, "nonce");
    let before = nonce.current();

    let intent = OrderIntent::market("tBTCUSD", OrderSide::Buy, dec!(0.001));
    let ack = client.submit_order(&intent, "co-1", None).await.unwrap();
    assert_eq!(ack.exchange_id, 12345);
    assert_eq!(stub.request_count(), 2, "exactly one retry");

    // The bump jumped well past the rejected nonce.
    assert!(nonce.current() >= before + 1000);

    // Both attempts carried a nonce header, strictly increasing.
    let first = stub.request(0);
    let second = stub.request(1);
    let nonce_of = |raw: &str| -> i64 {
        raw.lines()
            .find_map(|l| l.strip_prefix("bfx-nonce: "))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    };
    assert!(nonce_of(&second) > nonce_of(&first));
}

#[tokio::test]
async fn test_fatal_4xx_not_retried() {
    let stub = StubExchange::start(vec![(
        400,
        r#"["error",10020,"symbol: invalid"]"#,
        vec![],
    )])
    .await;
    let (client, breakers, _) = client_for(&stub, "fatal4xx");

    let err = client.ticker("tNOPE").await.unwrap_err();
    match err {
        ApiError::Exchange { code, .. } => assert_eq!(code, 10020),
        other => panic!("expected exchange error, got {:?}", other),
    }
    assert_eq!(stub.request_count(), 1, "4xx must not be retried");
    assert_eq!(
        breakers.state(TRANSPORT_BREAKER),
        Some(BreakerState::Closed),
        "4xx must not trip the breaker"
    );
}

#[tokio::test]
async fn test_signed_request_carries_auth_headers() {
    let stub = StubExchange::start(vec![(200, "[]", vec![])]).await;
    let (client, _, _) = client_for(&stub, "headers");

    let orders = client.active_orders().await.unwrap();
    assert!(orders.is_empty());

    let raw = stub.request(0);
    assert!(raw.contains("bfx-apikey: test-key"));
    assert!(raw.contains("bfx-nonce: "));
    assert!(raw.contains("bfx-signature: "));
    assert!(raw.starts_with("POST /v2/auth/r/orders"));
}
