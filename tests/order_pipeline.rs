mod common;

use bfxtrader::domain::errors::ApiError;
use bfxtrader::domain::types::{OrderIntent, OrderSide, OrderType};
use common::build_rig;
use rust_decimal_macros::dec;

fn market_intent(id: &str) -> OrderIntent {
    let mut intent = OrderIntent::market("tBTCUSD", OrderSide::Buy, dec!(0.001));
    intent.client_order_id = Some(id.to_string());
    intent
}

#[tokio::test]
async fn test_accepted_order_flows_through() {
    let rig = build_rig("accept", |_| {});
    let result = rig.pipeline.place_order(market_intent("co-1")).await;

    assert!(result.accepted, "rejected: {:?}", result);
    assert!(result.exchange_id.is_some());
    assert_eq!(rig.order_api.submission_count(), 1);

    // Accepted trades are counted by the risk engine.
    assert_eq!(rig.risk.status().trades_today, 1);

    // The audit trail has submit + accept lines.
    let audit = std::fs::read_to_string(rig.state_dir.join("audit.jsonl")).unwrap();
    assert!(audit.contains("\"submitted\""));
    assert!(audit.contains("\"accepted\""));
}

#[tokio::test]
async fn test_idempotent_submit_one_exchange_post() {
    let rig = build_rig("idem", |_| {});

    // Two concurrent calls with the same client-order-id.
    let a = rig.pipeline.clone();
    let b = rig.pipeline.clone();
    let (ra, rb) = tokio::join!(
        a.place_order(market_intent("co-dup")),
        b.place_order(market_intent("co-dup"))
    );

    assert_eq!(ra, rb, "both callers must observe the identical result");
    assert!(ra.accepted);
    assert_eq!(
        rig.order_api.submission_count(),
        1,
        "exactly one exchange submission for a duplicated client id"
    );
}

#[tokio::test]
async fn test_rejections_are_cached_too() {
    let rig = build_rig("idem-reject", |_| {});
    rig.risk.trip_kill_switch("test stop");

    let first = rig.pipeline.place_order(market_intent("co-blocked")).await;
    assert!(!first.accepted);
    assert_eq!(first.gate.as_deref(), Some("kill_switch"));

    // Clearing the switch does not change the cached outcome for the id.
    rig.risk.clear_kill_switch();
    let second = rig.pipeline.place_order(market_intent("co-blocked")).await;
    assert_eq!(first, second);
    assert_eq!(rig.order_api.submission_count(), 0);
}

#[tokio::test]
async fn test_validation_failures() {
    let rig = build_rig("validate", |_| {});

    // Unknown symbol.
    let mut unknown = OrderIntent::market("tNOPEUSD", OrderSide::Buy, dec!(1));
    unknown.client_order_id = Some("co-v1".into());
    let result = rig.pipeline.place_order(unknown).await;
    assert!(!result.accepted);
    assert_eq!(result.kind.as_deref(), Some("validation_error"));

    // Non-tradable symbol.
    let mut delisted = OrderIntent::market("tDELISTED", OrderSide::Sell, dec!(1));
    delisted.client_order_id = Some("co-v2".into());
    let result = rig.pipeline.place_order(delisted).await;
    assert_eq!(result.kind.as_deref(), Some("validation_error"));

    // Amount below the minimum step.
    let mut dust = OrderIntent::market("tBTCUSD", OrderSide::Buy, dec!(0.00001));
    dust.client_order_id = Some("co-v3".into());
    let result = rig.pipeline.place_order(dust).await;
    assert_eq!(result.kind.as_deref(), Some("validation_error"));

    // LIMIT without a price.
    let mut no_price = OrderIntent {
        client_order_id: Some("co-v4".into()),
        symbol: "tBTCUSD".into(),
        side: OrderSide::Buy,
        order_type: OrderType::ExchangeLimit,
        amount: dec!(0.001),
        price: None,
        flags: Default::default(),
        bracket: None,
    };
    no_price.flags.post_only = true;
    let result = rig.pipeline.place_order(no_price).await;
    assert_eq!(result.kind.as_deref(), Some("validation_error"));

    // Nothing reached the exchange.
    assert_eq!(rig.order_api.submission_count(), 0);
}

#[tokio::test]
async fn test_risk_denial_blocks_submission() {
    let rig = build_rig("risk-block", |source| {
        source.set_override("max_trades_per_symbol_per_day", Some("1".into()));
    });

    let first = rig.pipeline.place_order(market_intent("co-a")).await;
    assert!(first.accepted);

    let second = rig.pipeline.place_order(market_intent("co-b")).await;
    assert!(!second.accepted);
    assert_eq!(second.kind.as_deref(), Some("risk_denied"));
    assert_eq!(second.gate.as_deref(), Some("max_trades_per_symbol"));
    assert_eq!(
        rig.order_api.submission_count(),
        1,
        "denied intents must never reach the exchange"
    );
}

#[tokio::test]
async fn test_transport_failure_goes_to_dead_letter() {
    let rig = build_rig("dead-letter", |_| {});
    rig.order_api.push_error(ApiError::Transport {
        endpoint: "auth/w".into(),
        reason: "connection reset by peer".into(),
    });

    let result = rig.pipeline.place_order(market_intent("co-dl")).await;
    assert!(!result.accepted);
    assert_eq!(result.kind.as_deref(), Some("transport_error"));

    let parked = rig.pipeline.dead_letters();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].client_order_id, "co-dl");

    // Dead letters are never auto-resubmitted.
    assert_eq!(rig.order_api.submission_count(), 0);
}

#[tokio::test]
async fn test_exchange_error_is_terminal_without_dead_letter() {
    let rig = build_rig("exch-err", |_| {});
    rig.order_api.push_error(ApiError::Exchange {
        code: 10020,
        message: "amount: invalid".into(),
    });

    let result = rig.pipeline.place_order(market_intent("co-ex")).await;
    assert!(!result.accepted);
    assert_eq!(result.kind.as_deref(), Some("exchange_error"));
    assert!(rig.pipeline.dead_letters().is_empty());
}

#[tokio::test]
async fn test_dry_run_skips_exchange() {
    let rig = build_rig("dry-run", |_| {});
    rig.pipeline.set_dry_run(true);

    let result = rig.pipeline.place_order(market_intent("co-dry")).await;
    assert!(result.accepted);
    assert!(result.dry_run);
    assert_eq!(rig.order_api.submission_count(), 0);

    rig.pipeline.set_dry_run(false);
    let live = rig.pipeline.place_order(market_intent("co-live")).await;
    assert!(live.accepted);
    assert!(!live.dry_run);
    assert_eq!(rig.order_api.submission_count(), 1);
}

#[tokio::test]
async fn test_generated_client_id_when_absent() {
    let rig = build_rig("gen-id", |_| {});
    let intent = OrderIntent::market("tBTCUSD", OrderSide::Buy, dec!(0.001));
    let result = rig.pipeline.place_order(intent).await;
    assert!(result.accepted);
    assert!(
        uuid::Uuid::parse_str(&result.client_order_id).is_ok(),
        "auto-generated id must be a UUID, got {}",
        result.client_order_id
    );
}
