//! The idempotent order-submission pipeline.
//!
//! Stages: validate → idempotency lookup → risk gate → submit (rate-limited
//! REST path, or the paper backend in dry-run) → record → bracket linkage.
//! Submissions for one symbol are serialized through a per-symbol mutex;
//! concurrent calls with the same client-order-id observe the cached result.

use crate::application::market_data::MarketDataFacade;
use crate::application::orders::bracket::BracketManager;
use crate::application::orders::idempotency::TtlCache;
use crate::application::risk::RiskPolicyEngine;
use crate::domain::errors::ApiError;
use crate::domain::ports::{CancelScope, OrderApi};
use crate::domain::symbol::SymbolRegistry;
use crate::domain::types::{OrderIntent, OrderType};
use crate::infrastructure::persistence::audit_log::{AuditEvent, AuditLog};
use crate::infrastructure::observability::Metrics;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Terminal outcome of one `place_order` call; cached per client-order-id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderResult {
    pub accepted: bool,
    pub client_order_id: String,
    pub exchange_id: Option<i64>,
    pub group_id: Option<i64>,
    /// Error kind on rejection (`validation_error`, `risk_denied`, ...).
    pub kind: Option<String>,
    pub gate: Option<String>,
    pub reason: Option<String>,
    pub dry_run: bool,
}

impl PlaceOrderResult {
    fn accepted(client_order_id: String, exchange_id: i64, dry_run: bool) -> Self {
        Self {
            accepted: true,
            client_order_id,
            exchange_id: Some(exchange_id),
            group_id: None,
            kind: None,
            gate: None,
            reason: None,
            dry_run,
        }
    }

    fn rejected(
        client_order_id: String,
        kind: &str,
        gate: Option<String>,
        reason: String,
    ) -> Self {
        Self {
            accepted: false,
            client_order_id,
            exchange_id: None,
            group_id: None,
            kind: Some(kind.to_string()),
            gate,
            reason: Some(reason),
            dry_run: false,
        }
    }
}

/// Terminal transport failure parked for operator review; never resubmitted
/// automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub client_order_id: String,
    pub symbol: String,
    pub reason: String,
    pub ts_ms: i64,
}

pub struct OrderPipeline {
    registry: Arc<SymbolRegistry>,
    idempotency: Arc<TtlCache<PlaceOrderResult>>,
    risk: Arc<RiskPolicyEngine>,
    live_api: Arc<dyn OrderApi>,
    paper_api: Arc<dyn OrderApi>,
    facade: Arc<MarketDataFacade>,
    brackets: Arc<BracketManager>,
    audit: Arc<AuditLog>,
    metrics: Metrics,
    dry_run: AtomicBool,
    symbol_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    dead_letters: StdMutex<Vec<DeadLetter>>,
}

impl OrderPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SymbolRegistry>,
        idempotency: Arc<TtlCache<PlaceOrderResult>>,
        risk: Arc<RiskPolicyEngine>,
        live_api: Arc<dyn OrderApi>,
        paper_api: Arc<dyn OrderApi>,
        facade: Arc<MarketDataFacade>,
        brackets: Arc<BracketManager>,
        audit: Arc<AuditLog>,
        metrics: Metrics,
        dry_run: bool,
    ) -> Self {
        Self {
            registry,
            idempotency,
            risk,
            live_api,
            paper_api,
            facade,
            brackets,
            audit,
            metrics,
            dry_run: AtomicBool::new(dry_run),
            symbol_locks: StdMutex::new(HashMap::new()),
            dead_letters: StdMutex::new(Vec::new()),
        }
    }

    pub fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::SeqCst);
        info!("OrderPipeline: Dry-run {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .expect("dead letter lock poisoned")
            .clone()
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.symbol_locks.lock().expect("symbol lock map poisoned");
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn place_order(&self, intent: OrderIntent) -> PlaceOrderResult {
        let client_order_id = intent
            .client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Per-symbol serialization keeps risk counters and bracket groups
        // coherent; the idempotency read sits inside the critical section so
        // a concurrent duplicate waits and then observes the cached result.
        let lock = self.symbol_lock(&intent.symbol);
        let _guard = lock.lock().await;

        if let Some(cached) = self.idempotency.get(&client_order_id) {
            self.metrics
                .idempotency_hits_total
                .with_label_values(&[if cached.accepted { "accepted" } else { "rejected" }])
                .inc();
            info!(
                "OrderPipeline: Idempotency hit for {}, replaying cached result",
                client_order_id
            );
            return cached;
        }

        let result = self.run_pipeline(&intent, &client_order_id).await;

        let side_str = intent.side.to_string();
        self.metrics
            .orders_total
            .with_label_values(&[
                side_str.as_str(),
                if result.accepted { "accepted" } else { "rejected" },
            ])
            .inc();
        self.idempotency.insert(&client_order_id, result.clone());
        result
    }

    async fn run_pipeline(
        &self,
        intent: &OrderIntent,
        client_order_id: &str,
    ) -> PlaceOrderResult {
        // Stage 1: validation.
        if let Err(reason) = self.validate(intent) {
            self.audit.record(
                client_order_id,
                AuditEvent::Rejected {
                    kind: "validation_error".to_string(),
                    reason: reason.clone(),
                },
            );
            return PlaceOrderResult::rejected(
                client_order_id.to_string(),
                "validation_error",
                None,
                reason,
            );
        }

        // Stage 2: risk gate. Exposure projection uses the intent price or
        // the current mark for market orders.
        let ref_price = match self.reference_price(intent).await {
            Ok(price) => price,
            Err(e) => {
                warn!(
                    "OrderPipeline: No reference price for {} ({}), rejecting",
                    intent.symbol, e
                );
                return PlaceOrderResult::rejected(
                    client_order_id.to_string(),
                    e.kind(),
                    None,
                    format!("no reference price: {}", e),
                );
            }
        };
        let decision = self.risk.evaluate(intent, ref_price).await;
        if !decision.allowed {
            self.audit.record(
                client_order_id,
                AuditEvent::Rejected {
                    kind: "risk_denied".to_string(),
                    reason: decision.reason.clone(),
                },
            );
            return PlaceOrderResult::rejected(
                client_order_id.to_string(),
                "risk_denied",
                decision.gate.clone(),
                decision.reason.clone(),
            );
        }

        // Stage 3: submit. Rate limiting and breaker checks live in the REST
        // client; the paper backend bypasses the exchange entirely.
        let dry_run = self.dry_run();
        let api: &Arc<dyn OrderApi> = if dry_run { &self.paper_api } else { &self.live_api };

        self.audit.record(
            client_order_id,
            AuditEvent::Submitted {
                symbol: intent.symbol.clone(),
                side: intent.side.to_string(),
                amount: intent.amount.to_string(),
                dry_run,
            },
        );

        let ack = match api.submit_order(intent, client_order_id, None).await {
            Ok(ack) => ack,
            Err(e) => {
                self.audit.record(
                    client_order_id,
                    AuditEvent::Rejected {
                        kind: e.kind().to_string(),
                        reason: e.to_string(),
                    },
                );
                if matches!(e, ApiError::Transport { .. } | ApiError::Timeout { .. }) {
                    self.park_dead_letter(intent, client_order_id, &e);
                }
                return PlaceOrderResult::rejected(
                    client_order_id.to_string(),
                    e.kind(),
                    None,
                    e.to_string(),
                );
            }
        };

        // Stage 4: record.
        self.audit.record(
            client_order_id,
            AuditEvent::Accepted {
                exchange_id: ack.exchange_id,
            },
        );
        self.risk
            .record_trade(&intent.symbol, Utc::now(), ack.exchange_id);

        // Stage 5: bracket linkage.
        let mut result =
            PlaceOrderResult::accepted(client_order_id.to_string(), ack.exchange_id, dry_run);
        if let Some(spec) = &intent.bracket {
            if dry_run {
                info!("OrderPipeline: Dry-run, skipping bracket legs for {}", client_order_id);
            } else {
                match self.brackets.create_group(&ack, intent, spec).await {
                    Ok(group_id) => result.group_id = Some(group_id),
                    Err(e) => {
                        warn!(
                            "OrderPipeline: Bracket linkage failed for {} ({}); entry stays live",
                            client_order_id, e
                        );
                        result.reason = Some(format!("bracket legs rejected: {}", e));
                    }
                }
            }
        }
        result
    }

    fn validate(&self, intent: &OrderIntent) -> Result<(), String> {
        // An empty registry means the exchange config was unreachable at
        // start; conservative defaults keep the pipeline usable until the
        // refresh job fills it in.
        let info = match self.registry.get(&intent.symbol) {
            Some(info) => info,
            None if self.registry.is_empty() => SymbolRegistry::default_info(&intent.symbol),
            None => return Err(format!("unknown symbol {}", intent.symbol)),
        };
        if !info.tradable {
            return Err(format!("symbol {} is not tradable", intent.symbol));
        }
        if intent.amount <= Decimal::ZERO {
            return Err("amount must be positive".to_string());
        }
        if !info.is_valid_amount(intent.amount) {
            return Err(format!(
                "amount {} violates min {} / step {} for {}",
                intent.amount, info.min_order_size, info.amount_step, intent.symbol
            ));
        }
        if intent.order_type.requires_price() {
            match intent.price {
                Some(price) if price > Decimal::ZERO => {}
                _ => {
                    return Err(format!(
                        "{} order requires a positive price",
                        intent.order_type
                    ))
                }
            }
        }
        if let Some(spec) = &intent.bracket {
            if spec.sl_price <= Decimal::ZERO || spec.tp_price <= Decimal::ZERO {
                return Err("bracket SL/TP prices must be positive".to_string());
            }
        }
        // post_only on market orders is ignored at the wire layer, not an
        // error; nothing to check here.
        Ok(())
    }

    async fn reference_price(&self, intent: &OrderIntent) -> Result<Decimal, ApiError> {
        if intent.order_type != OrderType::ExchangeMarket {
            if let Some(price) = intent.price {
                return Ok(price);
            }
        }
        let response = self.facade.get_ticker(&intent.symbol).await?;
        Ok(response.payload.last_price)
    }

    fn park_dead_letter(&self, intent: &OrderIntent, client_order_id: &str, error: &ApiError) {
        warn!(
            "OrderPipeline: Parking {} in the dead-letter queue after transport failure",
            client_order_id
        );
        self.metrics
            .dead_letter_total
            .with_label_values(&[&intent.symbol])
            .inc();
        self.audit.record(
            client_order_id,
            AuditEvent::DeadLettered {
                attempts: 1,
                reason: error.to_string(),
            },
        );
        self.dead_letters
            .lock()
            .expect("dead letter lock poisoned")
            .push(DeadLetter {
                client_order_id: client_order_id.to_string(),
                symbol: intent.symbol.clone(),
                reason: error.to_string(),
                ts_ms: Utc::now().timestamp_millis(),
            });
    }

    /// Cancel pass-through used by the core API.
    pub async fn cancel(&self, scope: CancelScope) -> Result<(), ApiError> {
        let api: &Arc<dyn OrderApi> = if self.dry_run() {
            &self.paper_api
        } else {
            &self.live_api
        };
        api.cancel(scope).await
    }
}
