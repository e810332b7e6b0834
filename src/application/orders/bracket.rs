//! Bracket groups: one entry order plus a stop-loss and take-profit linked
//! under an exchange group id, enforced OCO.
//!
//! Every state change is snapshotted write-then-rename; startup reconciles
//! the snapshot against the exchange's active orders so a crashed process
//! never leaves an orphaned exit leg live.

use crate::domain::errors::ApiError;
use crate::domain::ports::{CancelScope, OrderApi};
use crate::domain::symbol::SymbolRegistry;
use crate::domain::types::{
    BracketSpec, OrderAck, OrderIntent, OrderRecord, OrderSide, OrderStatus, OrderType,
};
use crate::infrastructure::persistence::audit_log::{AuditEvent, AuditLog};
use crate::infrastructure::persistence::snapshot::SnapshotStore;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BracketState {
    /// Entry submitted, not yet filled; exits are live.
    Pending,
    /// Entry filled; exits armed.
    Active,
    /// One exit filled, the other cancelled.
    Closed,
    /// Entry cancelled or group abandoned.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketGroup {
    pub group_id: i64,
    pub symbol: String,
    pub entry_id: i64,
    pub entry_client_id: String,
    pub side: OrderSide,
    pub entry_amount: Decimal,
    pub filled_amount: Decimal,
    pub sl_id: Option<i64>,
    pub tp_id: Option<i64>,
    pub sl_price: Decimal,
    pub tp_price: Decimal,
    pub state: BracketState,
}

pub struct BracketManager {
    groups: Mutex<HashMap<i64, BracketGroup>>,
    store: SnapshotStore,
    api: Arc<dyn OrderApi>,
    registry: Arc<SymbolRegistry>,
    audit: Arc<AuditLog>,
    next_gid: AtomicI64,
}

impl BracketManager {
    pub fn new(
        store: SnapshotStore,
        api: Arc<dyn OrderApi>,
        registry: Arc<SymbolRegistry>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            store,
            api,
            registry,
            audit,
            next_gid: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Load the snapshot and cancel any leg whose group lost its entry while
    /// the process was down.
    pub async fn restore_and_reconcile(&self) -> anyhow::Result<()> {
        let loaded: Option<HashMap<i64, BracketGroup>> = self.store.load()?;
        if let Some(groups) = loaded {
            info!("BracketManager: Restored {} group(s) from snapshot", groups.len());
            *self.groups.lock().await = groups;
        }
        self.reconcile().await;
        Ok(())
    }

    fn exit_side(entry_side: OrderSide) -> OrderSide {
        match entry_side {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Submit the SL and TP legs for an accepted entry under one group id.
    /// If either leg is rejected the sibling is cancelled so the group never
    /// half-exists on the exchange.
    pub async fn create_group(
        &self,
        entry: &OrderAck,
        intent: &OrderIntent,
        spec: &BracketSpec,
    ) -> Result<i64, ApiError> {
        let group_id = self.next_gid.fetch_add(1, Ordering::SeqCst);
        let exit_side = Self::exit_side(intent.side);

        let sl_intent = OrderIntent {
            client_order_id: Some(format!("{}-sl", entry.client_order_id)),
            symbol: intent.symbol.clone(),
            side: exit_side,
            order_type: OrderType::ExchangeStop,
            amount: intent.amount,
            price: Some(spec.sl_price),
            flags: crate::domain::types::OrderFlags {
                reduce_only: spec.reduce_only_exits,
                post_only: false,
            },
            bracket: None,
        };
        let tp_intent = OrderIntent {
            client_order_id: Some(format!("{}-tp", entry.client_order_id)),
            symbol: intent.symbol.clone(),
            side: exit_side,
            order_type: OrderType::ExchangeLimit,
            amount: intent.amount,
            price: Some(spec.tp_price),
            flags: crate::domain::types::OrderFlags {
                reduce_only: spec.reduce_only_exits,
                post_only: spec.post_only,
            },
            bracket: None,
        };

        let sl_ack = self
            .api
            .submit_order(
                &sl_intent,
                sl_intent.client_order_id.as_deref().unwrap_or_default(),
                Some(group_id),
            )
            .await?;

        let tp_ack = match self
            .api
            .submit_order(
                &tp_intent,
                tp_intent.client_order_id.as_deref().unwrap_or_default(),
                Some(group_id),
            )
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!(
                    "BracketManager: TP leg rejected ({}), cancelling SL {}",
                    e, sl_ack.exchange_id
                );
                if let Err(cancel_err) =
                    self.api.cancel(CancelScope::ById(sl_ack.exchange_id)).await
                {
                    error!(
                        "BracketManager: Failed to cancel orphaned SL {}: {}",
                        sl_ack.exchange_id, cancel_err
                    );
                }
                return Err(e);
            }
        };

        let group = BracketGroup {
            group_id,
            symbol: intent.symbol.clone(),
            entry_id: entry.exchange_id,
            entry_client_id: entry.client_order_id.clone(),
            side: intent.side,
            entry_amount: intent.amount,
            filled_amount: Decimal::ZERO,
            sl_id: Some(sl_ack.exchange_id),
            tp_id: Some(tp_ack.exchange_id),
            sl_price: spec.sl_price,
            tp_price: spec.tp_price,
            state: BracketState::Pending,
        };

        self.audit.record(
            &entry.client_order_id,
            AuditEvent::BracketLinked {
                group_id,
                sl_id: sl_ack.exchange_id,
                tp_id: tp_ack.exchange_id,
            },
        );

        let mut groups = self.groups.lock().await;
        groups.insert(group_id, group);
        self.snapshot_locked(&groups);
        info!(
            "BracketManager: Group {} linked (entry={}, sl={}, tp={})",
            group_id, entry.exchange_id, sl_ack.exchange_id, tp_ack.exchange_id
        );
        Ok(group_id)
    }

    /// Apply an order lifecycle event from the auth stream.
    pub async fn on_order_event(&self, record: &OrderRecord) {
        let mut groups = self.groups.lock().await;
        let Some(group_id) = groups
            .values()
            .find(|g| {
                g.entry_id == record.exchange_id
                    || g.sl_id == Some(record.exchange_id)
                    || g.tp_id == Some(record.exchange_id)
            })
            .map(|g| g.group_id)
        else {
            return;
        };
        let Some(mut group) = groups.get(&group_id).cloned() else {
            return;
        };

        if record.exchange_id == group.entry_id {
            match record.status {
                OrderStatus::Executed => {
                    group.filled_amount = group.entry_amount;
                    group.state = BracketState::Active;
                    info!("BracketManager: Group {} entry filled, exits armed", group_id);
                }
                OrderStatus::PartiallyFilled => {
                    let filled = record.filled_amount().abs();
                    if filled > group.filled_amount {
                        group.filled_amount = filled;
                        self.resize_exits(&mut group).await;
                    }
                }
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    // Entry is gone; exits must not outlive it unless some
                    // fill already happened.
                    if group.filled_amount.is_zero() {
                        self.cancel_leg(group.sl_id).await;
                        self.cancel_leg(group.tp_id).await;
                        group.state = BracketState::Cancelled;
                        self.audit.record(
                            &group.entry_client_id,
                            AuditEvent::BracketClosed {
                                group_id,
                                reason: "entry_cancelled".to_string(),
                            },
                        );
                    }
                }
                _ => {}
            }
        } else {
            // One of the exit legs changed: OCO semantics.
            let is_sl = group.sl_id == Some(record.exchange_id);
            match record.status {
                OrderStatus::Executed => {
                    let other = if is_sl { group.tp_id } else { group.sl_id };
                    self.cancel_leg(other).await;
                    group.state = BracketState::Closed;
                    self.audit.record(
                        &group.entry_client_id,
                        AuditEvent::BracketClosed {
                            group_id,
                            reason: if is_sl {
                                "stop_loss_filled".to_string()
                            } else {
                                "take_profit_filled".to_string()
                            },
                        },
                    );
                    info!(
                        "BracketManager: Group {} closed by {}",
                        group_id,
                        if is_sl { "SL" } else { "TP" }
                    );
                }
                OrderStatus::Cancelled => {
                    if is_sl {
                        group.sl_id = None;
                    } else {
                        group.tp_id = None;
                    }
                }
                _ => {}
            }
        }

        groups.insert(group_id, group);
        self.snapshot_locked(&groups);
    }

    /// Resize both exits to the filled entry amount, honoring the pair's
    /// minimum step. An amount that rounds to zero abandons the exits.
    async fn resize_exits(&self, group: &mut BracketGroup) {
        let info = self
            .registry
            .get(&group.symbol)
            .unwrap_or_else(|| SymbolRegistry::default_info(&group.symbol));
        let target = info.round_amount_down(group.filled_amount);

        if target.is_zero() {
            warn!(
                "BracketManager: Group {} fill {} rounds below min step, abandoning exits",
                group.group_id, group.filled_amount
            );
            self.cancel_leg(group.sl_id).await;
            self.cancel_leg(group.tp_id).await;
            group.state = BracketState::Cancelled;
            self.audit.record(
                &group.entry_client_id,
                AuditEvent::BracketClosed {
                    group_id: group.group_id,
                    reason: "resize_below_min".to_string(),
                },
            );
            return;
        }

        // Exit legs carry the opposite sign of the entry.
        let signed = match Self::exit_side(group.side) {
            OrderSide::Buy => target,
            OrderSide::Sell => -target,
        };
        for leg in [group.sl_id, group.tp_id].into_iter().flatten() {
            if let Err(e) = self.api.update_order(leg, signed).await {
                warn!(
                    "BracketManager: Failed to resize leg {} of group {}: {}",
                    leg, group.group_id, e
                );
            }
        }
        self.audit.record(
            &group.entry_client_id,
            AuditEvent::BracketResized {
                group_id: group.group_id,
                new_amount: target.to_string(),
            },
        );
    }

    async fn cancel_leg(&self, leg: Option<i64>) {
        if let Some(id) = leg {
            if let Err(e) = self.api.cancel(CancelScope::ById(id)).await {
                warn!("BracketManager: Failed to cancel leg {}: {}", id, e);
            }
        }
    }

    /// Periodic reconcile against the exchange's active orders: cancel legs
    /// whose group lost its entry, finish closed groups, drop terminal ones.
    pub async fn reconcile(&self) {
        let active = match self.api.active_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("BracketManager: Reconcile skipped, active orders failed: {}", e);
                return;
            }
        };
        let active_ids: std::collections::HashSet<i64> =
            active.iter().map(|o| o.exchange_id).collect();

        let mut groups = self.groups.lock().await;
        let ids: Vec<i64> = groups.keys().copied().collect();
        for group_id in ids {
            let Some(mut group) = groups.get(&group_id).cloned() else {
                continue;
            };
            match group.state {
                BracketState::Closed | BracketState::Cancelled => {
                    groups.remove(&group_id);
                    continue;
                }
                BracketState::Pending | BracketState::Active => {}
            }

            let entry_live = active_ids.contains(&group.entry_id);
            let sl_live = group.sl_id.map(|id| active_ids.contains(&id)).unwrap_or(false);
            let tp_live = group.tp_id.map(|id| active_ids.contains(&id)).unwrap_or(false);

            if group.state == BracketState::Pending
                && !entry_live
                && group.filled_amount.is_zero()
                && (sl_live || tp_live)
            {
                warn!(
                    "BracketManager: Group {} entry gone without fill, cancelling orphaned legs",
                    group_id
                );
                if sl_live {
                    self.cancel_leg(group.sl_id).await;
                }
                if tp_live {
                    self.cancel_leg(group.tp_id).await;
                }
                group.state = BracketState::Cancelled;
                self.audit.record(
                    &group.entry_client_id,
                    AuditEvent::BracketClosed {
                        group_id,
                        reason: "reconcile_orphan".to_string(),
                    },
                );
                groups.insert(group_id, group);
                continue;
            }

            // OCO holds across restarts: one leg gone while the other is
            // still live and the entry is no longer active means the filled
            // leg's sibling must go.
            if group.state == BracketState::Active && sl_live != tp_live && !entry_live {
                let survivor = if sl_live { group.sl_id } else { group.tp_id };
                info!(
                    "BracketManager: Group {} has a lone surviving leg, cancelling {:?}",
                    group_id, survivor
                );
                self.cancel_leg(survivor).await;
                group.state = BracketState::Closed;
                self.audit.record(
                    &group.entry_client_id,
                    AuditEvent::BracketClosed {
                        group_id,
                        reason: "reconcile_oco".to_string(),
                    },
                );
                groups.insert(group_id, group);
            }
        }
        self.snapshot_locked(&groups);
    }

    pub async fn group(&self, group_id: i64) -> Option<BracketGroup> {
        self.groups.lock().await.get(&group_id).cloned()
    }

    pub async fn open_groups(&self) -> Vec<BracketGroup> {
        self.groups.lock().await.values().cloned().collect()
    }

    /// Force a snapshot outside the usual change points (operator control).
    pub async fn force_snapshot(&self) {
        let groups = self.groups.lock().await;
        self.snapshot_locked(&groups);
    }

    fn snapshot_locked(&self, groups: &HashMap<i64, BracketGroup>) {
        if let Err(e) = self.store.save(groups) {
            error!("BracketManager: Snapshot failed: {:#}", e);
        }
    }
}
