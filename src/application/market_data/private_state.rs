//! Account-state caches fed by the authenticated stream: orders, positions
//! and wallets, each mutated atomically per event.

use crate::domain::types::{OrderRecord, Position, Wallet, WalletType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

pub struct PrivateState {
    orders: RwLock<HashMap<i64, OrderRecord>>,
    positions: RwLock<HashMap<String, Position>>,
    wallets: RwLock<HashMap<(WalletType, String), Wallet>>,
    /// Whether the dead-man switch was acknowledged on the current session.
    dms_active: AtomicBool,
    auth_connected: AtomicBool,
}

impl PrivateState {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            wallets: RwLock::new(HashMap::new()),
            dms_active: AtomicBool::new(false),
            auth_connected: AtomicBool::new(false),
        }
    }

    pub fn apply_order(&self, order: OrderRecord) {
        let mut map = self.orders.write().expect("order cache lock poisoned");
        if order.is_terminal() {
            map.remove(&order.exchange_id);
        } else {
            map.insert(order.exchange_id, order);
        }
    }

    pub fn replace_orders(&self, orders: Vec<OrderRecord>) {
        let mut map = self.orders.write().expect("order cache lock poisoned");
        map.clear();
        for order in orders {
            if !order.is_terminal() {
                map.insert(order.exchange_id, order);
            }
        }
    }

    pub fn open_orders(&self) -> Vec<OrderRecord> {
        self.orders
            .read()
            .expect("order cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn apply_position(&self, position: Position, closed: bool) {
        let mut map = self.positions.write().expect("position cache lock poisoned");
        if closed || position.amount.is_zero() {
            map.remove(&position.symbol);
        } else {
            map.insert(position.symbol.clone(), position);
        }
    }

    pub fn replace_positions(&self, positions: Vec<Position>) {
        let mut map = self.positions.write().expect("position cache lock poisoned");
        map.clear();
        for position in positions {
            if !position.amount.is_zero() {
                map.insert(position.symbol.clone(), position);
            }
        }
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .expect("position cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn apply_wallet(&self, wallet: Wallet) {
        let mut map = self.wallets.write().expect("wallet cache lock poisoned");
        map.insert((wallet.wallet_type, wallet.currency.clone()), wallet);
    }

    pub fn replace_wallets(&self, wallets: Vec<Wallet>) {
        let mut map = self.wallets.write().expect("wallet cache lock poisoned");
        map.clear();
        for wallet in wallets {
            map.insert((wallet.wallet_type, wallet.currency.clone()), wallet);
        }
    }

    pub fn wallets(&self) -> Vec<Wallet> {
        self.wallets
            .read()
            .expect("wallet cache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn set_dms_active(&self, active: bool) {
        self.dms_active.store(active, Ordering::SeqCst);
    }

    pub fn dms_active(&self) -> bool {
        self.dms_active.load(Ordering::SeqCst)
    }

    pub fn set_auth_connected(&self, connected: bool) {
        self.auth_connected.store(connected, Ordering::SeqCst);
    }

    pub fn auth_connected(&self) -> bool {
        self.auth_connected.load(Ordering::SeqCst)
    }
}

impl Default for PrivateState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::OrderStatus;
    use rust_decimal_macros::dec;

    fn order(id: i64, status: OrderStatus) -> OrderRecord {
        OrderRecord {
            exchange_id: id,
            client_order_id: None,
            symbol: "tBTCUSD".into(),
            order_type: "EXCHANGE LIMIT".into(),
            status,
            amount_orig: dec!(1),
            amount_remaining: dec!(1),
            price: dec!(30000),
            avg_fill_price: dec!(0),
            group_id: None,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn test_terminal_order_removed() {
        let state = PrivateState::new();
        state.apply_order(order(1, OrderStatus::Active));
        assert_eq!(state.open_orders().len(), 1);
        state.apply_order(order(1, OrderStatus::Executed));
        assert!(state.open_orders().is_empty());
    }

    #[test]
    fn test_position_removed_when_flat() {
        let state = PrivateState::new();
        let position = Position {
            symbol: "tBTCUSD".into(),
            amount: dec!(0.5),
            base_price: dec!(30000),
            unrealized_pnl: dec!(0),
        };
        state.apply_position(position.clone(), false);
        assert_eq!(state.positions().len(), 1);

        let flat = Position {
            amount: dec!(0),
            ..position
        };
        state.apply_position(flat, false);
        assert!(state.positions().is_empty());
    }

    #[test]
    fn test_wallets_keyed_by_type_and_currency() {
        let state = PrivateState::new();
        state.apply_wallet(Wallet {
            wallet_type: WalletType::Exchange,
            currency: "USD".into(),
            balance: dec!(1000),
            available: None,
        });
        state.apply_wallet(Wallet {
            wallet_type: WalletType::Margin,
            currency: "USD".into(),
            balance: dec!(500),
            available: None,
        });
        assert_eq!(state.wallets().len(), 2);
    }
}
