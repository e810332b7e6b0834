use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Static trading metadata for one exchange pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Canonical Bitfinex trading symbol, e.g. `tBTCUSD`.
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub min_order_size: Decimal,
    pub max_order_size: Decimal,
    /// Smallest amount increment accepted for this pair.
    pub amount_step: Decimal,
    pub tradable: bool,
}

impl SymbolInfo {
    /// Round an amount down to the pair's step. Returns zero when the amount
    /// is below one step.
    pub fn round_amount_down(&self, amount: Decimal) -> Decimal {
        if self.amount_step <= Decimal::ZERO {
            return amount;
        }
        let steps = (amount / self.amount_step).floor();
        steps * self.amount_step
    }

    pub fn is_valid_amount(&self, amount: Decimal) -> bool {
        if amount < self.min_order_size {
            return false;
        }
        if self.max_order_size > Decimal::ZERO && amount > self.max_order_size {
            return false;
        }
        if self.amount_step > Decimal::ZERO {
            let remainder = amount % self.amount_step;
            return remainder.is_zero();
        }
        true
    }
}

/// Pair `tBTCUSD` → (`BTC`, `USD`). Handles colon-separated long bases
/// such as `tDOGE:USD`.
pub fn split_pair(symbol: &str) -> (String, String) {
    let body = symbol.strip_prefix('t').unwrap_or(symbol);
    if let Some((base, quote)) = body.split_once(':') {
        return (base.to_string(), quote.to_string());
    }
    if body.len() >= 6 {
        let (base, quote) = body.split_at(body.len() - 3);
        return (base.to_string(), quote.to_string());
    }
    (body.to_string(), String::new())
}

/// In-memory registry of tradable symbols, loaded from the exchange pair
/// config at startup and refreshed periodically by the scheduler.
pub struct SymbolRegistry {
    symbols: RwLock<HashMap<String, SymbolInfo>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the registry contents with a freshly fetched set.
    pub fn replace_all(&self, infos: Vec<SymbolInfo>) {
        let mut map = self.symbols.write().expect("symbol registry lock poisoned");
        map.clear();
        for info in infos {
            map.insert(info.symbol.clone(), info);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolInfo> {
        self.symbols
            .read()
            .expect("symbol registry lock poisoned")
            .get(symbol)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.symbols
            .read()
            .expect("symbol registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fallback metadata for a pair the exchange config did not list.
    /// Conservative defaults keep validation meaningful before first refresh.
    pub fn default_info(symbol: &str) -> SymbolInfo {
        let (base, quote) = split_pair(symbol);
        SymbolInfo {
            symbol: symbol.to_string(),
            base,
            quote,
            min_order_size: dec!(0.00001),
            max_order_size: Decimal::ZERO,
            amount_step: dec!(0.00000001),
            tradable: true,
        }
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_info() -> SymbolInfo {
        SymbolInfo {
            symbol: "tBTCUSD".into(),
            base: "BTC".into(),
            quote: "USD".into(),
            min_order_size: dec!(0.0001),
            max_order_size: dec!(2000),
            amount_step: dec!(0.0001),
            tradable: true,
        }
    }

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("tBTCUSD"), ("BTC".into(), "USD".into()));
        assert_eq!(split_pair("tDOGE:USD"), ("DOGE".into(), "USD".into()));
    }

    #[test]
    fn test_amount_validation() {
        let info = btc_info();
        assert!(info.is_valid_amount(dec!(0.0001)));
        assert!(info.is_valid_amount(dec!(0.0003)));
        assert!(!info.is_valid_amount(dec!(0.00005)), "below min size");
        assert!(!info.is_valid_amount(dec!(0.00015)), "off step");
        assert!(!info.is_valid_amount(dec!(3000)), "above max size");
    }

    #[test]
    fn test_round_amount_down() {
        let info = btc_info();
        assert_eq!(info.round_amount_down(dec!(0.00037)), dec!(0.0003));
        assert_eq!(info.round_amount_down(dec!(0.00009)), dec!(0.0000));
    }

    #[test]
    fn test_registry_replace_and_get() {
        let registry = SymbolRegistry::new();
        assert!(registry.is_empty());
        registry.replace_all(vec![btc_info()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("tBTCUSD").is_some());
        assert!(registry.get("tETHUSD").is_none());
    }
}
