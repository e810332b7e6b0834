use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Read-through configuration source with precedence
/// [runtime overrides > environment > file defaults].
///
/// File defaults come from an optional TOML file whose tables are flattened
/// to dotted keys (`risk.max_trades_per_day` and plain `max_trades_per_day`
/// both resolve). Environment lookup uses the upper-cased key.
#[derive(Clone)]
pub struct ConfigSource {
    file_defaults: Arc<HashMap<String, String>>,
    runtime: Arc<RwLock<HashMap<String, String>>>,
}

impl ConfigSource {
    pub fn new() -> Self {
        Self {
            file_defaults: Arc::new(HashMap::new()),
            runtime: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let value: toml::Value = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let mut flat = HashMap::new();
        flatten_toml("", &value, &mut flat);
        info!(
            "ConfigSource: Loaded {} default(s) from {}",
            flat.len(),
            path.display()
        );

        Ok(Self {
            file_defaults: Arc::new(flat),
            runtime: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Resolve a key through the precedence chain.
    pub fn lookup(&self, key: &str) -> Option<String> {
        if let Some(v) = self
            .runtime
            .read()
            .expect("config override lock poisoned")
            .get(key)
        {
            return Some(v.clone());
        }
        if let Ok(v) = std::env::var(key.to_uppercase()) {
            return Some(v);
        }
        if let Some(v) = self.file_defaults.get(key) {
            return Some(v.clone());
        }
        // Allow dotted file keys to satisfy bare lookups (last segment match).
        self.file_defaults
            .iter()
            .find(|(k, _)| k.rsplit('.').next() == Some(key))
            .map(|(_, v)| v.clone())
    }

    /// Set or clear a runtime override; highest precedence until cleared.
    pub fn set_override(&self, key: &str, value: Option<String>) {
        let mut map = self.runtime.write().expect("config override lock poisoned");
        match value {
            Some(v) => {
                info!("ConfigSource: Runtime override {} = {}", key, v);
                map.insert(key.to_string(), v);
            }
            None => {
                info!("ConfigSource: Cleared runtime override {}", key);
                map.remove(key);
            }
        }
    }

    // Typed helpers with defaults, shared by the sub-config constructors.

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.lookup(key).unwrap_or_else(|| default.to_string())
    }

    pub fn require_string(&self, key: &str) -> Result<String> {
        self.lookup(key)
            .with_context(|| format!("Missing required config key: {}", key))
    }

    pub fn parse_f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.lookup(key) {
            Some(v) => v
                .parse::<f64>()
                .with_context(|| format!("Failed to parse {} as f64: '{}'", key, v)),
            None => Ok(default),
        }
    }

    pub fn parse_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.lookup(key) {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("Failed to parse {} as u64: '{}'", key, v)),
            None => Ok(default),
        }
    }

    pub fn parse_u32(&self, key: &str, default: u32) -> Result<u32> {
        match self.lookup(key) {
            Some(v) => v
                .parse::<u32>()
                .with_context(|| format!("Failed to parse {} as u32: '{}'", key, v)),
            None => Ok(default),
        }
    }

    pub fn parse_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.lookup(key) {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("Failed to parse {} as usize: '{}'", key, v)),
            None => Ok(default),
        }
    }

    pub fn parse_bool(&self, key: &str, default: bool) -> bool {
        match self.lookup(key) {
            Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }
}

impl Default for ConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten_toml(prefix: &str, value: &toml::Value, out: &mut HashMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten_toml(&key, v, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_override_beats_default() {
        let source = ConfigSource::new();
        assert_eq!(source.get_string("trade_mode", "live"), "live");
        source.set_override("trade_mode", Some("paper".into()));
        assert_eq!(source.get_string("trade_mode", "live"), "paper");
        source.set_override("trade_mode", None);
        assert_eq!(source.get_string("trade_mode", "live"), "live");
    }

    #[test]
    fn test_parse_helpers_defaults() {
        let source = ConfigSource::new();
        assert_eq!(source.parse_f64("no_such_key", 0.25).unwrap(), 0.25);
        assert_eq!(source.parse_u64("no_such_key", 7).unwrap(), 7);
        assert!(!source.parse_bool("no_such_key", false));
    }

    #[test]
    fn test_parse_bool_accepts_common_forms() {
        let source = ConfigSource::new();
        source.set_override("flag", Some("YES".into()));
        assert!(source.parse_bool("flag", false));
        source.set_override("flag", Some("0".into()));
        assert!(!source.parse_bool("flag", true));
    }

    #[test]
    fn test_file_defaults_flattening() {
        let dir = std::env::temp_dir().join("bfxtrader-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("defaults.toml");
        std::fs::write(
            &path,
            "ws_ticker_stale_secs = 20\n[risk]\nmax_trades_per_day = 12\n",
        )
        .unwrap();

        let source = ConfigSource::with_file(&path).unwrap();
        assert_eq!(source.lookup("ws_ticker_stale_secs").as_deref(), Some("20"));
        assert_eq!(
            source.lookup("risk.max_trades_per_day").as_deref(),
            Some("12")
        );
        // Bare key resolves through the dotted entry.
        assert_eq!(source.lookup("max_trades_per_day").as_deref(), Some("12"));
    }
}
