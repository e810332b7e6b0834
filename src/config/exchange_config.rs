//! Exchange connectivity configuration: credentials, endpoints, transport
//! budgets and the WebSocket behaviour knobs.

use crate::config::source::ConfigSource;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,
    pub rest_public_url: String,
    pub rest_auth_url: String,
    pub ws_public_url: String,
    pub ws_auth_url: String,

    // Transport budgets
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Hard deadline for a full call including retries.
    pub call_deadline_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,

    // WebSocket behaviour
    pub ws_connect_on_start: bool,
    pub hb_timeout_secs: u64,
    pub max_subs_per_socket: usize,
    pub ws_queue_capacity: usize,
    pub reconnect_base_secs: u64,
    pub reconnect_cap_secs: u64,
    /// Dead-man switch: server cancels open orders when the auth socket drops.
    pub dms_enabled: bool,

    // Persistence paths
    pub nonce_path: String,

    /// Optional override of the endpoint classification table, formatted as
    /// `pattern=CLASS;pattern=CLASS` in match order.
    pub rate_limit_patterns: Option<String>,
}

impl ExchangeConfig {
    pub fn load(source: &ConfigSource) -> Result<Self> {
        Ok(Self {
            api_key: source.get_string("api_key", ""),
            api_secret: source.get_string("api_secret", ""),
            rest_public_url: source
                .get_string("rest_public_url", "https://api-pub.bitfinex.com"),
            rest_auth_url: source.get_string("rest_auth_url", "https://api.bitfinex.com"),
            ws_public_url: source
                .get_string("ws_public_url", "wss://api-pub.bitfinex.com/ws/2"),
            ws_auth_url: source.get_string("ws_auth_url", "wss://api.bitfinex.com/ws/2"),
            connect_timeout_secs: source.parse_u64("connect_timeout_secs", 5)?,
            request_timeout_secs: source.parse_u64("request_timeout_secs", 10)?,
            call_deadline_secs: source.parse_u64("call_deadline_secs", 10)?,
            max_retries: source.parse_u32("max_retries", 3)?,
            retry_base_delay_ms: source.parse_u64("retry_base_delay_ms", 500)?,
            ws_connect_on_start: source.parse_bool("ws_connect_on_start", true),
            hb_timeout_secs: source.parse_u64("hb_timeout_secs", 15)?,
            max_subs_per_socket: source.parse_usize("max_subs_per_socket", 25)?,
            ws_queue_capacity: source.parse_usize("ws_queue_capacity", 1000)?,
            reconnect_base_secs: source.parse_u64("reconnect_base_secs", 1)?,
            reconnect_cap_secs: source.parse_u64("reconnect_cap_secs", 60)?,
            dms_enabled: source.parse_bool("dms_enabled", false),
            nonce_path: source.get_string("nonce_path", "state/nonce"),
            rate_limit_patterns: source.lookup("rate_limit_patterns"),
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}
