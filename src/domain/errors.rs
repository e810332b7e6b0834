use thiserror::Error;

/// Closed error taxonomy for the exchange-facing core.
///
/// Every outbound call and every pipeline stage collapses into one of these
/// kinds; callers never see raw transport errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("risk gate '{gate}' denied order: {reason}")]
    RiskDenied { gate: String, reason: String },

    #[error("rate limited{}", retry_after_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("transport error on {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    #[error("exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("deadline exceeded after {elapsed_ms}ms on {endpoint}")]
    Timeout { endpoint: String, elapsed_ms: u64 },

    #[error("circuit breaker '{name}' is open, retry in {retry_in_secs}s")]
    CircuitOpen { name: String, retry_in_secs: u64 },

    #[error("shutting down")]
    ShuttingDown,
}

fn retry_after_hint(secs: &Option<u64>) -> String {
    match secs {
        Some(s) => format!(" (retry after {}s)", s),
        None => String::new(),
    }
}

/// Bitfinex error code for a nonce the server considers too small.
pub const BFX_NONCE_TOO_SMALL: i64 = 10114;

/// Exchange error codes that are safe to retry (platform maintenance and
/// transient internal states). Everything else is fatal for the attempt.
const RETRYABLE_EXCHANGE_CODES: &[i64] = &[11000, 20060, 20061];

impl ApiError {
    /// Whether the REST retry loop may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } => true,
            ApiError::Transport { .. } => true,
            ApiError::Timeout { .. } => true,
            ApiError::Exchange { code, .. } => RETRYABLE_EXCHANGE_CODES.contains(code),
            _ => false,
        }
    }

    /// Whether this error counts as a failure against the transport breaker.
    /// Client-side errors (4xx, validation, risk) never trip it.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::Transport { .. } | ApiError::Timeout { .. }
        )
    }

    pub fn is_nonce_too_small(&self) -> bool {
        matches!(self, ApiError::Exchange { code, .. } if *code == BFX_NONCE_TOO_SMALL)
    }

    /// Short machine-readable kind, used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "validation_error",
            ApiError::RiskDenied { .. } => "risk_denied",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Transport { .. } => "transport_error",
            ApiError::Auth { .. } => "auth_error",
            ApiError::Exchange { .. } => "exchange_error",
            ApiError::Timeout { .. } => "timeout",
            ApiError::CircuitOpen { .. } => "circuit_open",
            ApiError::ShuttingDown => "shutting_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ApiError::RateLimited {
            retry_after_secs: Some(2)
        }
        .is_retryable());
        assert!(ApiError::Transport {
            endpoint: "ticker".into(),
            reason: "connection reset".into()
        }
        .is_retryable());
        assert!(ApiError::Exchange {
            code: 11000,
            message: "not ready".into()
        }
        .is_retryable());
        assert!(!ApiError::Exchange {
            code: 10100,
            message: "apikey: invalid".into()
        }
        .is_retryable());
        assert!(!ApiError::Validation {
            reason: "bad amount".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_breaker_classification() {
        assert!(ApiError::Timeout {
            endpoint: "wallets".into(),
            elapsed_ms: 10_000
        }
        .trips_breaker());
        assert!(!ApiError::Exchange {
            code: 10001,
            message: "symbol: invalid".into()
        }
        .trips_breaker());
        assert!(!ApiError::Auth {
            reason: "bad signature".into()
        }
        .trips_breaker());
    }

    #[test]
    fn test_nonce_too_small_detection() {
        let err = ApiError::Exchange {
            code: BFX_NONCE_TOO_SMALL,
            message: "nonce: small".into(),
        };
        assert!(err.is_nonce_too_small());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limited_message_includes_hint() {
        let msg = ApiError::RateLimited {
            retry_after_secs: Some(2),
        }
        .to_string();
        assert!(msg.contains("retry after 2s"));
    }
}
