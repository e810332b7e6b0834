//! Append-only audit trail of order lifecycle events.

use crate::infrastructure::persistence::snapshot::JsonlAppender;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Submitted {
        symbol: String,
        side: String,
        amount: String,
        dry_run: bool,
    },
    Accepted {
        exchange_id: i64,
    },
    Rejected {
        kind: String,
        reason: String,
    },
    DeadLettered {
        attempts: u32,
        reason: String,
    },
    BracketLinked {
        group_id: i64,
        sl_id: i64,
        tp_id: i64,
    },
    BracketResized {
        group_id: i64,
        new_amount: String,
    },
    BracketClosed {
        group_id: i64,
        reason: String,
    },
    Cancelled {
        exchange_id: i64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts_ms: i64,
    pub client_order_id: String,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Append-only order audit log. Failures to write are logged and swallowed:
/// auditing must never take down the trading path.
pub struct AuditLog {
    appender: JsonlAppender,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            appender: JsonlAppender::new(path),
        }
    }

    pub fn record(&self, client_order_id: &str, event: AuditEvent) {
        let record = AuditRecord {
            ts_ms: Utc::now().timestamp_millis(),
            client_order_id: client_order_id.to_string(),
            event,
        };
        if let Err(e) = self.appender.append(&record) {
            error!("AuditLog: Failed to append record: {:#}", e);
        }
    }
}

/// One point of the equity time-series written by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquityPoint {
    pub ts_ms: i64,
    pub equity_usd: f64,
}

pub struct EquityLog {
    appender: JsonlAppender,
}

impl EquityLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            appender: JsonlAppender::new(path),
        }
    }

    pub fn record(&self, equity_usd: f64) -> Result<()> {
        self.appender.append(&EquityPoint {
            ts_ms: Utc::now().timestamp_millis(),
            equity_usd,
        })
    }
}
