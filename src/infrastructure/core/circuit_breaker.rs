//! Registry of named circuit breakers protecting the exchange-facing call
//! paths. The transport layer reports outcomes here instead of owning its
//! own breaker state; every state change is published as a typed event.

use crate::domain::errors::ApiError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Well-known breaker names.
pub const TRANSPORT_BREAKER: &str = "transport";
pub const TRADING_BREAKER: &str = "trading";
pub const RISK_BREAKER: &str = "risk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    /// Failures within `fail_window` before the breaker opens.
    pub fail_threshold: usize,
    pub fail_window: Duration,
    pub cooldown: Duration,
    /// Ceiling for the exponentially escalated cooldown on repeated opens.
    pub cooldown_cap: Duration,
}

impl BreakerPolicy {
    pub fn transport() -> Self {
        Self {
            fail_threshold: 5,
            fail_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            cooldown_cap: Duration::from_secs(900),
        }
    }

    pub fn trading() -> Self {
        Self {
            fail_threshold: 3,
            fail_window: Duration::from_secs(120),
            cooldown: Duration::from_secs(300),
            cooldown_cap: Duration::from_secs(3600),
        }
    }

    pub fn risk() -> Self {
        Self {
            fail_threshold: 3,
            fail_window: Duration::from_secs(120),
            cooldown: Duration::from_secs(300),
            cooldown_cap: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BreakerEvent {
    Opened {
        name: String,
        cooldown_secs: u64,
        failure_count: usize,
    },
    HalfOpened {
        name: String,
    },
    Closed {
        name: String,
    },
    Reset {
        name: String,
    },
}

struct BreakerInner {
    state: BreakerState,
    failure_count: usize,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    open_until: Option<Instant>,
    consecutive_opens: u32,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            window_start: None,
            opened_at: None,
            open_until: None,
            consecutive_opens: 0,
            probe_in_flight: false,
        }
    }
}

struct Breaker {
    name: String,
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
}

/// Read-only view of one breaker for the query API and metrics.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: usize,
    pub open_for_secs: Option<u64>,
    pub next_probe_in_secs: Option<u64>,
}

pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<Breaker>>>,
    event_tx: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            breakers: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Create the standard breaker set used by the core.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(TRANSPORT_BREAKER, BreakerPolicy::transport());
        registry.register(TRADING_BREAKER, BreakerPolicy::trading());
        registry.register(RISK_BREAKER, BreakerPolicy::risk());
        registry
    }

    pub fn register(&self, name: &str, policy: BreakerPolicy) {
        let mut map = self.breakers.lock().expect("breaker registry lock poisoned");
        map.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Breaker {
                name: name.to_string(),
                policy,
                inner: Mutex::new(BreakerInner::new()),
            })
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.event_tx.subscribe()
    }

    fn get(&self, name: &str) -> Option<Arc<Breaker>> {
        self.breakers
            .lock()
            .expect("breaker registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Gate an outbound call. Transitions open → half-open when the cooldown
    /// has elapsed; in half-open only a single probe is admitted.
    pub fn check(&self, name: &str) -> Result<(), ApiError> {
        let Some(breaker) = self.get(name) else {
            return Ok(());
        };
        let mut inner = breaker.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let open_until = inner.open_until.unwrap_or_else(Instant::now);
                if Instant::now() >= open_until {
                    info!(
                        "CircuitBreaker [{}]: Open -> HalfOpen (cooldown elapsed)",
                        breaker.name
                    );
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    let _ = self.event_tx.send(BreakerEvent::HalfOpened {
                        name: breaker.name.clone(),
                    });
                    Ok(())
                } else {
                    let retry_in = open_until.saturating_duration_since(Instant::now());
                    Err(ApiError::CircuitOpen {
                        name: breaker.name.clone(),
                        retry_in_secs: retry_in.as_secs().max(1),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ApiError::CircuitOpen {
                        name: breaker.name.clone(),
                        retry_in_secs: 1,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self, name: &str) {
        let Some(breaker) = self.get(name) else {
            return;
        };
        let mut inner = breaker.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                info!(
                    "CircuitBreaker [{}]: HalfOpen -> Closed (probe succeeded)",
                    breaker.name
                );
                *inner = BreakerInner::new();
                let _ = self.event_tx.send(BreakerEvent::Closed {
                    name: breaker.name.clone(),
                });
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
                inner.window_start = None;
            }
            BreakerState::Open => {
                // Late success from a call admitted before the breaker opened.
            }
        }
    }

    /// Record a failure. `min_cooldown` (typically a server `Retry-After`)
    /// is honored when larger than the computed cooldown.
    pub fn record_failure(&self, name: &str, min_cooldown: Option<Duration>) {
        let Some(breaker) = self.get(name) else {
            return;
        };
        let mut inner = breaker.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();

        // Failure counting is windowed; an expired window restarts the count.
        match inner.window_start {
            Some(start) if now.duration_since(start) <= breaker.policy.fail_window => {}
            _ => {
                inner.window_start = Some(now);
                inner.failure_count = 0;
            }
        }
        inner.failure_count += 1;

        match inner.state {
            BreakerState::Closed => {
                if inner.failure_count >= breaker.policy.fail_threshold {
                    self.open_locked(&breaker.name, &breaker.policy, &mut inner, min_cooldown);
                }
            }
            BreakerState::HalfOpen => {
                warn!(
                    "CircuitBreaker [{}]: probe failed, re-opening",
                    breaker.name
                );
                self.open_locked(&breaker.name, &breaker.policy, &mut inner, min_cooldown);
            }
            BreakerState::Open => {
                inner.probe_in_flight = false;
            }
        }
    }

    fn open_locked(
        &self,
        name: &str,
        policy: &BreakerPolicy,
        inner: &mut BreakerInner,
        min_cooldown: Option<Duration>,
    ) {
        let escalation = 2u32.saturating_pow(inner.consecutive_opens.min(8));
        let mut cooldown = policy
            .cooldown
            .saturating_mul(escalation)
            .min(policy.cooldown_cap);
        if let Some(min) = min_cooldown {
            cooldown = cooldown.max(min);
        }

        let now = Instant::now();
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.open_until = Some(now + cooldown);
        inner.consecutive_opens = inner.consecutive_opens.saturating_add(1);
        inner.probe_in_flight = false;

        error!(
            "CircuitBreaker [{}]: OPEN for {}s ({} failures)",
            name,
            cooldown.as_secs(),
            inner.failure_count
        );
        let _ = self.event_tx.send(BreakerEvent::Opened {
            name: name.to_string(),
            cooldown_secs: cooldown.as_secs(),
            failure_count: inner.failure_count,
        });
    }

    /// Manually close one breaker. Returns false when the name is unknown.
    pub fn reset(&self, name: &str) -> bool {
        let Some(breaker) = self.get(name) else {
            return false;
        };
        let mut inner = breaker.inner.lock().expect("breaker lock poisoned");
        *inner = BreakerInner::new();
        info!("CircuitBreaker [{}]: manual reset", breaker.name);
        let _ = self.event_tx.send(BreakerEvent::Reset {
            name: breaker.name.clone(),
        });
        true
    }

    /// Close every breaker (operator force-recovery).
    pub fn force_recovery(&self) {
        let names: Vec<String> = {
            self.breakers
                .lock()
                .expect("breaker registry lock poisoned")
                .keys()
                .cloned()
                .collect()
        };
        for name in names {
            self.reset(&name);
        }
    }

    pub fn state(&self, name: &str) -> Option<BreakerState> {
        self.get(name).map(|b| {
            b.inner.lock().expect("breaker lock poisoned").state
        })
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<Breaker>> = {
            self.breakers
                .lock()
                .expect("breaker registry lock poisoned")
                .values()
                .cloned()
                .collect()
        };
        let now = Instant::now();
        breakers
            .iter()
            .map(|b| {
                let inner = b.inner.lock().expect("breaker lock poisoned");
                BreakerSnapshot {
                    name: b.name.clone(),
                    state: inner.state,
                    failure_count: inner.failure_count,
                    open_for_secs: inner
                        .opened_at
                        .map(|t| now.saturating_duration_since(t).as_secs()),
                    next_probe_in_secs: inner
                        .open_until
                        .map(|t| t.saturating_duration_since(now).as_secs()),
                }
            })
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
