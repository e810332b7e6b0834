//! Token-bucket rate limiting per endpoint class, with a concurrency
//! semaphore per class. Classification is table-driven: ordered regex
//! patterns against the endpoint path, first match wins.

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    PublicMarket,
    PrivateAccount,
    PrivateTrading,
    PrivateMargin,
    Default,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 5] = [
        EndpointClass::PublicMarket,
        EndpointClass::PrivateAccount,
        EndpointClass::PrivateTrading,
        EndpointClass::PrivateMargin,
        EndpointClass::Default,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUBLIC_MARKET" => Some(EndpointClass::PublicMarket),
            "PRIVATE_ACCOUNT" => Some(EndpointClass::PrivateAccount),
            "PRIVATE_TRADING" => Some(EndpointClass::PrivateTrading),
            "PRIVATE_MARGIN" => Some(EndpointClass::PrivateMargin),
            "DEFAULT" => Some(EndpointClass::Default),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointClass::PublicMarket => "PUBLIC_MARKET",
            EndpointClass::PrivateAccount => "PRIVATE_ACCOUNT",
            EndpointClass::PrivateTrading => "PRIVATE_TRADING",
            EndpointClass::PrivateMargin => "PRIVATE_MARGIN",
            EndpointClass::Default => "DEFAULT",
        };
        write!(f, "{}", s)
    }
}

/// Ordered path → class table. First matching pattern wins; unmatched paths
/// fall through to [`EndpointClass::Default`].
pub struct EndpointClassifier {
    patterns: Vec<(Regex, EndpointClass)>,
}

impl EndpointClassifier {
    /// Built-in table for the Bitfinex v2 path layout.
    pub fn bitfinex_default() -> Self {
        let table = [
            (r"^auth/r/info/margin", EndpointClass::PrivateMargin),
            (r"^auth/[rw]/order", EndpointClass::PrivateTrading),
            (r"^auth/w/", EndpointClass::PrivateTrading),
            (r"^auth/r/", EndpointClass::PrivateAccount),
            (
                r"^(ticker|tickers|candles|book|trades|conf)",
                EndpointClass::PublicMarket,
            ),
        ];
        let patterns = table
            .iter()
            .map(|(p, c)| (Regex::new(p).expect("built-in pattern is valid"), *c))
            .collect();
        Self { patterns }
    }

    /// Parse an operator-supplied `pattern=CLASS;pattern=CLASS` table.
    /// Invalid entries are skipped with a warning rather than failing start.
    pub fn from_spec(spec: &str) -> Self {
        let mut patterns = Vec::new();
        for entry in spec.split(';').filter(|e| !e.trim().is_empty()) {
            let Some((pattern, class_name)) = entry.split_once('=') else {
                warn!("EndpointClassifier: skipping malformed entry '{}'", entry);
                continue;
            };
            let Some(class) = EndpointClass::parse(class_name.trim()) else {
                warn!(
                    "EndpointClassifier: unknown class '{}' in '{}'",
                    class_name, entry
                );
                continue;
            };
            match Regex::new(pattern.trim()) {
                Ok(re) => patterns.push((re, class)),
                Err(e) => warn!(
                    "EndpointClassifier: invalid pattern '{}': {}",
                    pattern, e
                ),
            }
        }
        Self { patterns }
    }

    pub fn classify(&self, path: &str) -> EndpointClass {
        for (re, class) in &self.patterns {
            if re.is_match(path) {
                return *class;
            }
        }
        EndpointClass::Default
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassLimits {
    /// Burst capacity in tokens.
    pub capacity: f64,
    /// Steady refill rate in tokens per second.
    pub refill_per_sec: f64,
    /// Max parallel in-flight requests.
    pub max_concurrent: usize,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    /// Server-imposed pause (`Retry-After`); no tokens are handed out before.
    frozen_until: Option<Instant>,
}

struct ClassState {
    limits: ClassLimits,
    bucket: Mutex<Bucket>,
    semaphore: Arc<Semaphore>,
}

/// Permit for one outbound call. Dropping it releases the concurrency slot;
/// the consumed token is never refunded.
pub struct RatePermit {
    pub class: EndpointClass,
    _slot: OwnedSemaphorePermit,
}

/// Per-class gauge snapshot for metrics export.
#[derive(Debug, Clone)]
pub struct ClassUsage {
    pub class: EndpointClass,
    pub tokens_available: f64,
    pub capacity: f64,
    pub in_flight: usize,
    pub utilization_pct: f64,
}

pub struct RateLimiter {
    classifier: EndpointClassifier,
    classes: HashMap<EndpointClass, ClassState>,
}

impl RateLimiter {
    pub fn new(classifier: EndpointClassifier, limits: HashMap<EndpointClass, ClassLimits>) -> Self {
        let classes = EndpointClass::ALL
            .iter()
            .map(|class| {
                let class_limits = limits.get(class).copied().unwrap_or_else(|| {
                    Self::default_limits(*class)
                });
                (
                    *class,
                    ClassState {
                        limits: class_limits,
                        bucket: Mutex::new(Bucket {
                            tokens: class_limits.capacity,
                            last_refill: Instant::now(),
                            frozen_until: None,
                        }),
                        semaphore: Arc::new(Semaphore::new(class_limits.max_concurrent)),
                    },
                )
            })
            .collect();
        Self {
            classifier,
            classes,
        }
    }

    pub fn bitfinex_default() -> Self {
        Self::new(EndpointClassifier::bitfinex_default(), HashMap::new())
    }

    fn default_limits(class: EndpointClass) -> ClassLimits {
        match class {
            EndpointClass::PublicMarket => ClassLimits {
                capacity: 10.0,
                refill_per_sec: 0.5,
                max_concurrent: 8,
            },
            EndpointClass::PrivateAccount => ClassLimits {
                capacity: 8.0,
                refill_per_sec: 0.75,
                max_concurrent: 4,
            },
            EndpointClass::PrivateTrading => ClassLimits {
                capacity: 10.0,
                refill_per_sec: 1.5,
                max_concurrent: 4,
            },
            EndpointClass::PrivateMargin => ClassLimits {
                capacity: 4.0,
                refill_per_sec: 0.25,
                max_concurrent: 2,
            },
            EndpointClass::Default => ClassLimits {
                capacity: 4.0,
                refill_per_sec: 0.5,
                max_concurrent: 2,
            },
        }
    }

    pub fn classify(&self, path: &str) -> EndpointClass {
        self.classifier.classify(path)
    }

    /// Block until a token and a concurrency slot are available.
    pub async fn acquire(&self, class: EndpointClass) -> RatePermit {
        let state = self
            .classes
            .get(&class)
            .unwrap_or_else(|| &self.classes[&EndpointClass::Default]);

        let slot = state
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("rate limiter semaphore never closes");

        loop {
            let wait = {
                let mut bucket = state.bucket.lock().expect("rate bucket lock poisoned");
                let now = Instant::now();

                if let Some(frozen_until) = bucket.frozen_until {
                    if now < frozen_until {
                        Some(frozen_until - now)
                    } else {
                        bucket.frozen_until = None;
                        Self::try_take(&mut bucket, &state.limits, now)
                    }
                } else {
                    Self::try_take(&mut bucket, &state.limits, now)
                }
            };

            match wait {
                None => break,
                Some(delay) => {
                    debug!(
                        "RateLimiter: class {} exhausted, waiting {:?}",
                        class, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        RatePermit {
            class,
            _slot: slot,
        }
    }

    /// Refill by elapsed time, then take one token or report the shortfall.
    fn try_take(bucket: &mut Bucket, limits: &ClassLimits, now: Instant) -> Option<Duration> {
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * limits.refill_per_sec).min(limits.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else if limits.refill_per_sec > 0.0 {
            let deficit = 1.0 - bucket.tokens;
            Some(Duration::from_secs_f64(deficit / limits.refill_per_sec))
        } else {
            Some(Duration::from_secs(1))
        }
    }

    /// Push a class's next token past a server-mandated pause. Used when a
    /// 429's `Retry-After` exceeds the local pacing.
    pub fn freeze(&self, class: EndpointClass, pause: Duration) {
        if let Some(state) = self.classes.get(&class) {
            let mut bucket = state.bucket.lock().expect("rate bucket lock poisoned");
            let until = Instant::now() + pause;
            bucket.frozen_until = Some(bucket.frozen_until.map_or(until, |cur| cur.max(until)));
            warn!(
                "RateLimiter: class {} frozen for {:?} (server Retry-After)",
                class, pause
            );
        }
    }

    pub fn usage(&self) -> Vec<ClassUsage> {
        let now = Instant::now();
        self.classes
            .iter()
            .map(|(class, state)| {
                let mut bucket = state.bucket.lock().expect("rate bucket lock poisoned");
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens =
                    (bucket.tokens + elapsed * state.limits.refill_per_sec).min(state.limits.capacity);
                bucket.last_refill = now;

                let in_flight =
                    state.limits.max_concurrent - state.semaphore.available_permits();
                ClassUsage {
                    class: *class,
                    tokens_available: bucket.tokens,
                    capacity: state.limits.capacity,
                    in_flight,
                    utilization_pct: if state.limits.capacity > 0.0 {
                        (1.0 - bucket.tokens / state.limits.capacity) * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}
