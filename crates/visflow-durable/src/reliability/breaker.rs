//! Circuit breaker for flaky external services
//!
//! Limits the blast radius of failing dependencies invoked by executors.
//! Breakers are process-local: state survives via configuration, not
//! persistence.
//!
//! # State machine
//!
//! ```text
//! ┌─────────┐  failure threshold  ┌─────────┐  recovery timeout  ┌──────────┐
//! │ Closed  │ ──────────────────► │  Open   │ ─────────────────► │ HalfOpen │
//! └─────────┘                     └─────────┘                    └──────────┘
//!      ▲                               ▲                              │
//!      │        success threshold      │       any probe failure      │
//!      └───────────────────────────────┴──────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::metrics::{names, SharedMetrics};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; failures are counted in a rolling window
    Closed,

    /// Failure threshold exceeded; calls are rejected immediately
    Open,

    /// Testing recovery; a bounded number of probe calls are admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within the rolling window required to open the circuit
    pub failure_threshold: u32,

    /// Consecutive half-open successes required to close the circuit
    pub success_threshold: u32,

    /// Time to wait in open before admitting probes
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,

    /// Rolling window for failure counting
    #[serde(with = "duration_millis")]
    pub window: Duration,

    /// Concurrent probe calls admitted while half-open
    pub probe_budget: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(300),
            window: Duration::from_secs(60),
            probe_budget: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_probe_budget(mut self, budget: u32) -> Self {
        self.probe_budget = budget.max(1);
        self
    }
}

/// A call was rejected without reaching the service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BreakerRejected {
    /// Circuit is open
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    /// Circuit is half-open and all probe slots are taken
    #[error("circuit breaker '{0}' has no probe budget left")]
    ProbeBudgetExhausted(String),
}

struct BreakerInner {
    state: CircuitState,
    /// Failure timestamps within the rolling window (closed state only).
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_successes: u32,
    probes_in_flight: u32,
}

/// Per-service circuit breaker.
///
/// The permit API makes reporting explicit: a call site asks for a permit,
/// runs the protected call, then reports the result through the permit.
///
/// # Example
///
/// ```ignore
/// match breaker.allow() {
///     Ok(permit) => match call_service().await {
///         Ok(out) => { permit.success(); Ok(out) }
///         Err(e) => { permit.failure(); Err(e) }
///     },
///     Err(rejected) => Err(rejected.into()), // fail fast, classified transient
/// }
/// ```
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: SharedMetrics,
    ) -> Self {
        let name = name.into();
        let breaker = Self {
            name,
            config,
            clock,
            metrics,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                probes_in_flight: 0,
            }),
        };
        breaker.emit_state(CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An expired open state reads as `Open` until the next
    /// `allow` performs the half-open transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to make a protected call.
    pub fn allow(&self) -> Result<BreakerPermit<'_>, BreakerRejected> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.signed_duration_since(at).to_std().unwrap_or_default())
                    .unwrap_or_default();
                if elapsed < self.config.recovery_timeout {
                    return Err(BreakerRejected::Open(self.name.clone()));
                }

                // Recovery timeout elapsed: admit the first probe.
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.probes_in_flight = 1;
                drop(inner);
                debug!(breaker = %self.name, "circuit half-open, probing");
                self.emit_state(CircuitState::HalfOpen);
                Ok(BreakerPermit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight >= self.config.probe_budget {
                    return Err(BreakerRejected::ProbeBudgetExhausted(self.name.clone()));
                }
                inner.probes_in_flight += 1;
                Ok(BreakerPermit::new(self, true))
            }
        }
    }

    /// Force the breaker closed (admin/test operation).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.half_open_successes = 0;
        inner.probes_in_flight = 0;
        drop(inner);
        self.emit_state(CircuitState::Closed);
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probes_in_flight = 0;
                drop(inner);
                debug!(breaker = %self.name, "circuit closed");
                self.emit_state(CircuitState::Closed);
            }
        }
    }

    fn record_failure(&self, probe: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                let window =
                    chrono::Duration::from_std(self.config.window).unwrap_or_default();
                while inner
                    .failures
                    .front()
                    .map(|&t| now.signed_duration_since(t) > window)
                    .unwrap_or(false)
                {
                    inner.failures.pop_front();
                }

                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                    drop(inner);
                    warn!(breaker = %self.name, "circuit opened");
                    self.emit_state(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure reopens and restarts the timeout.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
                inner.probes_in_flight = 0;
                drop(inner);
                warn!(breaker = %self.name, "circuit reopened by probe failure");
                self.emit_state(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
    }

    fn emit_state(&self, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        self.metrics
            .gauge(names::BREAKER_STATE, &[("service", &self.name)], value);
    }
}

/// Permit held for the duration of a protected call.
///
/// Dropping a permit without reporting releases any probe slot it held
/// without counting toward success or failure.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            reported: false,
        }
    }

    /// Report that the protected call succeeded.
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success(self.probe);
    }

    /// Report that the protected call failed.
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
