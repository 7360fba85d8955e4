//! Per-tool circuit breakers.
//!
//! Each tool name has an independent breaker:
//!
//! - **closed**: calls flow. Failures increment a counter; reaching
//!   `failure_threshold` opens the breaker. Successes decrement it.
//! - **open**: calls are rejected without reaching the tool until
//!   `reset_after` has elapsed since the last failure.
//! - **half-open**: exactly one probe call is let through. A failing probe
//!   reopens the breaker, a succeeding probe closes it. A probe that never
//!   reports back (its call was cancelled or dropped) is handed back with
//!   [`CircuitBreakerTable::release_probe`], and a probe outstanding for
//!   longer than `reset_after` no longer holds the slot.
//!
//! The table is safe to share across sessions: every operation takes the
//! lock once, so updates are atomic per tool name.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Breaker state for one tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures, net of successes, that open a breaker.
    pub failure_threshold: u32,
    /// Milliseconds after the last failure before a probe is allowed.
    pub reset_after_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_after_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    failures: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
    probe_in_flight: bool,
    probe_started: Option<Instant>,
}

impl BreakerEntry {
    /// A probe is outstanding and younger than `reset_after`.
    fn probe_pending(&self, reset_after: Duration) -> bool {
        self.probe_in_flight
            && self
                .probe_started
                .is_none_or(|t| t.elapsed() < reset_after)
    }

    fn admit_probe(&mut self) {
        self.probe_in_flight = true;
        self.probe_started = Some(Instant::now());
    }

    fn clear_probe(&mut self) {
        self.probe_in_flight = false;
        self.probe_started = None;
    }
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            state: CircuitState::Closed,
            probe_in_flight: false,
            probe_started: None,
        }
    }
}

/// Read-only snapshot of one breaker, for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub tool: String,
    pub state: CircuitState,
    pub failures: u32,
    /// Milliseconds since the last failure, if any.
    pub last_failure_ms_ago: Option<u64>,
    pub reset_after_ms: u64,
}

/// Process-wide breaker table keyed by tool name.
#[derive(Debug)]
pub struct CircuitBreakerTable {
    config: BreakerConfig,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl Default for CircuitBreakerTable {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakerTable {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, BreakerEntry>) -> R) -> R {
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Gate a call to `tool`. Returns `true` when the call must be rejected.
    ///
    /// Moves an open breaker to half-open once the reset period has elapsed
    /// and admits exactly one probe; further calls are rejected until that
    /// probe reports back, is released, or has been outstanding for
    /// `reset_after`.
    pub fn is_circuit_open(&self, tool: &str) -> bool {
        let reset_after = self.config.reset_after();
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(tool) else {
                return false;
            };
            match entry.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let elapsed = entry.last_failure.map(|t| t.elapsed());
                    if elapsed.is_some_and(|e| e >= reset_after) {
                        entry.state = CircuitState::HalfOpen;
                        entry.admit_probe();
                        info!(tool, "Circuit half-open, allowing one probe call");
                        false
                    } else {
                        true
                    }
                }
                CircuitState::HalfOpen => {
                    if entry.probe_pending(reset_after) {
                        return true;
                    }
                    if entry.probe_in_flight {
                        warn!(tool, "Probe never reported back, admitting another");
                    }
                    entry.admit_probe();
                    false
                }
            }
        })
    }

    /// Whether `tool` would currently be rejected, without consuming a probe.
    pub fn blocks(&self, tool: &str) -> bool {
        let reset_after = self.config.reset_after();
        self.with_entries(|entries| match entries.get(tool) {
            None => false,
            Some(entry) => match entry.state {
                CircuitState::Closed => false,
                CircuitState::Open => !entry
                    .last_failure
                    .is_some_and(|t| t.elapsed() >= reset_after),
                CircuitState::HalfOpen => entry.probe_pending(reset_after),
            },
        })
    }

    /// Record a failed call. Returns the state after the update.
    pub fn record_failure(&self, tool: &str) -> CircuitState {
        let threshold = self.config.failure_threshold;
        self.with_entries(|entries| {
            let entry = entries.entry(tool.to_string()).or_default();
            entry.failures = entry.failures.saturating_add(1);
            entry.last_failure = Some(Instant::now());
            entry.clear_probe();
            match entry.state {
                CircuitState::HalfOpen => {
                    entry.state = CircuitState::Open;
                    warn!(tool, "Probe failed, circuit reopened");
                }
                CircuitState::Closed if entry.failures >= threshold => {
                    entry.state = CircuitState::Open;
                    warn!(tool, failures = entry.failures, "Circuit opened");
                }
                _ => {}
            }
            entry.state
        })
    }

    /// Record a successful call. Returns the state after the update.
    pub fn record_success(&self, tool: &str) -> CircuitState {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(tool) else {
                return CircuitState::Closed;
            };
            entry.failures = entry.failures.saturating_sub(1);
            entry.clear_probe();
            if entry.state == CircuitState::HalfOpen {
                entry.state = CircuitState::Closed;
                entry.failures = 0;
                info!(tool, "Probe succeeded, circuit closed");
            }
            entry.state
        })
    }

    /// Hand back a half-open probe slot whose call ended without reporting
    /// success or failure. Returns `true` if a slot was released.
    pub fn release_probe(&self, tool: &str) -> bool {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(tool) else {
                return false;
            };
            if entry.state != CircuitState::HalfOpen || !entry.probe_in_flight {
                return false;
            }
            entry.clear_probe();
            info!(tool, "Probe abandoned, slot released");
            true
        })
    }

    pub fn state(&self, tool: &str) -> CircuitState {
        self.with_entries(|entries| entries.get(tool).map_or(CircuitState::Closed, |e| e.state))
    }

    /// Time until an open breaker admits a probe. `None` unless open.
    pub fn retry_after(&self, tool: &str) -> Option<Duration> {
        let reset_after = self.config.reset_after();
        self.with_entries(|entries| {
            let entry = entries.get(tool)?;
            if entry.state == CircuitState::Closed {
                return None;
            }
            let elapsed = entry.last_failure.map_or(Duration::ZERO, |t| t.elapsed());
            Some(reset_after.saturating_sub(elapsed))
        })
    }

    /// Snapshot of every tracked breaker, sorted by tool name.
    pub fn status(&self) -> Vec<BreakerStatus> {
        let reset_after_ms = self.config.reset_after_ms;
        let mut out: Vec<BreakerStatus> = self.with_entries(|entries| {
            entries
                .iter()
                .map(|(tool, e)| BreakerStatus {
                    tool: tool.clone(),
                    state: e.state,
                    failures: e.failures,
                    last_failure_ms_ago: e
                        .last_failure
                        .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX)),
                    reset_after_ms,
                })
                .collect()
        });
        out.sort_by(|a, b| a.tool.cmp(&b.tool));
        out
    }

    /// Forget one tool's breaker, or all of them.
    pub fn reset(&self, tool: Option<&str>) {
        self.with_entries(|entries| match tool {
            Some(t) => {
                entries.remove(t);
            }
            None => entries.clear(),
        });
    }
}
