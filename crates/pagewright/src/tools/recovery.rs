//! Tool error classification and retry decisions.
//!
//! A failed tool call's message is matched against an ordered pattern list;
//! the first match decides its [`ErrorCategory`] and [`RecoveryStrategy`].
//! Patterns run from most to least specific, so "duplicate key violates
//! unique constraint" is a constraint error even though it also contains
//! "key". Each category carries remediation suggestions that are appended to
//! the observation the model sees.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tools::breaker::{BreakerConfig, CircuitBreakerTable, CircuitState};

/// What kind of failure a tool reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Constraint,
    NotFound,
    Reference,
    CircuitBreaker,
    Timeout,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Constraint => "constraint",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Reference => "reference",
            ErrorCategory::CircuitBreaker => "circuit_breaker",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// How the controller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Skip,
    Escalate,
}

/// Outcome of [`classify_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub strategy: RecoveryStrategy,
    pub suggestions: &'static [&'static str],
}

struct ErrorPattern {
    needles: &'static [&'static str],
    category: ErrorCategory,
    strategy: RecoveryStrategy,
    suggestions: &'static [&'static str],
}

const PATTERNS: &[ErrorPattern] = &[
    ErrorPattern {
        needles: &["circuit", "temporarily unavailable"],
        category: ErrorCategory::CircuitBreaker,
        strategy: RecoveryStrategy::Skip,
        suggestions: &[
            "This tool is failing repeatedly and has been paused. Wait before calling it again.",
            "Continue with other parts of the task, or tell the user this step is blocked.",
        ],
    },
    ErrorPattern {
        needles: &["timed out", "timeout", "deadline exceeded"],
        category: ErrorCategory::Timeout,
        strategy: RecoveryStrategy::Retry,
        suggestions: &[
            "The operation took too long. Retry once, or narrow the request (fewer records, smaller payload).",
        ],
    },
    ErrorPattern {
        needles: &["foreign key", "referenced", "reference", "still in use"],
        category: ErrorCategory::Reference,
        strategy: RecoveryStrategy::Escalate,
        suggestions: &[
            "Another record depends on this one. Do not delete or re-point it blindly.",
            "Explain the dependency to the user and ask how to proceed.",
        ],
    },
    ErrorPattern {
        needles: &["already exists", "unique", "duplicate", "constraint", "conflict"],
        category: ErrorCategory::Constraint,
        strategy: RecoveryStrategy::Fallback,
        suggestions: &[
            "A record with this identifier already exists. Try a different slug or name.",
            "Or look up the existing record and update it instead of creating a new one.",
        ],
    },
    ErrorPattern {
        needles: &["not found", "does not exist", "no such", "unknown id", "http 404"],
        category: ErrorCategory::NotFound,
        strategy: RecoveryStrategy::Fallback,
        suggestions: &[
            "Check the identifier. Use a list or search tool to find the right one.",
            "The record may have been renamed or deleted earlier in this conversation.",
        ],
    },
    ErrorPattern {
        needles: &["validation", "invalid", "required", "must be", "expected"],
        category: ErrorCategory::Validation,
        strategy: RecoveryStrategy::Retry,
        suggestions: &[
            "Check that the arguments match the tool's parameter schema (field names, types, required fields).",
            "Fix the arguments and call the tool again.",
        ],
    },
];

const UNKNOWN: ErrorClassification = ErrorClassification {
    category: ErrorCategory::Unknown,
    strategy: RecoveryStrategy::Escalate,
    suggestions: &[
        "Review the error message before trying anything else.",
        "If the cause is unclear, stop and report the error to the user.",
    ],
};

/// Classify a tool error message. First matching pattern wins.
pub fn classify_error(error: &str) -> ErrorClassification {
    let lower = error.to_lowercase();
    PATTERNS
        .iter()
        .find(|p| p.needles.iter().any(|n| lower.contains(n)))
        .map_or(UNKNOWN, |p| ErrorClassification {
            category: p.category,
            strategy: p.strategy,
            suggestions: p.suggestions,
        })
}

/// Retry limits for tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Retries allowed per call.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
        }
    }
}

impl RecoveryConfig {
    /// `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Outcome of [`ErrorRecoveryManager::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
    pub reason: String,
}

impl RetryDecision {
    fn refuse(reason: impl Into<String>) -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
            reason: reason.into(),
        }
    }
}

/// Classifies failures and owns the per-tool breaker table.
///
/// Never calls tools itself. Share one instance across sessions through an
/// `Arc`; tests construct fresh instances.
#[derive(Debug, Default)]
pub struct ErrorRecoveryManager {
    breakers: CircuitBreakerTable,
    config: RecoveryConfig,
}

impl ErrorRecoveryManager {
    pub fn new(breaker: BreakerConfig, config: RecoveryConfig) -> Self {
        Self {
            breakers: CircuitBreakerTable::new(breaker),
            config,
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn breakers(&self) -> &CircuitBreakerTable {
        &self.breakers
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn classify(&self, error: &str) -> ErrorClassification {
        classify_error(error)
    }

    /// Gate a call; see [`CircuitBreakerTable::is_circuit_open`].
    pub fn is_circuit_open(&self, tool: &str) -> bool {
        self.breakers.is_circuit_open(tool)
    }

    pub fn record_success(&self, tool: &str) -> CircuitState {
        self.breakers.record_success(tool)
    }

    pub fn record_failure(&self, tool: &str) -> CircuitState {
        self.breakers.record_failure(tool)
    }

    /// See [`CircuitBreakerTable::release_probe`].
    pub fn release_probe(&self, tool: &str) -> bool {
        self.breakers.release_probe(tool)
    }

    /// Whether to retry `tool` after `error`, given `attempt` retries so far.
    pub fn should_retry(&self, tool: &str, error: &str, attempt: u32) -> RetryDecision {
        if self.breakers.blocks(tool) {
            return RetryDecision::refuse("circuit open");
        }
        if attempt >= self.config.max_attempts {
            return RetryDecision::refuse(format!(
                "attempt limit reached ({}/{})",
                attempt, self.config.max_attempts
            ));
        }
        let class = classify_error(error);
        match class.strategy {
            RecoveryStrategy::Skip | RecoveryStrategy::Escalate => {
                RetryDecision::refuse(format!("{} errors are not retried", class.category))
            }
            RecoveryStrategy::Retry | RecoveryStrategy::Fallback => {
                let delay = self.config.backoff(attempt);
                debug!(tool, attempt, ?delay, category = %class.category, "Retry approved");
                RetryDecision {
                    retry: true,
                    delay,
                    reason: format!("{} error", class.category),
                }
            }
        }
    }

    /// Observation returned instead of calling a tool whose circuit is open.
    pub fn circuit_open_observation(&self, tool: &str) -> String {
        let secs = self
            .breakers
            .retry_after(tool)
            .unwrap_or_else(|| self.breakers.config().reset_after())
            .as_secs_f64()
            .ceil()
            .max(1.0);
        format!("Tool '{tool}' is temporarily unavailable, retry after {secs:.0} seconds.")
    }
}
