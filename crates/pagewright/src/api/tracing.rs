//! Correlation IDs and token accounting for controller executions.
//!
//! Every controller execution (including a resume) gets a fresh `trace_id`;
//! each step within it gets a `span_id`. Token usage reported by the provider
//! accumulates into a [`TokenTally`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::UsageInfo;

/// Generate a unique trace ID for a controller execution.
pub fn generate_trace_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Use a counter to handle sub-nanosecond calls.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tr-{ts:x}-{count:04x}")
}

/// Generate a span ID for a step within an execution.
pub fn generate_span_id(trace_id: &str, step: u32) -> String {
    format!("{trace_id}:s{step}")
}

/// Generate a session ID for a new conversation.
pub fn generate_session_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ses-{ts:x}-{count:04x}")
}

/// Cumulative provider-reported token usage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTally {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record usage for one model call. Missing fields count as zero.
    pub fn record(&mut self, usage: &UsageInfo) {
        self.prompt_tokens += u64::from(usage.prompt_tokens.unwrap_or(0));
        self.completion_tokens += u64::from(usage.completion_tokens.unwrap_or(0));
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Format as a short summary string.
    pub fn summary(&self) -> String {
        format!(
            "tokens: {} prompt + {} completion = {} total",
            self.prompt_tokens,
            self.completion_tokens,
            self.total(),
        )
    }
}
