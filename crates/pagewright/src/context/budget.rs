//! Context budget tracking: model limits, token accounting, usage snapshots,
//! and advisory notices when approaching a model's usable context.
//!
//! A model's usable budget is always `context_limit - max_output`. Usage
//! percentage, "approaching overflow" and "available tokens" are derived from
//! that pair plus the current total. Unknown model identifiers fall back to a
//! conservative default rather than erroring.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Message, Part};

/// Characters per token used by [`CharEstimator`].
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Tokens charged for a tool-result part whose output has been redacted.
pub const COMPACTED_PART_OVERHEAD: usize = 8;

/// Tokens charged per message for role and framing.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Threshold fractions at which advisory notices are produced.
const WARNING_THRESHOLD: f64 = 0.60;
const CRITICAL_THRESHOLD: f64 = 0.80;

// ── Model limits ───────────────────────────────────────────────────

/// Context window and per-response output cap for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub context_limit: usize,
    pub max_output: usize,
}

impl ModelLimits {
    pub const fn new(context_limit: usize, max_output: usize) -> Self {
        Self {
            context_limit,
            max_output,
        }
    }

    /// Usable input budget: `context_limit - max_output`.
    pub fn usable(&self) -> usize {
        self.context_limit.saturating_sub(self.max_output)
    }
}

/// Conservative limits for models nothing is known about.
pub const DEFAULT_MODEL_LIMITS: ModelLimits = ModelLimits::new(32_000, 4_096);

/// Lookup limits for a model by name.
///
/// Matches on the model name segment (after the last `/` in paths like
/// `"anthropic/claude-sonnet-4"`) to avoid false positives from org
/// prefixes.
pub fn limits_for_model(model: &str) -> ModelLimits {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    if name.contains("claude") {
        ModelLimits::new(200_000, 16_000)
    } else if name.contains("gpt-4.1") {
        ModelLimits::new(1_000_000, 32_768)
    } else if name.contains("gpt-4o") {
        ModelLimits::new(128_000, 16_384)
    } else if name.starts_with("o1") || name.starts_with("o3") || name.starts_with("o4") {
        ModelLimits::new(200_000, 100_000)
    } else if name.contains("gemini") {
        ModelLimits::new(1_000_000, 65_536)
    } else if name.contains("deepseek") {
        ModelLimits::new(64_000, 8_192)
    } else if name.contains("llama") {
        ModelLimits::new(128_000, 8_192)
    } else {
        DEFAULT_MODEL_LIMITS
    }
}

/// Built-in limits plus configured overrides keyed by model id.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ModelLimitTable {
    overrides: HashMap<String, ModelLimits>,
}

impl ModelLimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, model: impl Into<String>, limits: ModelLimits) -> Self {
        self.overrides.insert(model.into(), limits);
        self
    }

    /// Override by full id, then by name segment, then the built-in table.
    pub fn lookup(&self, model: &str) -> ModelLimits {
        if let Some(limits) = self.overrides.get(model) {
            return *limits;
        }
        let name = model.rsplit('/').next().unwrap_or(model);
        self.overrides
            .get(name)
            .copied()
            .unwrap_or_else(|| limits_for_model(model))
    }
}

// ── Token counting ─────────────────────────────────────────────────

/// Token-counting collaborator. Implementations need only be monotonic in
/// content length; exact tokenizers are optional.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `ceil(chars / 4)` estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl TokenCounter for CharEstimator {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(DEFAULT_CHARS_PER_TOKEN)
    }
}

/// Render a tool output the way it is sent to the model.
pub(crate) fn output_text(output: &serde_json::Value) -> String {
    match output {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Token estimate for a single part. Redacted tool results cost only
/// [`COMPACTED_PART_OVERHEAD`].
pub fn part_tokens(counter: &dyn TokenCounter, part: &Part) -> usize {
    match part {
        Part::Text { text } => counter.count(text),
        Part::ToolCall {
            tool_name, input, ..
        } => counter.count(tool_name) + counter.count(&input.to_string()),
        Part::ToolResult {
            compacted_at: Some(_),
            ..
        } => COMPACTED_PART_OVERHEAD,
        Part::ToolResult {
            tool_name, output, ..
        } => counter.count(tool_name) + counter.count(&output_text(output)),
    }
}

/// Token estimate for a message: the cached count if present, otherwise the
/// sum of its parts plus [`MESSAGE_OVERHEAD`].
pub fn message_tokens(counter: &dyn TokenCounter, message: &Message) -> usize {
    if let Some(cached) = message.token_count {
        return cached;
    }
    MESSAGE_OVERHEAD
        + message
            .parts
            .iter()
            .map(|p| part_tokens(counter, p))
            .sum::<usize>()
}

pub fn total_tokens(counter: &dyn TokenCounter, messages: &[Message]) -> usize {
    messages.iter().map(|m| message_tokens(counter, m)).sum()
}

// ── Usage ──────────────────────────────────────────────────────────

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    /// Estimated tokens consumed.
    pub total_tokens: usize,
    /// `context_limit - max_output`.
    pub usable_tokens: usize,
    pub context_limit: usize,
    /// Usage as a fraction of usable tokens (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    pub fn new(total_tokens: usize, limits: ModelLimits) -> Self {
        let usable = limits.usable();
        let usage_pct = if usable > 0 {
            total_tokens as f64 / usable as f64
        } else {
            1.0
        };
        Self {
            total_tokens,
            usable_tokens: usable,
            context_limit: limits.context_limit,
            usage_pct,
        }
    }

    pub fn available_tokens(&self) -> usize {
        self.usable_tokens.saturating_sub(self.total_tokens)
    }

    /// Whether usage has reached `threshold` (a fraction of usable tokens).
    pub fn is_approaching_overflow(&self, threshold: f64) -> bool {
        self.usage_pct >= threshold
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {} usable)",
            self.total_tokens,
            self.usage_pct * 100.0,
            self.usable_tokens,
        )
    }
}

// ── Budget ─────────────────────────────────────────────────────────

/// Usage estimation and advisories for one model.
///
/// # Example
///
/// ```ignore
/// let budget = ContextBudget::new(limits_for_model("anthropic/claude-sonnet-4"))
///     .with_critical_message("Finish the current edit and answer.");
///
/// let usage = budget.estimate_usage(&messages, memory_tokens);
/// println!("{}", usage.to_log_string());
///
/// if let Some(advisory) = budget.advisory(&usage) {
///     println!("Advisory: {advisory}");
/// }
/// ```
#[derive(Clone)]
pub struct ContextBudget {
    limits: ModelLimits,
    counter: Arc<dyn TokenCounter>,
    warning_message: Option<String>,
    critical_message: Option<String>,
}

impl std::fmt::Debug for ContextBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBudget")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ContextBudget {
    pub fn new(limits: ModelLimits) -> Self {
        Self {
            limits,
            counter: Arc::new(CharEstimator),
            warning_message: None,
            critical_message: None,
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Set a custom warning message (produced at 60% usage).
    pub fn with_warning_message(mut self, msg: impl Into<String>) -> Self {
        self.warning_message = Some(msg.into());
        self
    }

    /// Set a custom critical message (produced at 80% usage).
    pub fn with_critical_message(mut self, msg: impl Into<String>) -> Self {
        self.critical_message = Some(msg.into());
        self
    }

    pub fn limits(&self) -> ModelLimits {
        self.limits
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    /// Estimate usage of `messages` plus `reserved` tokens held elsewhere
    /// (system prompt, memory sections).
    pub fn estimate_usage(&self, messages: &[Message], reserved: usize) -> ContextUsage {
        let total = total_tokens(self.counter.as_ref(), messages) + reserved;
        ContextUsage::new(total, self.limits)
    }

    /// Advisory notice for `usage`, or `None` within normal bounds.
    pub fn advisory(&self, usage: &ContextUsage) -> Option<String> {
        if usage.usage_pct >= CRITICAL_THRESHOLD {
            Some(self.critical_message.clone().unwrap_or_else(|| {
                format!(
                    "[Context notice: ~{:.0}% of context budget used ({} est. tokens / {} usable). \
                     Finish the current change and give your answer. Avoid further lookups.]",
                    usage.usage_pct * 100.0,
                    usage.total_tokens,
                    usage.usable_tokens,
                )
            }))
        } else if usage.usage_pct >= WARNING_THRESHOLD {
            Some(self.warning_message.clone().unwrap_or_else(|| {
                format!(
                    "[Context notice: ~{:.0}% of context budget used. \
                     Prefer acting on what you have over gathering more data.]",
                    usage.usage_pct * 100.0,
                )
            }))
        } else {
            None
        }
    }
}
