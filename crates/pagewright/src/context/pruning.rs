//! Tool-output pruning: redact old, large tool results in place.
//!
//! Tool results are the largest context consumer in a tool-calling loop and
//! are rarely needed verbatim once the model has acted on them. Pruning
//! replaces their output with a short marker while keeping the call id, the
//! tool name, and an `original_tokens` record of what was discarded. No model
//! call is needed, and message count, roles, and call/result pairing never
//! change.
//!
//! Protection is measured in turns from the end of the conversation. Every
//! user or assistant message opens a turn, so in a tool-calling loop each
//! step (assistant call plus its tool results) is one turn.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::budget::{COMPACTED_PART_OVERHEAD, TokenCounter, part_tokens};
use crate::{Message, MessageRole, Part};

/// Prefix of the marker written over pruned outputs.
pub const PRUNED_PREFIX: &str = "[Output pruned:";

/// Configuration for tool-output pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    pub enabled: bool,
    /// Most recent turns whose tool results are never pruned.
    pub min_turns_to_keep: usize,
    /// Tool results at or below this many tokens are left alone.
    pub prune_minimum: usize,
    /// Stop pruning once cumulative savings reach this many tokens.
    pub prune_protect: usize,
    /// Tools whose results are never pruned.
    pub protected_tools: HashSet<String>,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_turns_to_keep: 2,
            prune_minimum: 200,
            prune_protect: 40_000,
            protected_tools: HashSet::new(),
        }
    }
}

impl PruneConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_turns_to_keep(mut self, turns: usize) -> Self {
        self.min_turns_to_keep = turns;
        self
    }

    pub fn with_prune_minimum(mut self, tokens: usize) -> Self {
        self.prune_minimum = tokens;
        self
    }

    pub fn with_prune_protect(mut self, tokens: usize) -> Self {
        self.prune_protect = tokens;
        self
    }

    /// Add a protected tool name (its results will never be pruned).
    pub fn protect_tool(mut self, name: impl Into<String>) -> Self {
        self.protected_tools.insert(name.into());
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Dry-run result of [`estimate_prune_savings`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneEstimate {
    /// Tokens held by all unredacted tool results.
    pub total_tool_tokens: usize,
    /// Tokens a prune run would save.
    pub prunable_tokens: usize,
    /// Tool results a prune run would redact.
    pub outputs_count: usize,
}

/// Result of [`prune_tool_outputs`].
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    pub messages: Vec<Message>,
    pub outputs_pruned: usize,
    pub tokens_saved: usize,
    /// Distinct tool names whose outputs were pruned, in first-pruned order.
    pub pruned_tools: Vec<String>,
}

/// A tool result chosen for redaction.
struct Candidate {
    message: usize,
    part: usize,
    tokens: usize,
}

/// Index of the first message inside the protected window.
fn protect_boundary(messages: &[Message], min_turns_to_keep: usize) -> usize {
    if min_turns_to_keep == 0 {
        return messages.len();
    }
    let mut turns = 0;
    for (i, msg) in messages.iter().enumerate().rev() {
        if matches!(msg.role, MessageRole::User | MessageRole::Assistant) {
            turns += 1;
            if turns == min_turns_to_keep {
                return i;
            }
        }
    }
    0
}

fn select_candidates(
    counter: &dyn TokenCounter,
    messages: &[Message],
    config: &PruneConfig,
) -> (Vec<Candidate>, usize) {
    let boundary = protect_boundary(messages, config.min_turns_to_keep);
    let mut total_tool_tokens = 0;
    let mut savings = 0;
    let mut candidates = Vec::new();

    for (mi, msg) in messages.iter().enumerate() {
        for (pi, part) in msg.parts.iter().enumerate() {
            let Part::ToolResult { tool_name, .. } = part else {
                continue;
            };
            if part.is_compacted() {
                continue;
            }
            let tokens = part_tokens(counter, part);
            total_tool_tokens += tokens;

            if mi >= boundary
                || savings >= config.prune_protect
                || tokens <= config.prune_minimum
                || config.protected_tools.contains(tool_name)
            {
                continue;
            }
            savings += tokens.saturating_sub(COMPACTED_PART_OVERHEAD);
            candidates.push(Candidate {
                message: mi,
                part: pi,
                tokens,
            });
        }
    }
    (candidates, total_tool_tokens)
}

/// Dry run: what a prune would do. Does not mutate anything.
pub fn estimate_prune_savings(
    counter: &dyn TokenCounter,
    messages: &[Message],
    config: &PruneConfig,
) -> PruneEstimate {
    let (candidates, total_tool_tokens) = select_candidates(counter, messages, config);
    PruneEstimate {
        total_tool_tokens,
        prunable_tokens: candidates
            .iter()
            .map(|c| c.tokens.saturating_sub(COMPACTED_PART_OVERHEAD))
            .sum(),
        outputs_count: candidates.len(),
    }
}

/// Whether pruning is enabled and would redact at least one output.
pub fn needs_pruning(counter: &dyn TokenCounter, messages: &[Message], config: &PruneConfig) -> bool {
    config.enabled && estimate_prune_savings(counter, messages, config).outputs_count > 0
}

/// Redact old tool outputs. Already-redacted parts are skipped, so running
/// this twice saves nothing the second time.
pub fn prune_tool_outputs(
    counter: &dyn TokenCounter,
    messages: &[Message],
    config: &PruneConfig,
) -> PruneOutcome {
    let mut out = messages.to_vec();
    if !config.enabled {
        return PruneOutcome {
            messages: out,
            outputs_pruned: 0,
            tokens_saved: 0,
            pruned_tools: Vec::new(),
        };
    }

    let (candidates, _) = select_candidates(counter, messages, config);
    let now = Utc::now();
    let mut tokens_saved = 0;
    let mut pruned_tools: Vec<String> = Vec::new();

    for c in &candidates {
        let msg = &mut out[c.message];
        msg.token_count = None;
        if let Some(Part::ToolResult {
            tool_name,
            output,
            compacted_at,
            original_tokens,
            ..
        }) = msg.parts.get_mut(c.part)
        {
            *output = serde_json::Value::String(format!(
                "{PRUNED_PREFIX} {tool_name} returned ~{} tokens; call it again if the data is still needed]",
                c.tokens
            ));
            *compacted_at = Some(now);
            *original_tokens = Some(c.tokens);
            tokens_saved += c.tokens.saturating_sub(COMPACTED_PART_OVERHEAD);
            if !pruned_tools.iter().any(|t| t == tool_name) {
                pruned_tools.push(tool_name.clone());
            }
        }
    }

    if !candidates.is_empty() {
        debug!(
            outputs = candidates.len(),
            tokens_saved,
            tools = ?pruned_tools,
            "Pruned tool outputs"
        );
    }

    PruneOutcome {
        messages: out,
        outputs_pruned: candidates.len(),
        tokens_saved,
        pruned_tools,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::budget::{CharEstimator, total_tokens};
    use serde_json::json;

    /// One step: assistant tool call followed by its result of `chars` chars.
    fn step(i: usize, tool: &str, chars: usize) -> [Message; 2] {
        let id = format!("c{i}");
        [
            Message::assistant(None, vec![Part::tool_call(&id, tool, json!({"i": i}))]),
            Message::tool(vec![Part::tool_result(&id, tool, json!("x".repeat(chars)), false)]),
        ]
    }

    fn conversation(steps: usize, chars: usize) -> Vec<Message> {
        let mut msgs = vec![Message::user("rebuild the blog")];
        for i in 0..steps {
            msgs.extend(step(i, "getPage", chars));
        }
        msgs
    }

    #[test]
    fn protect_boundary_counts_turns_from_end() {
        let msgs = conversation(3, 10);
        // [user, a0, t0, a1, t1, a2, t2]
        assert_eq!(protect_boundary(&msgs, 1), 5);
        assert_eq!(protect_boundary(&msgs, 2), 3);
        assert_eq!(protect_boundary(&msgs, 0), msgs.len());
        assert_eq!(protect_boundary(&msgs, 10), 0);
    }

    #[test]
    fn recent_turns_are_protected() {
        let msgs = conversation(4, 2000);
        let config = PruneConfig::new().with_prune_minimum(100);
        let outcome = prune_tool_outputs(&CharEstimator, &msgs, &config);
        assert_eq!(outcome.outputs_pruned, 2);
        assert!(outcome.messages[2].parts[0].is_compacted());
        assert!(outcome.messages[4].parts[0].is_compacted());
        assert!(!outcome.messages[6].parts[0].is_compacted());
        assert!(!outcome.messages[8].parts[0].is_compacted());
    }

    #[test]
    fn small_outputs_are_skipped() {
        let msgs = conversation(5, 40);
        let config = PruneConfig::new().with_prune_minimum(100);
        assert!(!needs_pruning(&CharEstimator, &msgs, &config));
        let outcome = prune_tool_outputs(&CharEstimator, &msgs, &config);
        assert_eq!(outcome.outputs_pruned, 0);
        assert_eq!(outcome.messages, msgs);
    }

    #[test]
    fn stops_once_target_reached() {
        let msgs = conversation(10, 2000);
        let config = PruneConfig::new()
            .with_prune_minimum(100)
            .with_prune_protect(900);
        let outcome = prune_tool_outputs(&CharEstimator, &msgs, &config);
        // Each output saves 494 tokens; the second crosses 900.
        assert_eq!(outcome.outputs_pruned, 2);
        assert!(outcome.tokens_saved >= 900);
    }

    #[test]
    fn protected_tools_are_kept() {
        let mut msgs = vec![Message::user("go")];
        msgs.extend(step(0, "readSchema", 2000));
        msgs.extend(step(1, "getPage", 2000));
        msgs.extend(step(2, "getPage", 10));
        msgs.extend(step(3, "getPage", 10));
        let config = PruneConfig::new()
            .with_prune_minimum(100)
            .protect_tool("readSchema");
        let outcome = prune_tool_outputs(&CharEstimator, &msgs, &config);
        assert_eq!(outcome.outputs_pruned, 1);
        assert_eq!(outcome.pruned_tools, vec!["getPage".to_string()]);
        assert!(!outcome.messages[2].parts[0].is_compacted());
    }

    #[test]
    fn preserves_structure_and_metadata() {
        let msgs = conversation(6, 2000);
        let config = PruneConfig::new().with_prune_minimum(100);
        let outcome = prune_tool_outputs(&CharEstimator, &msgs, &config);

        assert_eq!(outcome.messages.len(), msgs.len());
        for (before, after) in msgs.iter().zip(&outcome.messages) {
            assert_eq!(before.role, after.role);
            assert_eq!(before.tool_calls().count(), after.tool_calls().count());
            assert_eq!(
                before.tool_results().collect::<Vec<_>>(),
                after.tool_results().collect::<Vec<_>>()
            );
        }
        match &outcome.messages[2].parts[0] {
            Part::ToolResult {
                output,
                original_tokens,
                ..
            } => {
                assert!(output.as_str().unwrap().starts_with(PRUNED_PREFIX));
                assert_eq!(*original_tokens, Some(500 + 2));
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert!(
            total_tokens(&CharEstimator, &outcome.messages) < total_tokens(&CharEstimator, &msgs)
        );
    }

    #[test]
    fn estimate_matches_prune() {
        let msgs = conversation(6, 2000);
        let config = PruneConfig::new().with_prune_minimum(100);
        let estimate = estimate_prune_savings(&CharEstimator, &msgs, &config);
        let outcome = prune_tool_outputs(&CharEstimator, &msgs, &config);
        assert_eq!(estimate.outputs_count, outcome.outputs_pruned);
        assert_eq!(estimate.prunable_tokens, outcome.tokens_saved);
        assert_eq!(estimate.total_tool_tokens, 6 * 502);
    }

    #[test]
    fn disabled_config_is_a_noop() {
        let msgs = conversation(6, 2000);
        let config = PruneConfig::disabled();
        assert!(!needs_pruning(&CharEstimator, &msgs, &config));
        assert_eq!(prune_tool_outputs(&CharEstimator, &msgs, &config).outputs_pruned, 0);
    }
}
