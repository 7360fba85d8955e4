//! Two-stage context compaction.
//!
//! [`CompactionEngine::prepare_context_for_llm`] runs before every model call:
//!
//! 1. **Pruning** (see [`pruning`](crate::context::pruning)) once usage crosses
//!    `trigger_ratio` of the model's usable context. Cheap and structural.
//! 2. **Compaction** only when `force` is requested or usage is still above
//!    `hard_ceiling` after pruning. The oldest block of messages is replaced
//!    by one assistant message flagged `is_summary`; the most recent messages
//!    and any leading system messages are kept verbatim. Destructive.
//!
//! Summaries come from the configured [`ChatModel`] when one is attached,
//! with a deterministic extractive summary as the fallback.
//!
//! Working memory holds its own copies of each step, so it is kept within
//! budget separately by [`CompactionEngine::fit_working_memory`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::memory::HierarchicalMemory;
use crate::context::budget::{
    CharEstimator, ContextBudget, ContextUsage, ModelLimitTable, ModelLimits, TokenCounter,
    output_text, total_tokens,
};
use crate::context::pruning::{PruneConfig, prune_tool_outputs};
use crate::{ChatModel, Message, MessageRole, ModelRequest, Part};

/// Instructions for the summarization call.
const SUMMARIZATION_PROMPT: &str = "\
Summarize the following agent conversation concisely so the agent can continue \
the task without the original messages. Focus on:
- What the user asked for
- Records created, updated or deleted (ids, slugs, titles)
- Key findings and decisions made
- Failed tool calls and why they failed
- What remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve identifiers, slugs and error messages verbatim.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary that replaces the existing one entirely.";

/// Longest per-line excerpt in extractive summaries.
const EXCERPT_CHARS: usize = 200;

/// Maximum lines in an extractive summary body.
const MAX_EXTRACT_LINES: usize = 40;

/// Configuration for the compaction engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub prune: PruneConfig,
    /// Usage fraction at which pruning is attempted.
    pub trigger_ratio: f64,
    /// Usage fraction after pruning at which compaction fires.
    pub hard_ceiling: f64,
    /// Messages at the end of the conversation never summarized.
    pub keep_recent_messages: usize,
    /// Model for summarization calls. Defaults to the conversation's model.
    pub summary_model: Option<String>,
    pub max_summary_tokens: u32,
    /// Per-model limit overrides.
    #[serde(skip_serializing)]
    pub models: ModelLimitTable,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            prune: PruneConfig::default(),
            trigger_ratio: 0.70,
            hard_ceiling: 0.95,
            keep_recent_messages: 6,
            summary_model: None,
            max_summary_tokens: 1024,
            models: ModelLimitTable::default(),
        }
    }
}

impl CompactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prune(mut self, prune: PruneConfig) -> Self {
        self.prune = prune;
        self
    }

    pub fn with_trigger_ratio(mut self, ratio: f64) -> Self {
        self.trigger_ratio = ratio;
        self
    }

    pub fn with_hard_ceiling(mut self, ratio: f64) -> Self {
        self.hard_ceiling = ratio;
        self
    }

    pub fn with_keep_recent_messages(mut self, n: usize) -> Self {
        self.keep_recent_messages = n;
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = Some(model.into());
        self
    }

    pub fn with_model_limits(mut self, model: impl Into<String>, limits: ModelLimits) -> Self {
        self.models = self.models.with_override(model, limits);
        self
    }
}

/// Which stage fired during [`CompactionEngine::prepare_context_for_llm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStage {
    None,
    Pruned,
    Compacted,
}

/// Report of one preparation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionResult {
    pub stage: CompactionStage,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub outputs_pruned: usize,
    pub tokens_saved: usize,
    pub messages_summarized: usize,
    /// Usage after the pass.
    pub usage: ContextUsage,
}

/// Cumulative per-session statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionStats {
    pub passes: u64,
    pub prune_runs: u64,
    pub compactions: u64,
    pub outputs_pruned: u64,
    pub tokens_saved: u64,
    /// Times working memory had to be trimmed to fit.
    #[serde(default)]
    pub memory_trims: u64,
    pub last: Option<CompactionResult>,
}

/// Result of [`CompactionEngine::fit_working_memory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFit {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub outputs_pruned: usize,
    pub messages_dropped: usize,
}

impl MemoryFit {
    pub fn changed(&self) -> bool {
        self.outputs_pruned > 0 || self.messages_dropped > 0
    }
}

/// Options for one preparation pass.
#[derive(Debug, Clone, Copy)]
pub struct PrepareOptions<'a> {
    pub session_id: &'a str,
    pub model_id: &'a str,
    /// Run both stages regardless of usage.
    pub force: bool,
    /// Tokens held outside `messages` (system prompt, memory sections).
    pub reserved_tokens: usize,
}

impl<'a> PrepareOptions<'a> {
    pub fn new(session_id: &'a str, model_id: &'a str) -> Self {
        Self {
            session_id,
            model_id,
            force: false,
            reserved_tokens: 0,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_reserved_tokens(mut self, tokens: usize) -> Self {
        self.reserved_tokens = tokens;
        self
    }
}

/// Keeps conversations inside the active model's usable context.
pub struct CompactionEngine {
    counter: Arc<dyn TokenCounter>,
    summarizer: Option<Arc<dyn ChatModel>>,
    config: CompactionConfig,
    stats: Mutex<HashMap<String, CompactionStats>>,
}

impl CompactionEngine {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            counter: Arc::new(CharEstimator),
            summarizer: None,
            config,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Use `model` to write summaries instead of the extractive fallback.
    pub fn with_summarizer(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.summarizer = Some(model);
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    pub fn limits_for(&self, model_id: &str) -> ModelLimits {
        self.config.models.lookup(model_id)
    }

    /// A [`ContextBudget`] for `model_id` sharing this engine's counter.
    pub fn budget_for(&self, model_id: &str) -> ContextBudget {
        ContextBudget::new(self.limits_for(model_id)).with_counter(self.counter.clone())
    }

    /// Statistics recorded for `session_id`, if any pass has run.
    pub fn stats(&self, session_id: &str) -> Option<CompactionStats> {
        self.stats
            .lock()
            .ok()
            .and_then(|s| s.get(session_id).cloned())
    }

    /// Prune and, if still needed, compact `messages` for the next model call.
    pub async fn prepare_context_for_llm(
        &self,
        messages: &[Message],
        opts: PrepareOptions<'_>,
    ) -> (Vec<Message>, CompactionResult) {
        let limits = self.limits_for(opts.model_id);
        let counter = self.counter.as_ref();
        let tokens_before = total_tokens(counter, messages) + opts.reserved_tokens;
        let usage_before = ContextUsage::new(tokens_before, limits);

        let mut result = CompactionResult {
            stage: CompactionStage::None,
            tokens_before,
            tokens_after: tokens_before,
            outputs_pruned: 0,
            tokens_saved: 0,
            messages_summarized: 0,
            usage: usage_before,
        };

        if !opts.force && usage_before.usage_pct < self.config.trigger_ratio {
            self.record(opts.session_id, &result);
            return (messages.to_vec(), result);
        }

        debug!(
            session = opts.session_id,
            "Preparing context: {}",
            usage_before.to_log_string()
        );

        let pruned = prune_tool_outputs(counter, messages, &self.config.prune);
        let mut current = pruned.messages;
        if pruned.outputs_pruned > 0 {
            result.stage = CompactionStage::Pruned;
            result.outputs_pruned = pruned.outputs_pruned;
        }

        let after_prune = total_tokens(counter, &current) + opts.reserved_tokens;
        let usage_after_prune = ContextUsage::new(after_prune, limits);

        if opts.force || usage_after_prune.usage_pct >= self.config.hard_ceiling {
            if let Some((compacted, summarized)) = self.compact(&current, opts.model_id).await {
                current = compacted;
                result.stage = CompactionStage::Compacted;
                result.messages_summarized = summarized;
            } else {
                debug!(
                    session = opts.session_id,
                    "Compaction skipped: nothing old enough to summarize"
                );
            }
        }

        result.tokens_after = total_tokens(counter, &current) + opts.reserved_tokens;
        result.tokens_saved = tokens_before.saturating_sub(result.tokens_after);
        result.usage = ContextUsage::new(result.tokens_after, limits);

        if result.stage != CompactionStage::None {
            info!(
                session = opts.session_id,
                stage = ?result.stage,
                outputs_pruned = result.outputs_pruned,
                messages_summarized = result.messages_summarized,
                "Context reduced: {} -> {} tokens",
                result.tokens_before,
                result.tokens_after,
            );
        }
        if result.usage.usage_pct >= 1.0 {
            warn!(
                session = opts.session_id,
                "Context still over budget after compaction: {}",
                result.usage.to_log_string()
            );
        }

        self.record(opts.session_id, &result);
        (current, result)
    }

    /// Keep both memory layers within `budget` estimated tokens.
    ///
    /// Old tool outputs in working memory are redacted first, under the same
    /// rules as conversation pruning. If that is not enough the oldest working
    /// messages are dropped; the newest one is always kept.
    pub fn fit_working_memory(
        &self,
        session_id: &str,
        memory: &mut HierarchicalMemory,
        budget: usize,
    ) -> MemoryFit {
        let tokens_before = memory.estimate_tokens();
        let mut fit = MemoryFit {
            tokens_before,
            tokens_after: tokens_before,
            ..MemoryFit::default()
        };
        if tokens_before <= budget {
            return fit;
        }

        let pruned = prune_tool_outputs(self.counter.as_ref(), memory.get_context(), &self.config.prune);
        if pruned.outputs_pruned > 0 {
            fit.outputs_pruned = pruned.outputs_pruned;
            memory.replace_working(pruned.messages);
        }
        while memory.estimate_tokens() > budget && memory.get_context().len() > 1 {
            let keep = memory.get_context().len() - 1;
            fit.messages_dropped += memory.compact_working(keep);
        }
        fit.tokens_after = memory.estimate_tokens();

        info!(
            session = session_id,
            outputs_pruned = fit.outputs_pruned,
            messages_dropped = fit.messages_dropped,
            "Working memory trimmed: {} -> {} tokens (budget {budget})",
            fit.tokens_before,
            fit.tokens_after,
        );
        if fit.tokens_after > budget {
            warn!(session = session_id, tokens = fit.tokens_after, budget, "Working memory still over budget");
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.entry(session_id.to_string()).or_default().memory_trims += 1;
        }
        fit
    }

    /// Replace the oldest block with a summary. `None` when nothing can be
    /// summarized without touching leading system messages or the recent tail.
    async fn compact(&self, messages: &[Message], model_id: &str) -> Option<(Vec<Message>, usize)> {
        let lead = messages
            .iter()
            .take_while(|m| m.role == MessageRole::System)
            .count();
        let mut split = messages
            .len()
            .saturating_sub(self.config.keep_recent_messages)
            .max(lead);
        // Never start the kept tail with tool results whose call was summarized.
        while split > lead && messages.get(split).is_some_and(|m| m.role == MessageRole::Tool) {
            split -= 1;
        }
        if split <= lead {
            return None;
        }

        let block = &messages[lead..split];
        let summary = self.summarize(block, model_id).await;

        let mut out = Vec::with_capacity(messages.len() - block.len() + 1);
        out.extend_from_slice(&messages[..lead]);
        out.push(Message::summary(summary));
        out.extend_from_slice(&messages[split..]);
        Some((out, block.len()))
    }

    async fn summarize(&self, block: &[Message], model_id: &str) -> String {
        let Some(model) = &self.summarizer else {
            return extractive_summary(block);
        };

        let request_text = build_summarization_request(block);
        let prompt = [Message::user(request_text)];
        let request = ModelRequest {
            model: self.config.summary_model.as_deref().unwrap_or(model_id),
            system_prompt: SUMMARIZATION_PROMPT,
            messages: &prompt,
            tools: &[],
            step_limit: 1,
            max_tokens: self.config.max_summary_tokens,
        };

        match model.complete(&request).await {
            Ok(resp) => match resp.text.filter(|t| !t.trim().is_empty()) {
                Some(text) => text,
                None => {
                    warn!("Summarizer returned no text, using extractive summary");
                    extractive_summary(block)
                }
            },
            Err(e) => {
                warn!("Summarization failed, using extractive summary: {e}");
                extractive_summary(block)
            }
        }
    }

    fn record(&self, session_id: &str, result: &CompactionResult) {
        if let Ok(mut stats) = self.stats.lock() {
            let entry = stats.entry(session_id.to_string()).or_default();
            entry.passes += 1;
            if result.outputs_pruned > 0 {
                entry.prune_runs += 1;
                entry.outputs_pruned += result.outputs_pruned as u64;
            }
            if result.stage == CompactionStage::Compacted {
                entry.compactions += 1;
            }
            entry.tokens_saved += result.tokens_saved as u64;
            entry.last = Some(result.clone());
        }
    }
}

fn excerpt(s: &str, max_chars: usize) -> String {
    let flat = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        flat
    }
}

/// Format a block of messages for the summarizer. Earlier summaries inside
/// the block are lifted into an "existing summary" section for merging.
pub fn build_summarization_request(block: &[Message]) -> String {
    let mut content = String::new();

    let existing: Vec<String> = block
        .iter()
        .filter(|m| m.is_summary)
        .map(|m| m.text())
        .collect();
    if !existing.is_empty() {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(&existing.join("\n\n"));
        content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }

    for msg in block.iter().filter(|m| !m.is_summary) {
        let role = msg.role;
        for part in &msg.parts {
            match part {
                Part::Text { text } => content.push_str(&format!("[{role}]: {text}\n\n")),
                Part::ToolCall {
                    tool_name, input, ..
                } => content.push_str(&format!("[{role} -> {tool_name}]: {input}\n\n")),
                Part::ToolResult {
                    tool_name,
                    output,
                    is_error,
                    ..
                } => {
                    let label = if *is_error { "error" } else { "result" };
                    content.push_str(&format!(
                        "[{tool_name} {label}]: {}\n\n",
                        output_text(output)
                    ));
                }
            }
        }
    }
    content
}

/// Deterministic summary built from the block's own text.
pub fn extractive_summary(block: &[Message]) -> String {
    let mut lines = Vec::new();
    for msg in block {
        if msg.is_summary {
            lines.push(format!("- Earlier: {}", excerpt(&msg.text(), EXCERPT_CHARS * 2)));
            continue;
        }
        for part in &msg.parts {
            let line = match (msg.role, part) {
                (MessageRole::User, Part::Text { text }) => {
                    format!("- User asked: {}", excerpt(text, EXCERPT_CHARS))
                }
                (MessageRole::Assistant, Part::Text { text }) if !text.trim().is_empty() => {
                    format!("- Assistant: {}", excerpt(text, EXCERPT_CHARS))
                }
                (_, Part::ToolCall { tool_name, .. }) => format!("- Called {tool_name}"),
                (
                    _,
                    Part::ToolResult {
                        tool_name,
                        output,
                        is_error: true,
                        ..
                    },
                ) => format!(
                    "- {tool_name} failed: {}",
                    excerpt(&output_text(output), EXCERPT_CHARS)
                ),
                _ => continue,
            };
            lines.push(line);
        }
    }

    let omitted = lines.len().saturating_sub(MAX_EXTRACT_LINES);
    if omitted > 0 {
        lines.drain(..omitted);
        lines.insert(0, format!("- ({omitted} earlier entries omitted)"));
    }
    format!(
        "Summary of {} earlier messages:\n{}",
        block.len(),
        lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AgentError, ModelResponse};
    use serde_json::json;

    fn long_conversation(steps: usize, chars: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("rules"), Message::user("rebuild the blog")];
        for i in 0..steps {
            let id = format!("c{i}");
            msgs.push(Message::assistant(
                Some(format!("Step {i}")),
                vec![Part::tool_call(&id, "getPage", json!({"i": i}))],
            ));
            msgs.push(Message::tool(vec![Part::tool_result(
                &id,
                "getPage",
                json!("y".repeat(chars)),
                false,
            )]));
        }
        msgs
    }

    fn small_model_engine() -> CompactionEngine {
        CompactionEngine::new(
            CompactionConfig::new()
                .with_model_limits("test/small", ModelLimits::new(10_000, 2_000))
                .with_prune(PruneConfig::new().with_prune_minimum(100)),
        )
    }

    #[tokio::test]
    async fn below_trigger_does_nothing() {
        let engine = small_model_engine();
        let msgs = long_conversation(2, 100);
        let (out, result) = engine
            .prepare_context_for_llm(&msgs, PrepareOptions::new("s1", "test/small"))
            .await;
        assert_eq!(result.stage, CompactionStage::None);
        assert_eq!(out, msgs);
        assert_eq!(engine.stats("s1").unwrap().passes, 1);
    }

    #[tokio::test]
    async fn pruning_fires_above_trigger() {
        let engine = small_model_engine();
        // 12 steps of ~500 tokens = ~6,000 tokens of 8,000 usable.
        let msgs = long_conversation(12, 2000);
        let (out, result) = engine
            .prepare_context_for_llm(&msgs, PrepareOptions::new("s1", "test/small"))
            .await;
        assert_eq!(result.stage, CompactionStage::Pruned);
        assert_eq!(out.len(), msgs.len());
        assert_eq!(result.outputs_pruned, 10);
        assert!(result.tokens_after < result.tokens_before);
        assert!(result.usage.usage_pct < 0.95);
    }

    #[tokio::test]
    async fn force_compacts_with_extractive_fallback() {
        let engine = small_model_engine();
        let msgs = long_conversation(6, 100);
        let (out, result) = engine
            .prepare_context_for_llm(&msgs, PrepareOptions::new("s1", "test/small").with_force(true))
            .await;
        assert_eq!(result.stage, CompactionStage::Compacted);
        assert_eq!(out[0].role, MessageRole::System);
        assert!(out[1].is_summary);
        assert!(out[1].text().contains("User asked: rebuild the blog"));
        // The kept tail starts at an assistant call, never a bare tool result.
        assert_eq!(out[2].role, MessageRole::Assistant);
        assert_eq!(out.len(), 1 + 1 + 6);
        assert_eq!(result.messages_summarized, msgs.len() - 1 - 6);

        let stats = engine.stats("s1").unwrap();
        assert_eq!(stats.compactions, 1);
    }

    #[tokio::test]
    async fn compaction_keeps_tail_aligned_on_tool_boundary() {
        let engine = CompactionEngine::new(CompactionConfig::new().with_keep_recent_messages(3));
        let msgs = long_conversation(4, 10);
        // [sys, user, a0, t0, a1, t1, a2, t2, a3, t3]; len - 3 = 7 lands on t2.
        let (out, _) = engine
            .prepare_context_for_llm(&msgs, PrepareOptions::new("s", "x").with_force(true))
            .await;
        assert_eq!(out[2].role, MessageRole::Assistant);
        assert_eq!(out.len(), 2 + 4);
    }

    #[tokio::test]
    async fn nothing_to_compact_when_short() {
        let engine = CompactionEngine::new(CompactionConfig::new());
        let msgs = vec![Message::system("rules"), Message::user("hi")];
        let (out, result) = engine
            .prepare_context_for_llm(&msgs, PrepareOptions::new("s", "x").with_force(true))
            .await;
        assert_eq!(result.stage, CompactionStage::None);
        assert_eq!(out, msgs);
    }

    struct EchoSummarizer;

    #[async_trait::async_trait]
    impl ChatModel for EchoSummarizer {
        async fn complete(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, AgentError> {
            assert!(request.tools.is_empty());
            assert_eq!(request.model, "cheap/summarizer");
            Ok(ModelResponse::final_text("Pages a, b created."))
        }
    }

    struct FailingSummarizer;

    #[async_trait::async_trait]
    impl ChatModel for FailingSummarizer {
        async fn complete(&self, _: &ModelRequest<'_>) -> Result<ModelResponse, AgentError> {
            Err(AgentError::Model("HTTP 503".into()))
        }
    }

    #[tokio::test]
    async fn model_summary_used_when_available() {
        let engine = CompactionEngine::new(
            CompactionConfig::new().with_summary_model("cheap/summarizer"),
        )
        .with_summarizer(Arc::new(EchoSummarizer));
        let msgs = long_conversation(6, 10);
        let (out, _) = engine
            .prepare_context_for_llm(&msgs, PrepareOptions::new("s", "main").with_force(true))
            .await;
        assert_eq!(out[1].text(), "Pages a, b created.");
    }

    #[tokio::test]
    async fn summarizer_failure_falls_back() {
        let engine =
            CompactionEngine::new(CompactionConfig::new()).with_summarizer(Arc::new(FailingSummarizer));
        let msgs = long_conversation(6, 10);
        let (out, result) = engine
            .prepare_context_for_llm(&msgs, PrepareOptions::new("s", "main").with_force(true))
            .await;
        assert_eq!(result.stage, CompactionStage::Compacted);
        assert!(out[1].text().starts_with("Summary of"));
    }

    #[test]
    fn summarization_request_merges_existing_summary() {
        let block = vec![
            Message::summary("Created the About page."),
            Message::user("now the contact page"),
        ];
        let text = build_summarization_request(&block);
        assert!(text.starts_with("=== EXISTING SUMMARY ===\nCreated the About page."));
        assert!(text.contains("[user]: now the contact page"));
    }

    #[test]
    fn extractive_summary_reports_failures() {
        let block = vec![
            Message::assistant(None, vec![Part::tool_call("c1", "createPage", json!({}))]),
            Message::tool(vec![Part::tool_result(
                "c1",
                "createPage",
                json!("slug already exists"),
                true,
            )]),
        ];
        let summary = extractive_summary(&block);
        assert!(summary.contains("- Called createPage"));
        assert!(summary.contains("- createPage failed: slug already exists"));
    }

    #[test]
    fn extractive_summary_is_bounded() {
        let block: Vec<Message> = (0..100).map(|i| Message::user(format!("q{i}"))).collect();
        let summary = extractive_summary(&block);
        assert!(summary.contains("(60 earlier entries omitted)"));
        assert!(summary.contains("q99"));
        assert!(!summary.contains("q0\n"));
    }

    #[test]
    fn working_memory_is_fitted_to_budget() {
        let engine = small_model_engine();
        let mut memory = HierarchicalMemory::new();
        for message in long_conversation(20, 8000) {
            memory.add_message(message);
        }
        let budget = engine.limits_for("test/small").usable();
        assert!(memory.estimate_tokens() > budget);

        let fit = engine.fit_working_memory("s1", &mut memory, budget);
        assert!(fit.changed());
        assert!(fit.outputs_pruned > 0);
        assert!(fit.tokens_after <= budget);
        assert_eq!(memory.estimate_tokens(), fit.tokens_after);
        assert_eq!(engine.stats("s1").unwrap().memory_trims, 1);

        // Recent results survive verbatim.
        let last = memory.get_context().last().unwrap();
        assert!(!last.parts.iter().any(Part::is_compacted));
    }

    #[test]
    fn oldest_messages_go_when_redaction_is_not_enough() {
        let engine = CompactionEngine::new(CompactionConfig::new().with_prune(PruneConfig::disabled()));
        let mut memory = HierarchicalMemory::new();
        for i in 0..10 {
            memory.add_message(Message::assistant_text(format!("{i}{}", "z".repeat(399))));
        }
        let fit = engine.fit_working_memory("s1", &mut memory, 450);
        assert_eq!(fit.outputs_pruned, 0);
        assert_eq!(fit.messages_dropped, 6);
        assert_eq!(memory.get_context().len(), 4);
        assert!(memory.get_context()[0].text().starts_with('6'));
        assert!(fit.tokens_after <= 450);
    }

    #[test]
    fn memory_within_budget_is_untouched() {
        let engine = small_model_engine();
        let mut memory = HierarchicalMemory::new();
        memory.add_message(Message::user("hello"));
        let fit = engine.fit_working_memory("s1", &mut memory, 100);
        assert!(!fit.changed());
        assert_eq!(memory.get_context().len(), 1);
        assert!(engine.stats("s1").is_none());
    }
}
