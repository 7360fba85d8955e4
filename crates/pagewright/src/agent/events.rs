//! Events, handlers, and turn results for the [`Controller`](super::controller::Controller).
//!
//! The controller reports every decision of a turn through
//! [`ControllerEvent`] variants. Callers implement [`EventHandler`] to
//! observe them for logging, UI, metrics, or human approval of tool calls.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget turns |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Full control (approval gates, UI) |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::Message;
use crate::agent::memory::MemoryState;
use crate::agent::phase::Phase;
use crate::context::budget::ContextUsage;
use crate::context::compaction::{CompactionResult, CompactionStage};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the controller during a turn.
#[derive(Debug)]
pub enum ControllerEvent<'a> {
    TurnStarted {
        session_id: &'a str,
        trace_id: &'a str,
        mode: &'a str,
        max_steps: u32,
        /// Step restored from a checkpoint, when resuming.
        resumed_from: Option<u32>,
    },
    /// A step is about to call the model. Handlers may answer with
    /// [`EventResponse::InjectMessage`] to add a user message first.
    StepStart {
        step: u32,
        max_steps: u32,
        usage: &'a ContextUsage,
    },
    /// Pruning or compaction ran before this step.
    Compaction(&'a CompactionResult),
    /// The model returned text (may be alongside tool calls).
    Text(&'a str),
    ToolCallsReceived { step: u32, count: usize },
    /// A tool call needs human approval. Answer with
    /// [`EventResponse::Approve`] or [`EventResponse::Deny`]; `None` approves.
    ApprovalRequired { name: &'a str, input: &'a Value },
    ToolExecuting {
        name: &'a str,
        call_id: &'a str,
        input: &'a Value,
    },
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        output: &'a Value,
        is_error: bool,
    },
    /// A failed call is being retried after `delay_ms`.
    ToolRetry {
        name: &'a str,
        attempt: u32,
        delay_ms: u64,
    },
    /// A call was rejected because the tool's circuit is open.
    CircuitOpen { name: &'a str },
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    PhaseChanged { from: Phase, to: Phase },
    SubgoalsPlanned { subgoals: &'a [String] },
    SubgoalCompleted { label: &'a str },
    CheckpointSaved { step: u32 },
    CheckpointFailed { step: u32, error: &'a str },
    CheckpointResumed { step: u32 },
    /// The model answered without tool calls.
    Finished { step: u32 },
    /// The turn stopped at the mode's step limit.
    StepLimitReached { max_steps: u32 },
    Cancelled { step: u32 },
}

/// Response from an event handler for events that support feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    /// Approve the pending tool call.
    Approve,
    /// Deny the pending tool call with a reason (passed back to the model).
    Deny(String),
    /// Inject a user message before the next model call.
    InjectMessage(String),
}

/// Handler for controller events.
///
/// Most events are informational and the return value is ignored. For
/// [`ControllerEvent::ApprovalRequired`] the return value decides whether
/// the tool runs; for [`ControllerEvent::StepStart`] it may inject a
/// message. The default implementation returns `None`.
///
/// # Example
///
/// ```ignore
/// struct NoDeletes;
///
/// impl EventHandler for NoDeletes {
///     fn on_event(&self, event: &ControllerEvent<'_>) -> Option<EventResponse> {
///         match event {
///             ControllerEvent::ApprovalRequired { name, .. } if name.starts_with("delete") => {
///                 Some(EventResponse::Deny("Deleting is not allowed today.".into()))
///             }
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ControllerEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

/// A no-op event handler that auto-approves all tool calls.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let ControllerEvent::Text(text) = event {
///         println!("{text}");
///     }
///     None
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&ControllerEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&ControllerEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&ControllerEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &ControllerEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// Delegates to multiple handlers in registration order. The first
/// non-`None` response wins, but every handler sees every event.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(approval_gate);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &ControllerEvent<'_>) -> Option<EventResponse> {
        let mut first = None;
        for handler in &self.handlers {
            let response = handler.on_event(event);
            if first.is_none() {
                first = response;
            }
        }
        first
    }
}

fn preview(text: &str, max: usize) -> String {
    let mut s: String = text.chars().take(max).collect();
    if text.chars().count() > max {
        s.push_str("...");
    }
    s
}

/// An event handler that logs events via `tracing`. Approval requests are
/// logged and left to other handlers.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ControllerEvent<'_>) -> Option<EventResponse> {
        match event {
            ControllerEvent::TurnStarted {
                session_id,
                trace_id,
                mode,
                max_steps,
                resumed_from,
            } => {
                info!(session_id, trace_id, mode, max_steps, ?resumed_from, "Turn started");
            }
            ControllerEvent::StepStart {
                step,
                max_steps,
                usage,
            } => {
                info!("[step {}/{}] {}", step, max_steps, usage.to_log_string());
            }
            ControllerEvent::Compaction(result) => {
                info!(
                    stage = ?result.stage,
                    before = result.tokens_before,
                    after = result.tokens_after,
                    pruned = result.outputs_pruned,
                    summarized = result.messages_summarized,
                    "Context reduced"
                );
            }
            ControllerEvent::Text(text) => {
                debug!("Model text: {}", preview(text, 200));
            }
            ControllerEvent::ToolCallsReceived { step, count } => {
                debug!("{count} tool call(s) in step {step}");
            }
            ControllerEvent::ApprovalRequired { name, .. } => {
                info!("Approval required for tool: {name}");
            }
            ControllerEvent::ToolExecuting { name, call_id, .. } => {
                debug!("Executing tool {name} ({call_id})");
            }
            ControllerEvent::ToolResult {
                name,
                output,
                is_error,
                ..
            } => {
                if *is_error {
                    warn!("Tool {name} failed: {}", preview(&output.to_string(), 200));
                } else {
                    debug!("Tool {name} result: {} bytes", output.to_string().len());
                }
            }
            ControllerEvent::ToolRetry {
                name,
                attempt,
                delay_ms,
            } => {
                info!("Retrying {name} (attempt {attempt}) in {delay_ms}ms");
            }
            ControllerEvent::CircuitOpen { name } => {
                warn!("Circuit open, call to {name} rejected");
            }
            ControllerEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            ControllerEvent::PhaseChanged { from, to } => {
                info!("Phase: {from} -> {to}");
            }
            ControllerEvent::SubgoalsPlanned { subgoals } => {
                info!("Planned {} subgoal(s)", subgoals.len());
            }
            ControllerEvent::SubgoalCompleted { label } => {
                info!("Subgoal completed: {label}");
            }
            ControllerEvent::CheckpointSaved { step } => {
                debug!("Checkpoint saved at step {step}");
            }
            ControllerEvent::CheckpointFailed { step, error } => {
                warn!("Checkpoint at step {step} failed: {error}");
            }
            ControllerEvent::CheckpointResumed { step } => {
                info!("Resumed from checkpoint at step {step}");
            }
            ControllerEvent::Finished { step } => {
                info!("Turn finished at step {step}");
            }
            ControllerEvent::StepLimitReached { max_steps } => {
                info!("Step limit reached ({max_steps}), returning partial result");
            }
            ControllerEvent::Cancelled { step } => {
                warn!("Turn cancelled at step {step}");
            }
        }
        None
    }
}

// ── Turn result ────────────────────────────────────────────────────

/// One tool call as it happened within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    pub is_error: bool,
    /// Rejected by an open circuit without reaching the tool.
    #[serde(default)]
    pub circuit_open: bool,
    /// Denied by the approval handler.
    #[serde(default)]
    pub denied: bool,
    /// Executions including retries; 0 when the tool never ran.
    pub attempts: u32,
}

/// Trace entry for one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub phase: Phase,
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub compaction: CompactionStage,
    pub checkpointed: bool,
}

/// The result of one turn.
///
/// `finished` is `false` when the turn stopped at the step limit; that is a
/// partial result, not an error.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub session_id: String,
    pub trace_id: String,
    pub final_text: String,
    pub steps: Vec<StepRecord>,
    /// The full conversation after the turn.
    pub messages: Vec<Message>,
    pub finished: bool,
    pub step_limit_reached: bool,
    pub phase: Phase,
    pub completion_pct: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Both memory layers at the end of the turn.
    pub memory: MemoryState,
    /// Checkpoint and history writes that failed during the turn. None of
    /// them aborted it.
    pub persistence_errors: Vec<String>,
}

impl TurnResult {
    pub fn steps_used(&self) -> u32 {
        self.steps.last().map_or(0, |s| s.step)
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn composite_returns_first_response_and_notifies_all() {
        let seen = Arc::new(AtomicU32::new(0));
        let s1 = seen.clone();
        let s2 = seen.clone();
        let handler = CompositeEventHandler::new()
            .with(LoggingHandler)
            .with(FnEventHandler::new(move |_| {
                s1.fetch_add(1, Ordering::SeqCst);
                Some(EventResponse::Deny("no".into()))
            }))
            .with(FnEventHandler::new(move |_| {
                s2.fetch_add(1, Ordering::SeqCst);
                Some(EventResponse::Approve)
            }));

        let input = serde_json::json!({});
        let response = handler.on_event(&ControllerEvent::ApprovalRequired {
            name: "deletePage",
            input: &input,
        });
        assert_eq!(response, Some(EventResponse::Deny("no".into())));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn logging_and_noop_do_not_answer() {
        let input = serde_json::json!({});
        let event = ControllerEvent::ApprovalRequired {
            name: "x",
            input: &input,
        };
        assert!(LoggingHandler.on_event(&event).is_none());
        assert!(NoopHandler.on_event(&event).is_none());
        assert!(
            CompositeEventHandler::new()
                .with_if(false, LoggingHandler)
                .on_event(&event)
                .is_none()
        );
    }

    #[test]
    fn preview_truncates_on_chars() {
        assert_eq!(preview("héllo", 2), "hé...");
        assert_eq!(preview("hi", 5), "hi");
    }
}
