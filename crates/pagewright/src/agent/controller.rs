//! The step-bounded tool-calling loop.
//!
//! A [`Controller`] runs one user turn as a sequence of model steps. Each
//! step, in order:
//!
//! 1. folds the previous step's assistant message and tool results into
//!    working memory,
//! 2. prunes or compacts the conversation when it no longer fits the model,
//! 3. calls the model with the turn's active tool subset,
//! 4. runs the requested tools (approval, circuit check, retries),
//! 5. tags the step with a phase and updates subgoals,
//! 6. saves a checkpoint when one is due.
//!
//! The turn ends when the model answers without tool calls or when the mode's
//! step limit is reached. Reaching the limit is a partial result, not an
//! error. Tool failures never end a turn; model failures and cancellation do.
//!
//! # Example
//!
//! ```ignore
//! let runtime = Runtime::new(model, tools, store);
//! let config = ControllerConfig::new("anthropic/claude-sonnet-4", "You edit a website.");
//! let result = Controller::new(&runtime, config)
//!     .with_event_handler(&LoggingHandler)
//!     .execute(&[], "Create an About page", "act")
//!     .await?;
//! println!("{}", result.final_text);
//! ```

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::{Checkpoint, CheckpointParams};
use super::config::{ControllerConfig, ModeConfig};
use super::events::{
    ControllerEvent, EventHandler, EventResponse, NoopHandler, StepRecord, TurnResult,
};
use super::execution::{self, ToolCallOutcome};
use super::memory::HierarchicalMemory;
use super::phase::{self, Phase};
use super::runtime::Runtime;
use super::session::{SessionStatus, validate_session_id};
use crate::api::tracing::{TokenTally, generate_session_id, generate_trace_id};
use crate::context::budget::{message_tokens, output_text};
use crate::context::compaction::{CompactionStage, PrepareOptions};
use crate::tools::core::ToolContext;
use crate::tools::discovery::SearchOptions;
use crate::{AgentError, Message, MessageRole, ModelRequest, Part, ToolDef};

/// Mutable state of one turn.
struct TurnState {
    session_id: String,
    trace_id: String,
    mode: ModeConfig,
    allowed: Vec<String>,
    tool_defs: Vec<ToolDef>,
    messages: Vec<Message>,
    memory: HierarchicalMemory,
    /// Last completed step.
    step: u32,
    phase: Phase,
    /// Messages of the last completed step not yet folded into memory.
    pending_fold: Vec<Message>,
    last_tool_result: Option<Value>,
    final_text: String,
    tally: TokenTally,
    steps: Vec<StepRecord>,
    persistence_errors: Vec<String>,
}

pub struct Controller<'a> {
    runtime: &'a Runtime,
    config: ControllerConfig,
    handler: &'a dyn EventHandler,
    cancel: CancellationToken,
    session_id: Option<String>,
}

impl<'a> Controller<'a> {
    pub fn new(runtime: &'a Runtime, config: ControllerConfig) -> Self {
        Self {
            runtime,
            config,
            handler: &NoopHandler,
            cancel: CancellationToken::new(),
            session_id: None,
        }
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Cancel the turn through `token`. The turn stops at the next model call
    /// or tool execution boundary.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Continue an existing session instead of generating a new id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // ── Entry points ──────────────────────────────────────────────

    /// Run one user turn in `mode`.
    pub async fn execute(
        &self,
        prior: &[Message],
        user_message: &str,
        mode: &str,
    ) -> Result<TurnResult, AgentError> {
        let mode = self.config.mode(mode)?.clone();
        let session_id = match &self.session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.clone()
            }
            None => generate_session_id(),
        };

        let allowed = self.select_tools(&mode, user_message).await;
        let user = Message::user(user_message);
        let mut messages = prior.to_vec();
        messages.push(user.clone());

        let state = TurnState {
            tool_defs: self.runtime.tools().definitions_for(&allowed),
            session_id,
            trace_id: generate_trace_id(),
            mode,
            allowed,
            messages,
            memory: HierarchicalMemory::new(),
            step: 0,
            phase: Phase::Unknown,
            pending_fold: vec![user],
            last_tool_result: None,
            final_text: String::new(),
            tally: TokenTally::new(),
            steps: Vec::new(),
            persistence_errors: Vec::new(),
        };

        self.handler.on_event(&ControllerEvent::TurnStarted {
            session_id: &state.session_id,
            trace_id: &state.trace_id,
            mode: &state.mode.name,
            max_steps: state.mode.max_steps,
            resumed_from: None,
        });
        self.mark_status(&state.session_id, SessionStatus::Running).await;
        self.run(state).await
    }

    /// Continue a session from its last checkpoint under a new trace id.
    pub async fn resume(&self, session_id: &str) -> Result<TurnResult, AgentError> {
        validate_session_id(session_id)?;
        let checkpoint = self
            .runtime
            .checkpoints()
            .restore(session_id)
            .await?
            .ok_or_else(|| AgentError::CheckpointNotFound(session_id.to_string()))?;

        let mode = match self.config.mode(&checkpoint.mode) {
            Ok(mode) => mode.clone(),
            Err(_) => {
                warn!(
                    mode = %checkpoint.mode,
                    fallback = %self.config.default_mode,
                    "Checkpoint mode no longer configured"
                );
                self.config.mode(&self.config.default_mode)?.clone()
            }
        };

        let query = checkpoint
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(Message::text)
            .unwrap_or_default();
        let allowed = self.select_tools(&mode, &query).await;

        let mut memory = HierarchicalMemory::new();
        memory.restore_state(checkpoint.memory);

        let state = TurnState {
            tool_defs: self.runtime.tools().definitions_for(&allowed),
            session_id: checkpoint.session_id,
            trace_id: generate_trace_id(),
            mode,
            allowed,
            messages: checkpoint.messages,
            memory,
            step: checkpoint.step,
            phase: checkpoint.phase,
            pending_fold: checkpoint.unfolded_step,
            last_tool_result: checkpoint.last_tool_result,
            final_text: String::new(),
            tally: TokenTally::new(),
            steps: Vec::new(),
            persistence_errors: Vec::new(),
        };

        info!(
            session_id = %state.session_id,
            previous_trace = %checkpoint.trace_id,
            trace_id = %state.trace_id,
            step = state.step,
            "Resuming from checkpoint"
        );
        self.handler.on_event(&ControllerEvent::TurnStarted {
            session_id: &state.session_id,
            trace_id: &state.trace_id,
            mode: &state.mode.name,
            max_steps: state.mode.max_steps,
            resumed_from: Some(state.step),
        });
        self.handler
            .on_event(&ControllerEvent::CheckpointResumed { step: state.step });
        self.mark_status(&state.session_id, SessionStatus::Running).await;

        let already_answered = state
            .messages
            .last()
            .is_some_and(|m| m.role == MessageRole::Assistant && !m.has_tool_calls());
        if already_answered {
            let mut state = state;
            self.fold_pending(&mut state);
            state.final_text = state.messages.last().map(Message::text).unwrap_or_default();
            debug!(session_id = %state.session_id, "Checkpoint already holds a final answer");
            return Ok(self.finish(state, true, false).await);
        }

        self.run(state).await
    }

    // ── Loop ──────────────────────────────────────────────────────

    async fn run(&self, mut st: TurnState) -> Result<TurnResult, AgentError> {
        let max_steps = st.mode.max_steps;
        let compaction = self.runtime.compaction();
        let budget = compaction.budget_for(&self.config.model);

        loop {
            if st.step >= max_steps {
                info!(session_id = %st.session_id, max_steps, "Step limit reached");
                self.handler
                    .on_event(&ControllerEvent::StepLimitReached { max_steps });
                self.fold_pending(&mut st);
                return Ok(self.finish(st, false, true).await);
            }
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(&st).await);
            }

            let step = st.step + 1;
            self.fold_pending(&mut st);

            let system_prompt = self.system_prompt(&st);
            let reserved = compaction.counter().count(&system_prompt);
            let opts = PrepareOptions::new(&st.session_id, &self.config.model)
                .with_reserved_tokens(reserved);
            let (prepared, pass) = compaction.prepare_context_for_llm(&st.messages, opts).await;
            if pass.stage != CompactionStage::None {
                self.handler.on_event(&ControllerEvent::Compaction(&pass));
                st.messages = prepared;
                if pass.stage == CompactionStage::Compacted {
                    let dropped = st.memory.compact_working(self.config.working_memory_keep);
                    debug!(dropped, "Working memory trimmed after compaction");
                }
            }

            let response = self.handler.on_event(&ControllerEvent::StepStart {
                step,
                max_steps,
                usage: &pass.usage,
            });
            if let Some(EventResponse::InjectMessage(text)) = response {
                st.messages.push(Message::user(text));
            }

            // ── Model call ──
            debug!(
                session_id = %st.session_id,
                step,
                tools = st.tool_defs.len(),
                "{}",
                pass.usage.to_log_string()
            );
            let request = ModelRequest {
                model: &self.config.model,
                system_prompt: &system_prompt,
                messages: &st.messages,
                tools: &st.tool_defs,
                step_limit: max_steps,
                max_tokens: self.config.max_tokens,
            };
            let reply = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = self.runtime.model().complete(&request) => Some(r),
            };
            let Some(reply) = reply else {
                return Err(self.cancelled(&st).await);
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(session_id = %st.session_id, step, error = %e, "Model call failed");
                    self.mark_status(&st.session_id, SessionStatus::Interrupted).await;
                    return Err(e);
                }
            };

            if let Some(usage) = &reply.usage {
                st.tally.record(usage);
                self.handler.on_event(&ControllerEvent::TokenUsage {
                    prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                    completion_tokens: usage.completion_tokens.unwrap_or(0),
                });
            }
            let text = reply.text.clone().unwrap_or_default();
            if !text.is_empty() {
                self.handler.on_event(&ControllerEvent::Text(&text));
                st.final_text = text.clone();
            }
            let has_calls = !reply.tool_calls.is_empty();

            // ── Tools ──
            let mut record = StepRecord {
                step,
                phase: st.phase,
                text: (!text.is_empty()).then(|| text.clone()),
                tool_calls: Vec::new(),
                compaction: pass.stage,
                checkpointed: false,
            };
            let mut had_error = false;

            if has_calls {
                self.handler.on_event(&ControllerEvent::ToolCallsReceived {
                    step,
                    count: reply.tool_calls.len(),
                });

                let approval_pending = reply
                    .tool_calls
                    .iter()
                    .any(|c| execution::needs_approval(self.runtime, &self.config, &c.name));
                if approval_pending {
                    self.checkpoint(&mut st).await;
                }

                let ctx = ToolContext::new(&st.session_id, &st.trace_id, step);
                let outcomes = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    o = execution::execute_tool_calls(
                        self.runtime,
                        &self.config,
                        self.handler,
                        &reply.tool_calls,
                        &st.allowed,
                        &ctx,
                    ) => Some(o),
                };
                let Some(outcomes) = outcomes else {
                    return Err(self.cancelled(&st).await);
                };

                had_error = outcomes.iter().any(|o| o.record.is_error);
                st.last_tool_result = outcomes.last().and_then(ToolCallOutcome::output).cloned();
                record.tool_calls = outcomes.iter().map(|o| o.record.clone()).collect();

                let calls: Vec<Part> = reply
                    .tool_calls
                    .iter()
                    .map(|c| Part::tool_call(&c.id, &c.name, c.input.clone()))
                    .collect();
                let assistant = Message::assistant(reply.text.clone(), calls);
                st.messages.push(assistant.clone());

                let mut results: Vec<Part> = outcomes.into_iter().map(|o| o.part).collect();
                let pending = message_tokens(budget.counter(), &Message::tool(results.clone()));
                let usage = budget.estimate_usage(&st.messages, reserved + pending);
                if let Some(advisory) = budget.advisory(&usage) {
                    append_advisory(&mut results, &advisory);
                }
                let tool_message = Message::tool(results);
                st.messages.push(tool_message.clone());
                st.pending_fold = vec![assistant, tool_message];
            } else {
                let answer = Message::assistant_text(&text);
                st.messages.push(answer.clone());
                st.pending_fold = vec![answer];
            }

            // ── Phase and subgoals ──
            let previous_phase = st.phase;
            let detected = phase::detect_phase(&text, has_calls);
            let current = if detected == Phase::Unknown {
                previous_phase
            } else {
                detected
            };
            if current != previous_phase {
                debug!(from = %previous_phase, to = %current, "Phase changed");
                self.handler.on_event(&ControllerEvent::PhaseChanged {
                    from: previous_phase,
                    to: current,
                });
            }
            st.phase = current;
            record.phase = current;

            match current {
                Phase::Planning => {
                    let planned: Vec<String> = phase::extract_subgoals(&text)
                        .into_iter()
                        .filter(|goal| st.memory.add_subgoal(goal.clone()))
                        .collect();
                    if !planned.is_empty() {
                        self.handler
                            .on_event(&ControllerEvent::SubgoalsPlanned { subgoals: &planned });
                    }
                }
                Phase::Executing if has_calls && !had_error => {
                    if let Some(label) = st.memory.complete_current() {
                        self.handler
                            .on_event(&ControllerEvent::SubgoalCompleted { label: &label });
                    }
                }
                _ => {}
            }

            // ── Checkpoint ──
            st.step = step;
            let params = CheckpointParams {
                step,
                phase: current,
                previous_phase,
                needs_approval: false,
                is_after_error: had_error,
            };
            if self.runtime.checkpoints().should_checkpoint(&params) {
                record.checkpointed = self.checkpoint(&mut st).await;
            }
            st.steps.push(record);

            if !has_calls {
                info!(session_id = %st.session_id, step, "Model answered, turn finished");
                self.handler.on_event(&ControllerEvent::Finished { step });
                self.fold_pending(&mut st);
                return Ok(self.finish(st, true, false).await);
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────────

    /// Move the previous step's messages into working memory, then keep
    /// memory within the model's usable window.
    fn fold_pending(&self, st: &mut TurnState) {
        if st.pending_fold.is_empty() {
            return;
        }
        for message in st.pending_fold.drain(..) {
            st.memory.add_message(message);
        }
        let compaction = self.runtime.compaction();
        let usable = compaction.limits_for(&self.config.model).usable();
        let fit = compaction.fit_working_memory(&st.session_id, &mut st.memory, usable);
        if fit.changed() {
            debug!(
                session_id = %st.session_id,
                pruned = fit.outputs_pruned,
                dropped = fit.messages_dropped,
                "Working memory fitted to {usable} tokens"
            );
        }
    }

    fn system_prompt(&self, st: &TurnState) -> String {
        let base = self.config.system_prompt_for(&st.mode);
        let plan = st.memory.to_prompt_section();
        if plan.is_empty() {
            base
        } else {
            format!("{}\n\n{}", base.trim_end(), plan.trim_end())
        }
    }

    /// The mode's tool subset, narrowed by the discovery index when enabled.
    async fn select_tools(&self, mode: &ModeConfig, query: &str) -> Vec<String> {
        let subset = mode.tools.resolve(self.runtime.tools());
        let (Some(narrowing), Some(index)) =
            (self.config.discovery.active(), self.runtime.discovery())
        else {
            return subset;
        };
        if query.trim().is_empty() {
            return subset;
        }

        let opts = SearchOptions {
            expand_related: narrowing.expand_related,
            force_vector: false,
        };
        let ranked = index.search(query, narrowing.limit, opts).await;
        let narrowed: Vec<String> = subset
            .iter()
            .filter(|name| {
                ranked.iter().any(|r| &r.name == *name) || narrowing.always_include.contains(name)
            })
            .cloned()
            .collect();

        if narrowed.is_empty() {
            debug!(mode = %mode.name, "Discovery matched no allowed tools, keeping full subset");
            subset
        } else {
            info!(
                mode = %mode.name,
                kept = narrowed.len(),
                of = subset.len(),
                "Tool set narrowed by discovery"
            );
            narrowed
        }
    }

    /// Save a checkpoint of the last completed step. Failures are reported
    /// and recorded but never end the turn.
    async fn checkpoint(&self, st: &mut TurnState) -> bool {
        let checkpoint = Checkpoint {
            session_id: st.session_id.clone(),
            trace_id: st.trace_id.clone(),
            phase: st.phase,
            mode: st.mode.name.clone(),
            step: st.step,
            messages: st.messages.clone(),
            memory: st.memory.get_state(),
            current_subgoal: st.memory.current_subgoal().map(String::from),
            completed_subgoals: st.memory.completed_subgoals(),
            last_tool_result: st.last_tool_result.clone(),
            token_estimate: st.memory.estimate_tokens(),
            completion_pct: self.completion_pct(st, false),
            unfolded_step: st.pending_fold.clone(),
            saved_at: Utc::now(),
        };
        match self.runtime.checkpoints().save(&checkpoint).await {
            Ok(()) => {
                self.handler
                    .on_event(&ControllerEvent::CheckpointSaved { step: st.step });
                true
            }
            Err(e) => {
                let error = e.to_string();
                warn!(session_id = %st.session_id, step = st.step, %error, "Checkpoint save failed");
                self.handler.on_event(&ControllerEvent::CheckpointFailed {
                    step: st.step,
                    error: &error,
                });
                st.persistence_errors.push(error);
                false
            }
        }
    }

    fn completion_pct(&self, st: &TurnState, finished: bool) -> f64 {
        if finished {
            return 100.0;
        }
        match st.memory.subgoal_progress() {
            Some(progress) => progress * 100.0,
            None if st.mode.max_steps > 0 => {
                (f64::from(st.step) / f64::from(st.mode.max_steps) * 100.0).min(100.0)
            }
            None => 0.0,
        }
    }

    async fn finish(&self, mut st: TurnState, finished: bool, step_limit_reached: bool) -> TurnResult {
        self.mark_status(&st.session_id, SessionStatus::Completed).await;
        if let Err(e) = self.runtime.store().set_messages(&st.session_id, &st.messages).await {
            warn!(session_id = %st.session_id, error = %e, "Saving message history failed");
            st.persistence_errors.push(e.to_string());
        }
        info!(
            session_id = %st.session_id,
            trace_id = %st.trace_id,
            steps = st.step,
            finished,
            "Turn complete, {}",
            st.tally.summary()
        );

        TurnResult {
            completion_pct: self.completion_pct(&st, finished),
            prompt_tokens: u32::try_from(st.tally.prompt_tokens).unwrap_or(u32::MAX),
            completion_tokens: u32::try_from(st.tally.completion_tokens).unwrap_or(u32::MAX),
            memory: st.memory.get_state(),
            session_id: st.session_id,
            trace_id: st.trace_id,
            final_text: st.final_text,
            steps: st.steps,
            messages: st.messages,
            finished,
            step_limit_reached,
            phase: st.phase,
            persistence_errors: st.persistence_errors,
        }
    }

    /// Leave state as of the last completed step and report the cancellation.
    async fn cancelled(&self, st: &TurnState) -> AgentError {
        warn!(session_id = %st.session_id, step = st.step, "Turn cancelled");
        self.mark_status(&st.session_id, SessionStatus::Interrupted).await;
        self.handler
            .on_event(&ControllerEvent::Cancelled { step: st.step });
        AgentError::Cancelled { step: st.step }
    }

    async fn mark_status(&self, session_id: &str, status: SessionStatus) {
        if let Err(e) = self.runtime.store().mark_status(session_id, status).await {
            warn!(session_id, %status, error = %e, "Updating session status failed");
        }
    }
}

/// Append a context advisory to the last tool result of a step.
fn append_advisory(results: &mut [Part], advisory: &str) {
    if let Some(Part::ToolResult { output, .. }) = results.last_mut() {
        *output = Value::String(format!("{}\n\n{advisory}", output_text(output)));
    }
}
