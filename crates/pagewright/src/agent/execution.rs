//! Per-step tool dispatch: approval gates, circuit checks, timeout retries,
//! and conversion of failures into observations.
//!
//! Called by the [`Controller`](super::controller::Controller) once per step
//! that requested tools. Nothing here returns an error: every outcome,
//! including denial and open circuits, becomes a `tool-result` part the model
//! can read.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::config::ControllerConfig;
use super::events::{ControllerEvent, EventHandler, EventResponse, ToolCallRecord};
use super::runtime::Runtime;
use crate::tools::core::ToolContext;
use crate::tools::recovery::{ErrorCategory, ErrorRecoveryManager};
use crate::tools::reflection::format_with_error;
use crate::{Part, ToolCallRequest};

/// Result of one tool call within a step.
#[derive(Debug, Clone)]
pub(crate) struct ToolCallOutcome {
    pub part: Part,
    pub record: ToolCallRecord,
}

impl ToolCallOutcome {
    fn error(call: &ToolCallRequest, observation: String) -> Self {
        Self {
            part: Part::tool_result(&call.id, &call.name, Value::String(observation), true),
            record: ToolCallRecord {
                call_id: call.id.clone(),
                name: call.name.clone(),
                is_error: true,
                circuit_open: false,
                denied: false,
                attempts: 0,
            },
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.part {
            Part::ToolResult { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Whether a call to `name` must be approved before it runs.
pub(crate) fn needs_approval(runtime: &Runtime, config: &ControllerConfig, name: &str) -> bool {
    config.approval_required_tools.iter().any(|t| t == name)
        || runtime.tools().requires_confirmation(name)
}

// ── Dispatch ──────────────────────────────────────────────────────

/// Execute one step's tool calls. Outcomes come back in call order.
///
/// Approval is asked sequentially before anything runs. Approved calls then
/// run concurrently, or one at a time when `sequential_tools` is set.
pub(crate) async fn execute_tool_calls(
    runtime: &Runtime,
    config: &ControllerConfig,
    handler: &dyn EventHandler,
    calls: &[ToolCallRequest],
    allowed: &[String],
    ctx: &ToolContext,
) -> Vec<ToolCallOutcome> {
    let mut slots: Vec<Option<ToolCallOutcome>> = Vec::with_capacity(calls.len());
    let mut approved: Vec<(usize, &ToolCallRequest)> = Vec::new();

    for (idx, call) in calls.iter().enumerate() {
        if !allowed.iter().any(|n| n == &call.name) {
            warn!(tool = %call.name, "Model called a tool outside the active set");
            let class = runtime.recovery().classify("not found");
            let message = format!("tool '{}' not found in the active tool set", call.name);
            let observation = format_with_error(&call.name, &call.input, &class, Some(&message));
            slots.push(Some(ToolCallOutcome::error(call, observation)));
            continue;
        }

        if needs_approval(runtime, config, &call.name) {
            let response = handler.on_event(&ControllerEvent::ApprovalRequired {
                name: &call.name,
                input: &call.input,
            });
            if let Some(EventResponse::Deny(reason)) = response {
                info!(tool = %call.name, %reason, "Tool call denied");
                let mut outcome =
                    ToolCallOutcome::error(call, format!("Tool call denied: {reason}"));
                outcome.record.denied = true;
                slots.push(Some(outcome));
                continue;
            }
        }

        slots.push(None);
        approved.push((idx, call));
    }

    let finished: Vec<(usize, ToolCallOutcome)> = if config.sequential_tools || approved.len() < 2 {
        let mut out = Vec::with_capacity(approved.len());
        for (idx, call) in approved {
            out.push((idx, run_call(runtime, config, handler, call, ctx).await));
        }
        out
    } else {
        let futures = approved.into_iter().map(|(idx, call)| async move {
            (idx, run_call(runtime, config, handler, call, ctx).await)
        });
        futures::future::join_all(futures).await
    };

    for (idx, outcome) in finished {
        if let Some(slot) = slots.get_mut(idx) {
            *slot = Some(outcome);
        }
    }
    slots.into_iter().flatten().collect()
}

/// Run a single approved call against the breaker table and the tool set.
async fn run_call(
    runtime: &Runtime,
    config: &ControllerConfig,
    handler: &dyn EventHandler,
    call: &ToolCallRequest,
    ctx: &ToolContext,
) -> ToolCallOutcome {
    let recovery = runtime.recovery();

    if recovery.is_circuit_open(&call.name) {
        let observation = recovery.circuit_open_observation(&call.name);
        warn!(tool = %call.name, "Circuit open, call rejected");
        handler.on_event(&ControllerEvent::CircuitOpen { name: &call.name });
        let mut outcome = ToolCallOutcome::error(call, observation);
        outcome.record.circuit_open = true;
        emit_result(handler, &outcome);
        return outcome;
    }

    // Dropping this future (cancellation) before the first outcome is
    // recorded must not strand a half-open probe slot.
    let mut probe = ProbeGuard::new(recovery, &call.name);

    handler.on_event(&ControllerEvent::ToolExecuting {
        name: &call.name,
        call_id: &call.id,
        input: &call.input,
    });

    let mut retries = 0u32;
    let mut attempts = 0u32;
    let (output, is_error) = loop {
        attempts += 1;
        match runtime.tools().execute(&call.name, &call.input, ctx).await {
            Ok(value) => {
                recovery.record_success(&call.name);
                probe.disarm();
                break (value, false);
            }
            Err(error) => {
                let state = recovery.record_failure(&call.name);
                probe.disarm();
                let class = recovery.classify(&error);
                debug!(tool = %call.name, category = %class.category, ?state, "Tool failed");

                if config.auto_retry_timeouts && class.category == ErrorCategory::Timeout {
                    let decision = recovery.should_retry(&call.name, &error, retries);
                    if decision.retry {
                        retries += 1;
                        let delay_ms = u64::try_from(decision.delay.as_millis()).unwrap_or(u64::MAX);
                        handler.on_event(&ControllerEvent::ToolRetry {
                            name: &call.name,
                            attempt: retries,
                            delay_ms,
                        });
                        tokio::time::sleep(decision.delay).await;
                        continue;
                    }
                    debug!(tool = %call.name, reason = %decision.reason, "Timeout not retried");
                }

                let observation = format_with_error(&call.name, &call.input, &class, Some(&error));
                break (Value::String(observation), true);
            }
        }
    };

    let outcome = ToolCallOutcome {
        part: Part::tool_result(&call.id, &call.name, output, is_error),
        record: ToolCallRecord {
            call_id: call.id.clone(),
            name: call.name.clone(),
            is_error,
            circuit_open: false,
            denied: false,
            attempts,
        },
    };
    emit_result(handler, &outcome);
    outcome
}

/// Releases the breaker's probe slot for `tool` unless an outcome was
/// recorded first.
struct ProbeGuard<'a> {
    recovery: &'a ErrorRecoveryManager,
    tool: &'a str,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(recovery: &'a ErrorRecoveryManager, tool: &'a str) -> Self {
        Self {
            recovery,
            tool,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.recovery.release_probe(self.tool) {
            debug!(tool = self.tool, "Call dropped before reporting, probe released");
        }
    }
}

fn emit_result(handler: &dyn EventHandler, outcome: &ToolCallOutcome) {
    if let Some(output) = outcome.output() {
        handler.on_event(&ControllerEvent::ToolResult {
            name: &outcome.record.name,
            call_id: &outcome.record.call_id,
            output,
            is_error: outcome.record.is_error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::agent::events::FnEventHandler;
    use crate::agent::session::MemorySessionStore;
    use crate::tools::breaker::{BreakerConfig, CircuitState};
    use crate::tools::core::{FnTool, ToolSet};
    use crate::tools::recovery::{ErrorRecoveryManager, RecoveryConfig};
    use crate::{AgentError, ChatModel, ModelRequest, ModelResponse, ToolDef};

    struct SilentModel;

    #[async_trait]
    impl ChatModel for SilentModel {
        async fn complete(&self, _: &ModelRequest<'_>) -> Result<ModelResponse, AgentError> {
            Ok(ModelResponse::final_text("done"))
        }
    }

    fn def(name: &str) -> ToolDef {
        ToolDef::new(name, format!("{name} tool"), json!({"type": "object"}))
    }

    fn runtime(tools: ToolSet) -> Runtime {
        let recovery = ErrorRecoveryManager::new(
            BreakerConfig::default(),
            RecoveryConfig {
                max_attempts: 2,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        );
        Runtime::new(Arc::new(SilentModel), tools, Arc::new(MemorySessionStore::new()))
            .with_recovery(recovery.shared())
    }

    fn call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            name: name.into(),
            input: json!({}),
        }
    }

    fn names(rt: &Runtime) -> Vec<String> {
        rt.tools().names()
    }

    #[tokio::test]
    async fn outcomes_keep_call_order() {
        let tools = ToolSet::new()
            .with(FnTool::new(def("slow"), |_: Value, _| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!("slow"))
            }))
            .with(FnTool::new(def("fast"), |_: Value, _| async { Ok(json!("fast")) }));
        let rt = runtime(tools);
        let config = ControllerConfig::default();
        let ctx = ToolContext::new("s", "t", 1);
        let outcomes = execute_tool_calls(
            &rt,
            &config,
            &crate::agent::events::NoopHandler,
            &[call("a", "slow"), call("b", "fast")],
            &names(&rt),
            &ctx,
        )
        .await;
        let ids: Vec<&str> = outcomes.iter().map(|o| o.record.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(outcomes.iter().all(|o| !o.record.is_error));
    }

    #[tokio::test]
    async fn calls_outside_active_set_never_run() {
        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();
        let tools = ToolSet::new().with(FnTool::new(def("deletePage"), move |_: Value, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("deleted"))
            }
        }));
        let rt = runtime(tools);
        let outcomes = execute_tool_calls(
            &rt,
            &ControllerConfig::default(),
            &crate::agent::events::NoopHandler,
            &[call("a", "deletePage")],
            &[],
            &ToolContext::default(),
        )
        .await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(outcomes[0].record.is_error);
        assert!(rt.breaker_status().is_empty());
    }

    #[tokio::test]
    async fn denial_skips_tool_and_breaker() {
        let tools = ToolSet::new().with(
            FnTool::new(def("publish"), |_: Value, _| async { Ok(json!("ok")) }).confirm(true),
        );
        let rt = runtime(tools);
        let handler = FnEventHandler::new(|e: &ControllerEvent<'_>| match e {
            ControllerEvent::ApprovalRequired { .. } => Some(EventResponse::Deny("not today".into())),
            _ => None,
        });
        let outcomes = execute_tool_calls(
            &rt,
            &ControllerConfig::default(),
            &handler,
            &[call("a", "publish")],
            &names(&rt),
            &ToolContext::default(),
        )
        .await;
        assert!(outcomes[0].record.denied);
        assert_eq!(outcomes[0].output(), Some(&json!("Tool call denied: not today")));
        assert!(rt.breaker_status().is_empty());
    }

    #[tokio::test]
    async fn timeouts_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let tools = ToolSet::new().with(FnTool::new(def("fetchPage"), move |_: Value, _| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("request timed out after 30s".to_string())
                } else {
                    Ok(json!({"id": 1}))
                }
            }
        }));
        let rt = runtime(tools);
        let retries = Arc::new(Mutex::new(Vec::new()));
        let seen = retries.clone();
        let handler = FnEventHandler::new(move |e: &ControllerEvent<'_>| {
            if let ControllerEvent::ToolRetry { attempt, .. } = e {
                seen.lock().unwrap().push(*attempt);
            }
            None
        });
        let outcomes = execute_tool_calls(
            &rt,
            &ControllerConfig::default(),
            &handler,
            &[call("a", "fetchPage")],
            &names(&rt),
            &ToolContext::default(),
        )
        .await;
        assert!(!outcomes[0].record.is_error);
        assert_eq!(outcomes[0].record.attempts, 2);
        assert_eq!(*retries.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn validation_errors_become_observations() {
        let tools = ToolSet::new().with(FnTool::new(def("createPage"), |_: Value, _| async {
            Err::<Value, _>("validation failed: title is required".to_string())
        }));
        let rt = runtime(tools);
        let outcomes = execute_tool_calls(
            &rt,
            &ControllerConfig::default(),
            &crate::agent::events::NoopHandler,
            &[call("a", "createPage")],
            &names(&rt),
            &ToolContext::default(),
        )
        .await;
        let record = &outcomes[0].record;
        assert!(record.is_error);
        assert_eq!(record.attempts, 1);
        let text = outcomes[0].output().and_then(Value::as_str).unwrap();
        assert!(text.contains("title is required"));
        assert!(text.contains("validation"));
    }

    #[tokio::test]
    async fn dropped_probe_call_releases_the_slot() {
        let tools = ToolSet::new().with(FnTool::new(def("slowTool"), |_: Value, _| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!("never"))
        }));
        let recovery = ErrorRecoveryManager::new(
            BreakerConfig {
                failure_threshold: 3,
                reset_after_ms: 200,
            },
            RecoveryConfig::default(),
        );
        let rt = Runtime::new(Arc::new(SilentModel), tools, Arc::new(MemorySessionStore::new()))
            .with_recovery(recovery.shared());
        for _ in 0..3 {
            rt.recovery().record_failure("slowTool");
        }
        tokio::time::sleep(Duration::from_millis(220)).await;

        let config = ControllerConfig::default();
        let calls = [call("a", "slowTool")];
        let allowed = names(&rt);
        let ctx = ToolContext::default();
        let run = execute_tool_calls(
            &rt,
            &config,
            &crate::agent::events::NoopHandler,
            &calls,
            &allowed,
            &ctx,
        );
        assert!(tokio::time::timeout(Duration::from_millis(30), run).await.is_err());

        // Well inside the reset period, so only the release frees the slot.
        let breakers = rt.recovery().breakers();
        assert_eq!(breakers.state("slowTool"), CircuitState::HalfOpen);
        assert!(!breakers.blocks("slowTool"));
        assert!(!breakers.is_circuit_open("slowTool"));
        assert!(breakers.is_circuit_open("slowTool"));
    }
}
