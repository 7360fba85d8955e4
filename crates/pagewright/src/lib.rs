//! Step-bounded tool-calling agent engine.
//!
//! `pagewright` drives a language model through a bounded sequence of
//! reasoning steps in which it manipulates a content store through discrete,
//! auditable tool calls. The engine keeps the conversation inside the model's
//! context budget, survives crashes through checkpoints, and isolates
//! persistently failing tools behind per-tool circuit breakers.
//!
//! The core abstraction is the [`Controller`](agent::controller::Controller):
//! one controller execution is one user turn.
//!
//! ```ignore
//! use pagewright::prelude::*;
//! use std::sync::Arc;
//!
//! let model = Arc::new(OpenRouterClient::new(api_key)?);
//! let tools = ToolSet::new().with(my_create_page_tool);
//! let store = Arc::new(FileSessionStore::new(".pagewright/sessions")?);
//! let runtime = Runtime::new(model, tools, store);
//!
//! let config = ControllerConfig::new("anthropic/claude-sonnet-4", "You edit the site.");
//! let result = Controller::new(&runtime, config)
//!     .with_event_handler(&LoggingHandler)
//!     .execute(&[], "Create an About page", "act")
//!     .await?;
//!
//! println!("{}", result.final_text);
//! ```
//!
//! # Where to find things
//!
//! - **The step loop:** [`Controller`](agent::controller::Controller),
//!   configured by [`ControllerConfig`](agent::config::ControllerConfig) and
//!   backed by the shared [`Runtime`](agent::runtime::Runtime).
//! - **Tool failures:** [`tools::recovery`] classifies errors and decides on
//!   retries; [`tools::breaker`] holds per-tool circuit state.
//! - **Resumability:** [`agent::checkpoint`] and the [`SessionStore`](agent::session::SessionStore)
//!   implementations in [`agent::session`].
//! - **Context budget:** [`context::budget`] for model limits and usage,
//!   [`context::pruning`] for tool-output redaction, [`context::compaction`]
//!   for the two-stage strategy.
//! - **Choosing tools:** [`tools::discovery`] ranks tools for a free-text query.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Controller loop, runtime, config, events, phases, memory, checkpoints, session stores |
//! | [`tools`] | [`Tool`](tools::core::Tool) trait, [`ToolSet`](tools::core::ToolSet), breakers, error recovery, discovery |
//! | [`context`] | Model limits and usage, pruning, compaction |
//! | [`api`] | OpenRouter chat client, embeddings client, retry, trace ids |

pub mod agent;
pub mod api;
pub mod context;
pub mod error;
pub mod prelude;
pub mod settings;
pub mod tools;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::AgentError;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use pagewright::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct CreatePageArgs {
///     slug: String,
///     #[serde(default)]
///     title: Option<String>,
/// }
///
/// let schema = json_schema_for::<CreatePageArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"slug".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A typed fragment of a [`Message`].
///
/// A `ToolResult` whose output was redacted by pruning keeps its `call_id`
/// and `tool_name`; `compacted_at` and `original_tokens` record when and how
/// much was discarded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        output: Value,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compacted_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_tokens: Option<usize>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn tool_call(call_id: impl Into<String>, tool_name: impl Into<String>, input: Value) -> Self {
        Part::ToolCall {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            input,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: Value,
        is_error: bool,
    ) -> Self {
        Part::ToolResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output,
            is_error,
            compacted_at: None,
            original_tokens: None,
        }
    }

    /// Whether this is a tool result already redacted by pruning.
    pub fn is_compacted(&self) -> bool {
        matches!(
            self,
            Part::ToolResult {
                compacted_at: Some(_),
                ..
            }
        )
    }
}

/// One turn in a conversation.
///
/// Immutable once persisted, except for part-level redaction of tool
/// results. `token_count` caches a token estimate and is cleared whenever a
/// part is redacted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
}

impl Message {
    pub fn new(role: MessageRole, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            created_at: Utc::now(),
            is_summary: false,
            token_count: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![Part::text(content)])
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![Part::text(content)])
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![Part::text(content)])
    }

    /// An assistant message with optional text followed by tool-call parts.
    pub fn assistant(text: Option<String>, calls: Vec<Part>) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            parts.push(Part::Text { text });
        }
        parts.extend(calls);
        Self::new(MessageRole::Assistant, parts)
    }

    /// A tool message carrying the results of one step's tool calls.
    pub fn tool(results: Vec<Part>) -> Self {
        Self::new(MessageRole::Tool, results)
    }

    /// A synthetic assistant message replacing a compacted block.
    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            is_summary: true,
            ..Self::assistant_text(content)
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        texts.join("\n")
    }

    /// Tool-call parts as `(call_id, tool_name, input)`.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCall {
                call_id,
                tool_name,
                input,
            } => Some((call_id.as_str(), tool_name.as_str(), input)),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }

    /// Tool-result parts as `(call_id, tool_name)`.
    pub fn tool_results(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolResult {
                call_id, tool_name, ..
            } => Some((call_id.as_str(), tool_name.as_str())),
            _ => None,
        })
    }
}

// ── Tool definition types ──────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the model (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ── Model types ────────────────────────────────────────────────────

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Token usage reported by the provider.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// One model call: the system prompt, the conversation, and the tool subset
/// the model may use on this step.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDef],
    pub step_limit: u32,
    pub max_tokens: u32,
}

/// The model's reply to a [`ModelRequest`].
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<String>,
    pub usage: Option<UsageInfo>,
}

impl ModelResponse {
    /// A text-only final answer.
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            finish_reason: Some("stop".into()),
            ..Default::default()
        }
    }

    /// A response requesting tool calls.
    pub fn with_tool_calls(text: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text,
            tool_calls,
            finish_reason: Some("tool_calls".into()),
            usage: None,
        }
    }
}

/// The language-model collaborator.
///
/// Implementations apply their own retry policy; an `Err` means the call
/// failed for good and the turn ends incomplete.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.text(), "hello");

        let summary = Message::summary("earlier work");
        assert_eq!(summary.role, MessageRole::Assistant);
        assert!(summary.is_summary);

        let assistant = Message::assistant(
            Some("Creating the page.".into()),
            vec![Part::tool_call("c1", "createPage", serde_json::json!({"slug": "about"}))],
        );
        assert_eq!(assistant.parts.len(), 2);
        assert!(assistant.has_tool_calls());
        let (id, name, input) = assistant.tool_calls().next().unwrap();
        assert_eq!((id, name), ("c1", "createPage"));
        assert_eq!(input["slug"], "about");
    }

    #[test]
    fn empty_assistant_text_is_dropped() {
        let msg = Message::assistant(Some(String::new()), vec![]);
        assert!(msg.parts.is_empty());
    }

    #[test]
    fn part_serializes_with_kebab_tag() {
        let part = Part::tool_result("c1", "getPage", serde_json::json!({"id": 1}), false);
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool-result");
        assert!(json.get("compacted_at").is_none());

        let call = Part::tool_call("c2", "listPages", serde_json::json!({}));
        assert_eq!(serde_json::to_value(&call).unwrap()["type"], "tool-call");
    }

    #[test]
    fn message_serde_keeps_redaction_metadata() {
        let mut msg = Message::tool(vec![Part::tool_result(
            "c1",
            "getPage",
            serde_json::json!("big"),
            false,
        )]);
        if let Part::ToolResult {
            compacted_at,
            original_tokens,
            ..
        } = &mut msg.parts[0]
        {
            *compacted_at = Some(Utc::now());
            *original_tokens = Some(512);
        }
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(back.parts[0].is_compacted());
        assert_eq!(back.tool_results().next(), Some(("c1", "getPage")));
    }

    #[test]
    fn tool_def_name() {
        let def = ToolDef::new("createPage", "Create a page", serde_json::json!({}));
        assert_eq!(def.name(), "createPage");
        assert_eq!(def.tool_type, ToolType::Function);
    }
}
