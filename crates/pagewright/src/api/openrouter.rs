//! OpenRouter chat completions client.
//!
//! [`OpenRouterClient`] speaks the OpenAI-compatible wire format and
//! implements [`ChatModel`] on top of it. Conversation [`Message`]s are mapped
//! to wire messages here: assistant tool-call parts become `tool_calls`, and
//! every tool-result part becomes its own `tool` message.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::api::retry::{RetryConfig, retry_api_call};
use crate::{
    AgentError, ChatModel, Message, MessageRole, ModelRequest, ModelResponse, Part,
    ToolCallRequest, ToolDef, UsageInfo,
};

/// OpenRouter chat completions endpoint.
pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ── Wire types ─────────────────────────────────────────────────────

/// Chat completion request body. Unused optional fields are omitted.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

/// A message in the provider's wire format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WireMessage {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call in wire format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

// ── Message mapping ────────────────────────────────────────────────

/// Map the system prompt and conversation into wire messages.
pub fn to_wire_messages(system_prompt: &str, messages: &[Message]) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(WireMessage {
            role: MessageRole::System,
            content: Some(system_prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in messages {
        match msg.role {
            MessageRole::Tool => {
                for part in &msg.parts {
                    if let Part::ToolResult {
                        call_id, output, ..
                    } = part
                    {
                        out.push(WireMessage {
                            role: MessageRole::Tool,
                            content: Some(output_as_text(output)),
                            tool_calls: None,
                            tool_call_id: Some(call_id.clone()),
                        });
                    }
                }
            }
            role => {
                let calls: Vec<ToolCall> = msg
                    .tool_calls()
                    .map(|(id, name, input)| ToolCall {
                        id: id.to_string(),
                        call_type: CallType::Function,
                        function: FunctionCallData {
                            name: name.to_string(),
                            arguments: input.to_string(),
                        },
                    })
                    .collect();
                let text = msg.text();
                out.push(WireMessage {
                    role,
                    content: (!text.is_empty() || calls.is_empty()).then_some(text),
                    tool_calls: (!calls.is_empty()).then_some(calls),
                    tool_call_id: None,
                });
            }
        }
    }
    out
}

fn output_as_text(output: &serde_json::Value) -> String {
    match output {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse wire tool calls. Arguments that are not valid JSON are kept as a
/// raw string so the tool's schema validation can report them.
pub fn from_wire_tool_calls(calls: Vec<ToolCall>) -> Vec<ToolCallRequest> {
    calls
        .into_iter()
        .map(|tc| {
            let input = serde_json::from_str(&tc.function.arguments)
                .unwrap_or(serde_json::Value::String(tc.function.arguments));
            ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                input,
            }
        })
        .collect()
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
    url: String,
    retry: RetryConfig,
    temperature: f32,
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, AgentError> {
        Self::with_headers(api_key, "https://github.com/pagewright", "pagewright")
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .user_agent("pagewright/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AgentError::Model(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
            url: OPENROUTER_URL.to_string(),
            retry: RetryConfig::default(),
            temperature: 0.0,
        })
    }

    /// Point the client at another OpenAI-compatible endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Send a single chat completion request (no retry).
    pub async fn chat(&self, body: &ChatRequest) -> Result<ModelResponse, String> {
        let tool_count = body.tools.as_ref().map_or(0, |t| t.len());
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}",
            body.model,
            body.messages.len(),
            tool_count,
            body.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("OpenRouter API error: {}", err.message));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let Some(choice) = parsed.choices.and_then(|c| c.into_iter().next()) else {
            debug!("LLM output: empty (no choices)");
            return Ok(ModelResponse {
                usage: parsed.usage,
                ..Default::default()
            });
        };

        let tool_calls = from_wire_tool_calls(choice.message.tool_calls.unwrap_or_default());
        debug!(
            "LLM output: {} chars text, {} tool call(s)",
            choice.message.content.as_ref().map_or(0, |s| s.len()),
            tool_calls.len()
        );

        Ok(ModelResponse {
            text: choice.message.content,
            tool_calls,
            finish_reason: choice.finish_reason,
            usage: parsed.usage,
        })
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenRouterClient {
    async fn complete(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, AgentError> {
        let body = ChatRequest {
            model: request.model.to_string(),
            messages: to_wire_messages(request.system_prompt, request.messages),
            max_tokens: request.max_tokens,
            temperature: self.temperature,
            tools: (!request.tools.is_empty()).then(|| request.tools.to_vec()),
        };
        retry_api_call(&self.retry, || self.chat(&body))
            .await
            .map_err(AgentError::Model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_request_skips_empty_fields() {
        let req = ChatRequest {
            model: "m".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("temperature").is_none());
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn tool_results_become_separate_tool_messages() {
        let messages = vec![
            Message::user("make pages"),
            Message::assistant(
                None,
                vec![
                    Part::tool_call("c1", "createPage", json!({"slug": "a"})),
                    Part::tool_call("c2", "createPage", json!({"slug": "b"})),
                ],
            ),
            Message::tool(vec![
                Part::tool_result("c1", "createPage", json!({"id": 1}), false),
                Part::tool_result("c2", "createPage", json!("slug taken"), true),
            ]),
        ];
        let wire = to_wire_messages("be helpful", &messages);
        assert_eq!(wire.len(), 5);
        assert_eq!(wire[0].role, MessageRole::System);
        let calls = wire[2].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.arguments, r#"{"slug":"a"}"#);
        assert!(wire[2].content.is_none());
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(wire[3].content.as_deref(), Some(r#"{"id":1}"#));
        assert_eq!(wire[4].content.as_deref(), Some("slug taken"));
    }

    #[test]
    fn empty_system_prompt_is_omitted() {
        let wire = to_wire_messages("", &[Message::user("hi")]);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].content.as_deref(), Some("hi"));
    }

    #[test]
    fn malformed_arguments_kept_as_string() {
        let calls = from_wire_tool_calls(vec![ToolCall {
            id: "c1".into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: "getPage".into(),
                arguments: "{not json".into(),
            },
        }]);
        assert_eq!(calls[0].input, json!("{not json"));
        assert_eq!(calls[0].name, "getPage");
    }

    #[test]
    fn raw_response_parses_tool_calls() {
        let raw = r#"{"choices":[{"message":{"content":null,"tool_calls":[{"id":"c1","type":"function","function":{"name":"listPages","arguments":"{}"}}]},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let parsed: RawChatResponse = serde_json::from_str(raw).unwrap();
        let choice = parsed.choices.unwrap().into_iter().next().unwrap();
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let calls = from_wire_tool_calls(choice.message.tool_calls.unwrap());
        assert_eq!(calls[0].input, json!({}));
        assert_eq!(parsed.usage.unwrap().total_tokens, Some(15));
    }
}
