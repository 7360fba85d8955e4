//! Tool abstraction for the controller's function-calling loop.
//!
//! The [`Tool`] trait defines the interface every tool implements: a static
//! API definition (name, description, JSON schema) and an async `execute`
//! method returning a tagged [`ToolOutput`]. Tools are collected into a
//! [`ToolSet`] which handles dispatch, argument validation, timeouts, and
//! result truncation.
//!
//! Failures stay strings at this boundary. The controller classifies them
//! with [`tools::recovery`](crate::tools::recovery) and feeds them back to
//! the model as observations.

use crate::ToolDef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default timeout for tool execution (60 seconds).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one tool execution: structured output or an error message.
pub type ToolOutput = Result<Value, String>;

/// Boxed future returned by [`Tool::execute`].
///
/// Type alias to keep trait signatures and implementations readable.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolOutput> + Send + 'a>>;

/// Per-call context handed to every tool execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub session_id: String,
    pub trace_id: String,
    pub step: u32,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, trace_id: impl Into<String>, step: u32) -> Self {
        Self {
            session_id: session_id.into(),
            trace_id: trace_id.into(),
            step,
        }
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool the model can invoke via function-calling.
///
/// # Example
///
/// ```ignore
/// struct GetPage { store: PageStore }
///
/// impl Tool for GetPage {
///     fn definition(&self) -> ToolDef { /* ... */ }
///
///     fn execute<'a>(&'a self, input: &'a Value, _ctx: &'a ToolContext) -> ToolFuture<'a> {
///         Box::pin(async move {
///             let slug = input["slug"].as_str().ok_or("slug is required")?;
///             self.store.get(slug).await.map_err(|e| e.to_string())
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The tool definition sent to the model.
    fn definition(&self) -> ToolDef;

    /// Execute the tool. Errors are returned as `Err(message)` rather than
    /// panicking; the controller turns them into observations.
    ///
    /// Uses a boxed future so that the trait is dyn-compatible (object-safe).
    fn execute<'a>(&'a self, input: &'a Value, ctx: &'a ToolContext) -> ToolFuture<'a>;

    /// The tool's name (delegates to the definition).
    fn name(&self) -> String {
        self.definition().function.name.clone()
    }

    /// Whether this tool mutates the content store. Read-only modes expose
    /// only tools for which this is `false`.
    fn is_mutation(&self) -> bool {
        false
    }

    /// Whether a human must approve each call before it runs.
    fn requires_confirmation(&self) -> bool {
        false
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// A collection of tools that can be dispatched by name.
///
/// # Example
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with_max_result_bytes(15_000)
///     .with_arg_validation(true)
///     .with_default_timeout(Some(Duration::from_secs(30)))
///     .with(GetPage::new(store.clone()))
///     .with_if(allow_deletes, DeletePage::new(store.clone()))
///     .with_if(!allow_deletes, DisabledTool::new(
///         delete_page_def(),
///         "Deleting pages is disabled for this site.",
///     ));
///
/// let defs = tools.definitions();
/// ```
pub struct ToolSet {
    tools: HashMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
    /// Whether to validate tool arguments against JSON Schema before execution.
    validate_args: bool,
    /// Default timeout for tool execution. `None` disables timeouts.
    default_timeout: Option<Duration>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.names())
            .field("max_result_bytes", &self.max_result_bytes)
            .finish()
    }
}

impl ToolSet {
    /// Create an empty tool set with validation on and the default timeout.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: true,
            default_timeout: Some(DEFAULT_TOOL_TIMEOUT),
        }
    }

    /// Set the maximum result size in bytes before truncation.
    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Enable or disable JSON Schema argument validation before execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Set a default timeout for tool execution. Pass `None` to disable.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Conditionally register a tool (builder pattern).
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Definitions for `names`, in the given order. Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDef> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.definition())
            .collect()
    }

    /// Names of tools that do not mutate state, sorted.
    pub fn read_only_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, t)| !t.is_mutation())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_mutation_tool(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.is_mutation())
    }

    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.requires_confirmation())
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool call by name, with validation, timeout, and truncation.
    ///
    /// Unknown tools, invalid arguments, and timeouts come back as `Err`
    /// with messages shaped for error classification ("not found",
    /// "validation failed", "timed out").
    pub async fn execute(&self, name: &str, input: &Value, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.tools.get(name) else {
            return Err(format!("tool '{name}' not found"));
        };

        if self.validate_args {
            validate_tool_arguments(tool.as_ref(), input)?;
        }

        log_tool_call(name, input);
        let start = std::time::Instant::now();

        let result = if let Some(timeout_duration) = self.default_timeout {
            match tokio::time::timeout(timeout_duration, tool.execute(input, ctx)).await {
                Ok(r) => r,
                Err(_) => {
                    info!(
                        "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                        start.elapsed().as_secs_f64(),
                        timeout_duration.as_secs_f64(),
                    );
                    Err(format!(
                        "tool '{name}' timed out after {:.0} seconds",
                        timeout_duration.as_secs_f64(),
                    ))
                }
            }
        } else {
            tool.execute(input, ctx).await
        };

        debug!(
            "Tool {name} {} in {:.0}ms",
            if result.is_ok() { "completed" } else { "failed" },
            start.elapsed().as_secs_f64() * 1000.0,
        );

        result.map(|v| truncate_value(v, self.max_result_bytes))
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

// ── DisabledTool ───────────────────────────────────────────────────

/// A tool that always fails with a fixed reason.
///
/// The model still sees its name, description, and schema.
pub struct DisabledTool {
    def: ToolDef,
    reason: String,
}

impl DisabledTool {
    pub fn new(def: ToolDef, reason: impl Into<String>) -> Self {
        Self {
            def,
            reason: reason.into(),
        }
    }

    /// Create a disabled variant of an existing tool.
    pub fn from_tool(tool: &dyn Tool, reason: impl Into<String>) -> Self {
        Self {
            def: tool.definition(),
            reason: reason.into(),
        }
    }
}

impl Tool for DisabledTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute<'a>(&'a self, _input: &'a Value, _ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move { Err(self.reason.clone()) })
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler =
    Box<dyn Fn(Value, ToolContext) -> Pin<Box<dyn Future<Output = ToolOutput> + Send>> + Send + Sync>;

/// A closure-based tool that auto-parses arguments and delegates to a handler.
///
/// Use [`FnTool`] for stateless tools or tools whose state is cheaply
/// cloneable into the closure.
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct GetPageArgs {
///     /// Page slug.
///     slug: String,
/// }
///
/// let tool = FnTool::new(
///     ToolDef::new("getPage", "Fetch a page by slug", json_schema_for::<GetPageArgs>()),
///     |args: GetPageArgs, _ctx| async move {
///         Ok(json!({"slug": args.slug, "title": "About"}))
///     },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
    mutation: bool,
    confirm: bool,
}

impl FnTool {
    /// Create a new closure-based tool. Arguments that fail to deserialize
    /// into `A` come back as a validation error.
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutput> + Send + 'static,
    {
        let erased = move |raw: Value,
                           ctx: ToolContext|
              -> Pin<Box<dyn Future<Output = ToolOutput> + Send>> {
            match serde_json::from_value::<A>(raw) {
                Ok(args) => Box::pin(handler(args, ctx)),
                Err(e) => Box::pin(async move {
                    Err(format!("validation failed: invalid arguments: {e}"))
                }),
            }
        };

        Self {
            def,
            handler: Box::new(erased),
            mutation: false,
            confirm: false,
        }
    }

    /// Mark this tool as a mutation (builder pattern).
    pub fn mutation(mut self, is_mutation: bool) -> Self {
        self.mutation = is_mutation;
        self
    }

    /// Require human approval for each call (builder pattern).
    pub fn confirm(mut self, requires: bool) -> Self {
        self.confirm = requires;
        self
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute<'a>(&'a self, input: &'a Value, ctx: &'a ToolContext) -> ToolFuture<'a> {
        (self.handler)(input.clone(), ctx.clone())
    }

    fn is_mutation(&self) -> bool {
        self.mutation
    }

    fn requires_confirmation(&self) -> bool {
        self.confirm
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .field("mutation", &self.mutation)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate tool arguments against the tool's declared JSON Schema.
///
/// The error string is formatted for the model to understand and
/// self-correct.
pub fn validate_tool_arguments(tool: &dyn Tool, input: &Value) -> Result<(), String> {
    let schema = tool.definition().function.parameters;

    // If the schema itself is invalid, skip validation.
    let Ok(validator) = jsonschema::validator_for(&schema) else {
        return Ok(());
    };

    let errors: Vec<String> = validator
        .iter_errors(input)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "validation failed for tool '{}':\n{}",
            tool.name(),
            errors.join("\n")
        ))
    }
}

/// Parse tool input into a typed struct.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(input: &Value) -> Result<T, String> {
    serde_json::from_value(input.clone())
        .map_err(|e| format!("validation failed: invalid arguments: {e}"))
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, input: &Value) {
    let arguments = input.to_string();
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.len() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a string to at most `max` bytes, appending a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() > max {
        let cut = s.floor_char_boundary(max);
        format!("{}...\n[truncated: {} bytes total]", &s[..cut], s.len())
    } else {
        s
    }
}

/// Truncate a tool output whose rendered form exceeds `max` bytes. Oversized
/// structured values are replaced by their truncated text.
pub fn truncate_value(value: Value, max: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_result(s, max)),
        other => {
            let rendered = other.to_string();
            if rendered.len() > max {
                Value::String(truncate_result(rendered, max))
            } else {
                other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct SlugArgs {
        slug: String,
    }

    fn get_page() -> FnTool {
        FnTool::new(
            ToolDef::new("getPage", "Fetch a page", crate::json_schema_for::<SlugArgs>()),
            |args: SlugArgs, ctx: ToolContext| async move {
                Ok(json!({"slug": args.slug, "step": ctx.step}))
            },
        )
    }

    struct Sleepy;

    impl Tool for Sleepy {
        fn definition(&self) -> ToolDef {
            ToolDef::new("sleepy", "Never finishes", json!({"type": "object"}))
        }

        fn execute<'a>(&'a self, _input: &'a Value, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
        }
    }

    struct Big;

    impl Tool for Big {
        fn definition(&self) -> ToolDef {
            ToolDef::new("big", "Large output", json!({"type": "object"}))
        }

        fn execute<'a>(&'a self, _input: &'a Value, _ctx: &'a ToolContext) -> ToolFuture<'a> {
            Box::pin(async { Ok(Value::String("x".repeat(500))) })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("s1", "tr-1", 3)
    }

    #[tokio::test]
    async fn executes_with_context() {
        let tools = ToolSet::new().with(get_page());
        let out = tools
            .execute("getPage", &json!({"slug": "about"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out, json!({"slug": "about", "step": 3}));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let tools = ToolSet::new();
        let err = tools.execute("nope", &json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err, "tool 'nope' not found");
    }

    #[tokio::test]
    async fn schema_validation_rejects_bad_input() {
        let tools = ToolSet::new().with(get_page());
        let err = tools
            .execute("getPage", &json!({"slug": 5}), &ctx())
            .await
            .unwrap_err();
        assert!(err.starts_with("validation failed for tool 'getPage'"));
    }

    #[tokio::test]
    async fn fn_tool_parse_error_without_validation() {
        let tools = ToolSet::new().with_arg_validation(false).with(get_page());
        let err = tools.execute("getPage", &json!({}), &ctx()).await.unwrap_err();
        assert!(err.starts_with("validation failed"));
    }

    #[tokio::test]
    async fn timeout_surfaces_as_error() {
        let tools = ToolSet::new()
            .with_default_timeout(Some(Duration::from_millis(20)))
            .with(Sleepy);
        let err = tools.execute("sleepy", &json!({}), &ctx()).await.unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[tokio::test]
    async fn toolset_truncates_long_results() {
        let tools = ToolSet::new().with_max_result_bytes(100).with(Big);
        let out = tools.execute("big", &json!({}), &ctx()).await.unwrap();
        let text = out.as_str().unwrap();
        assert!(text.contains("[truncated: 500 bytes total]"));
    }

    #[tokio::test]
    async fn disabled_tool_returns_reason() {
        let tools = ToolSet::new().with(DisabledTool::from_tool(&get_page(), "maintenance"));
        let err = tools
            .execute("getPage", &json!({"slug": "a"}), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err, "maintenance");
    }

    #[test]
    fn read_only_and_flags() {
        let create = FnTool::new(
            ToolDef::new("createPage", "Create", json!({"type": "object"})),
            |_: Value, _| async { Ok(Value::Null) },
        )
        .mutation(true)
        .confirm(true);
        let tools = ToolSet::new().with(get_page()).with(create);
        assert_eq!(tools.read_only_names(), vec!["getPage".to_string()]);
        assert!(tools.is_mutation_tool("createPage"));
        assert!(tools.requires_confirmation("createPage"));
        assert!(!tools.requires_confirmation("getPage"));
        assert_eq!(tools.names(), vec!["createPage", "getPage"]);
        let defs = tools.definitions_for(&["getPage".into(), "missing".into()]);
        assert_eq!(defs.len(), 1);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = truncate_result(s, 5);
        assert!(out.starts_with("éé..."));
    }

    #[test]
    fn truncate_short_unchanged() {
        assert_eq!(truncate_result("short".into(), 100), "short");
        assert_eq!(truncate_value(json!({"a": 1}), 100), json!({"a": 1}));
    }
}
