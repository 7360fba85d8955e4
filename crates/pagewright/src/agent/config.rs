//! Configuration types for the [`Controller`](super::controller::Controller).
//!
//! # Examples
//!
//! Minimal configuration, everything else at defaults:
//!
//! ```ignore
//! let config = ControllerConfig::new("anthropic/claude-sonnet-4", "You edit the site.");
//! ```
//!
//! Customized:
//!
//! ```ignore
//! let config = ControllerConfig::new("anthropic/claude-sonnet-4", "You edit the site.")
//!     .with_max_tokens(4096)
//!     .with_mode(ModeConfig::new("act", 40, ToolSelector::All))
//!     .with_approval_required_tools(vec!["deletePage".into()])
//!     .with_sequential_tools(true);
//! ```

use serde::{Deserialize, Serialize};

use crate::AgentError;
use crate::tools::core::ToolSet;

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for optional controller features.
///
/// When `enabled` is `false`, the feature is skipped regardless of the inner
/// config values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle<T: Default> {
    /// Whether this feature is active.
    pub enabled: bool,
    /// Feature-specific configuration.
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }

    /// Create an enabled instance.
    pub fn enabled(config: T) -> Self {
        Self {
            enabled: true,
            config,
        }
    }

    /// The inner config when enabled.
    pub fn active(&self) -> Option<&T> {
        self.enabled.then_some(&self.config)
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Modes ─────────────────────────────────────────────────────────

/// Which catalogue tools a mode exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSelector {
    All,
    /// Tools whose [`Tool::is_mutation`](crate::tools::core::Tool::is_mutation) is `false`.
    ReadOnly,
    Only(Vec<String>),
}

impl ToolSelector {
    /// Resolve against the catalogue. Unknown names are dropped.
    pub fn resolve(&self, tools: &ToolSet) -> Vec<String> {
        match self {
            ToolSelector::All => tools.names(),
            ToolSelector::ReadOnly => tools.read_only_names(),
            ToolSelector::Only(names) => names
                .iter()
                .filter(|n| tools.contains(n))
                .cloned()
                .collect(),
        }
    }
}

/// A named operating mode: step limit plus tool subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    pub name: String,
    pub max_steps: u32,
    pub tools: ToolSelector,
    /// Appended to the system prompt while this mode runs.
    #[serde(default)]
    pub prompt_suffix: Option<String>,
}

impl ModeConfig {
    pub fn new(name: impl Into<String>, max_steps: u32, tools: ToolSelector) -> Self {
        Self {
            name: name.into(),
            max_steps,
            tools,
            prompt_suffix: None,
        }
    }

    pub fn with_prompt_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.prompt_suffix = Some(suffix.into());
        self
    }

    /// `ask`, `plan` and `act`.
    pub fn defaults() -> Vec<ModeConfig> {
        vec![
            ModeConfig::new("ask", 5, ToolSelector::ReadOnly).with_prompt_suffix(
                "You are answering a question. Read what you need, then answer. Do not change anything.",
            ),
            ModeConfig::new("plan", 10, ToolSelector::ReadOnly).with_prompt_suffix(
                "You are planning. Inspect the site and reply with a numbered plan. Do not change anything.",
            ),
            ModeConfig::new("act", 25, ToolSelector::All),
        ]
    }
}

// ── Discovery narrowing ───────────────────────────────────────────

/// Narrow the mode's tools to the top discovery results for the user
/// message. Only applies when the runtime carries a discovery index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolNarrowingConfig {
    /// Results requested from the index.
    pub limit: usize,
    /// Include declared related tools.
    pub expand_related: bool,
    /// Tools kept whenever the mode allows them.
    pub always_include: Vec<String>,
}

impl Default for ToolNarrowingConfig {
    fn default() -> Self {
        Self {
            limit: 8,
            expand_related: true,
            always_include: Vec::new(),
        }
    }
}

// ── Controller config ─────────────────────────────────────────────

/// Configuration for one [`Controller`](super::controller::Controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Model identifier (e.g. `"anthropic/claude-sonnet-4"`).
    pub model: String,
    pub system_prompt: String,
    /// Maximum tokens per model response.
    pub max_tokens: u32,
    pub modes: Vec<ModeConfig>,
    /// Mode used on resume when the checkpoint names none.
    pub default_mode: String,
    /// Tool names that require human approval before execution.
    pub approval_required_tools: Vec<String>,
    /// Retry timed-out tool calls inside the step when recovery approves.
    pub auto_retry_timeouts: bool,
    /// Run a step's tool calls one at a time instead of concurrently.
    pub sequential_tools: bool,
    /// Working-memory messages kept after each step.
    pub working_memory_keep: usize,
    pub discovery: Toggle<ToolNarrowingConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            system_prompt: String::new(),
            max_tokens: 4096,
            modes: ModeConfig::defaults(),
            default_mode: "act".into(),
            approval_required_tools: Vec::new(),
            auto_retry_timeouts: true,
            sequential_tools: false,
            working_memory_keep: 12,
            discovery: Toggle::default(),
        }
    }
}

impl ControllerConfig {
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Add a mode, replacing any mode with the same name.
    pub fn with_mode(mut self, mode: ModeConfig) -> Self {
        self.modes.retain(|m| m.name != mode.name);
        self.modes.push(mode);
        self
    }

    pub fn with_default_mode(mut self, name: impl Into<String>) -> Self {
        self.default_mode = name.into();
        self
    }

    pub fn with_approval_required_tools(mut self, tools: Vec<String>) -> Self {
        self.approval_required_tools = tools;
        self
    }

    pub fn with_auto_retry_timeouts(mut self, enabled: bool) -> Self {
        self.auto_retry_timeouts = enabled;
        self
    }

    pub fn with_sequential_tools(mut self, sequential: bool) -> Self {
        self.sequential_tools = sequential;
        self
    }

    pub fn with_discovery(mut self, discovery: Toggle<ToolNarrowingConfig>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Look up a mode by name.
    pub fn mode(&self, name: &str) -> Result<&ModeConfig, AgentError> {
        self.modes
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| AgentError::UnknownMode(name.to_string()))
    }

    /// System prompt with the mode's suffix appended.
    pub fn system_prompt_for(&self, mode: &ModeConfig) -> String {
        match &mode.prompt_suffix {
            Some(suffix) if !suffix.is_empty() => {
                format!("{}\n\n{}", self.system_prompt.trim_end(), suffix)
            }
            _ => self.system_prompt.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::tools::core::FnTool;
    use serde_json::{Value, json};

    fn catalogue() -> ToolSet {
        let tool = |n: &str, mutation: bool| {
            FnTool::new(
                ToolDef::new(n, "", json!({"type": "object"})),
                |_: Value, _| async { Ok(Value::Null) },
            )
            .mutation(mutation)
        };
        ToolSet::new()
            .with(tool("getPage", false))
            .with(tool("createPage", true))
    }

    #[test]
    fn default_modes() {
        let config = ControllerConfig::default();
        assert_eq!(config.mode("ask").unwrap().max_steps, 5);
        assert_eq!(config.mode("plan").unwrap().max_steps, 10);
        assert_eq!(config.mode("act").unwrap().max_steps, 25);
        assert!(matches!(config.mode("yolo"), Err(AgentError::UnknownMode(m)) if m == "yolo"));
    }

    #[test]
    fn with_mode_replaces() {
        let config =
            ControllerConfig::default().with_mode(ModeConfig::new("act", 3, ToolSelector::All));
        assert_eq!(config.modes.len(), 3);
        assert_eq!(config.mode("act").unwrap().max_steps, 3);
    }

    #[test]
    fn selectors_resolve_against_catalogue() {
        let tools = catalogue();
        assert_eq!(ToolSelector::All.resolve(&tools), vec!["createPage", "getPage"]);
        assert_eq!(ToolSelector::ReadOnly.resolve(&tools), vec!["getPage"]);
        let only = ToolSelector::Only(vec!["createPage".into(), "ghost".into()]);
        assert_eq!(only.resolve(&tools), vec!["createPage"]);
    }

    #[test]
    fn prompt_suffix_appended() {
        let config = ControllerConfig::new("m", "Base.");
        let ask = config.mode("ask").unwrap().clone();
        assert!(config.system_prompt_for(&ask).starts_with("Base.\n\n"));
        let act = config.mode("act").unwrap().clone();
        assert_eq!(config.system_prompt_for(&act), "Base.");
    }

    #[test]
    fn deserializes_partial() {
        let config: ControllerConfig = serde_json::from_value(json!({
            "model": "openai/gpt-4o",
            "modes": [{"name": "act", "max_steps": 7, "tools": {"only": ["getPage"]}}],
            "discovery": {"enabled": false}
        }))
        .unwrap();
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.modes.len(), 1);
        assert!(config.discovery.active().is_none());
        assert_eq!(
            config.mode("act").unwrap().tools,
            ToolSelector::Only(vec!["getPage".into()])
        );
    }
}
