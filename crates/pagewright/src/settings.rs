//! File and environment configuration.
//!
//! Loading order: an optional TOML file (`pagewright.toml` in the working
//! directory, or an explicit path), then `PAGEWRIGHT__*` environment
//! variables. A double underscore separates nesting levels, so
//! `PAGEWRIGHT__CONTROLLER__MAX_TOKENS=8192` sets `controller.max_tokens`.
//! Every section has defaults; an empty file is a valid configuration.
//!
//! ```toml
//! [model]
//! api_key_env = "OPENROUTER_API_KEY"
//!
//! [controller]
//! model = "anthropic/claude-sonnet-4"
//! approval_required_tools = ["deletePage"]
//!
//! [[controller.modes]]
//! name = "act"
//! max_steps = 30
//! tools = "all"
//!
//! [compaction.models."acme/small"]
//! context_limit = 32000
//! max_output = 4000
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AgentError;
use crate::agent::config::ControllerConfig;
use crate::context::compaction::CompactionConfig;
use crate::tools::breaker::BreakerConfig;
use crate::tools::discovery::DiscoveryConfig;
use crate::tools::recovery::{ErrorRecoveryManager, RecoveryConfig};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PAGEWRIGHT";

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_NAME: &str = "pagewright";

/// `[model]`: chat provider connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    /// Chat-completions endpoint override.
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    /// Environment variable holding the embeddings API key.
    pub embedding_api_key_env: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_key_env: "OPENROUTER_API_KEY".into(),
            base_url: None,
            temperature: None,
            embedding_api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

/// `[session]`: where sessions are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub dir: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".pagewright/sessions"),
        }
    }
}

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: ModelSettings,
    pub controller: ControllerConfig,
    pub breaker: BreakerConfig,
    pub recovery: RecoveryConfig,
    pub compaction: CompactionConfig,
    pub discovery: DiscoveryConfig,
    pub session: SessionSettings,
}

impl Settings {
    /// A recovery manager built from `[breaker]` and `[recovery]`.
    pub fn recovery_manager(&self) -> ErrorRecoveryManager {
        ErrorRecoveryManager::new(self.breaker.clone(), self.recovery.clone())
    }
}

/// Load settings from `path` (or `pagewright.toml` when `None`) overlaid by
/// the process environment.
///
/// An explicit path must exist; the default file is optional.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, AgentError> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true);
    build_settings(path, env)
}

fn build_settings(path: Option<&Path>, env: config::Environment) -> Result<Settings, AgentError> {
    let mut builder = config::Config::builder();
    builder = match path {
        Some(path) => {
            debug!(path = %path.display(), "Loading configuration file");
            builder.add_source(config::File::from(path.to_path_buf()).required(true))
        }
        None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_NAME).required(false)),
    };
    let settings: Settings = builder.add_source(env).build()?.try_deserialize()?;

    // Surface a bad default mode at load time rather than on first resume.
    settings.controller.mode(&settings.controller.default_mode)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::config::ToolSelector;
    use std::io::Write;

    fn no_env() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .source(Some(Default::default()))
    }

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_yields_defaults() {
        let file = write_toml("");
        let settings = build_settings(Some(file.path()), no_env()).unwrap();
        assert_eq!(settings.controller.default_mode, "act");
        assert_eq!(settings.controller.modes.len(), 3);
        assert_eq!(settings.breaker.failure_threshold, 3);
        assert_eq!(settings.recovery.max_attempts, 2);
        assert_eq!(settings.model.api_key_env, "OPENROUTER_API_KEY");
    }

    #[test]
    fn file_sections_override_defaults() {
        let file = write_toml(
            r#"
            [controller]
            model = "acme/small"
            approval_required_tools = ["deletePage"]

            [[controller.modes]]
            name = "act"
            max_steps = 30
            tools = "all"

            [breaker]
            failure_threshold = 5

            [compaction.models."acme/small"]
            context_limit = 32000
            max_output = 4000

            [session]
            dir = "/tmp/pw-sessions"
            "#,
        );
        let settings = build_settings(Some(file.path()), no_env()).unwrap();
        assert_eq!(settings.controller.model, "acme/small");
        assert_eq!(settings.controller.approval_required_tools, vec!["deletePage"]);
        let act = settings.controller.mode("act").unwrap();
        assert_eq!(act.max_steps, 30);
        assert_eq!(act.tools, ToolSelector::All);
        assert_eq!(settings.breaker.failure_threshold, 5);
        assert_eq!(settings.compaction.models.lookup("acme/small").context_limit, 32_000);
        assert_eq!(settings.session.dir, PathBuf::from("/tmp/pw-sessions"));
    }

    #[test]
    fn environment_overrides_file() {
        let file = write_toml("[controller]\nmax_tokens = 1000\n");
        let vars: config::Map<String, String> = [
            ("PAGEWRIGHT__CONTROLLER__MAX_TOKENS".to_string(), "8192".to_string()),
            ("PAGEWRIGHT__RECOVERY__MAX_ATTEMPTS".to_string(), "4".to_string()),
        ]
        .into_iter()
        .collect();
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(Some(vars));
        let settings = build_settings(Some(file.path()), env).unwrap();
        assert_eq!(settings.controller.max_tokens, 8192);
        assert_eq!(settings.recovery.max_attempts, 4);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = build_settings(Some(Path::new("/nonexistent/pagewright.toml")), no_env())
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn unknown_default_mode_is_rejected() {
        let file = write_toml("[controller]\ndefault_mode = \"yolo\"\n");
        let err = build_settings(Some(file.path()), no_env()).unwrap_err();
        assert!(matches!(err, AgentError::UnknownMode(_)));
    }
}
