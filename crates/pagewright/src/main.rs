//! Run agent turns from the command line.
//!
//! Reads the chat API key from the variable named by `[model].api_key_env`
//! (default `OPENROUTER_API_KEY`).
//!
//! # Examples
//!
//! ```sh
//! # One turn in the default mode with shell-backed tools
//! pagewright run --prompt "Create an About page" --tools tools.json
//!
//! # Read-only question
//! pagewright run --prompt "Which pages link to /pricing?" --mode ask --tools tools.json
//!
//! # Continue an interrupted session from its last checkpoint
//! pagewright resume --session ses-18c2f0a1b2c-0000 --tools tools.json
//!
//! # Which tools match a request?
//! pagewright search-tools --query "publish the draft" --related --tools tools.json
//!
//! # List stored sessions
//! pagewright sessions
//! ```

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pagewright::prelude::*;
use pagewright::tools::discovery::RiskLevel;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Step-bounded tool-calling agent.
#[derive(Parser)]
#[command(name = "pagewright", version)]
struct Cli {
    /// Configuration file (defaults to ./pagewright.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one user turn
    Run {
        /// The user message
        #[arg(long)]
        prompt: String,

        /// Operating mode (ask, plan, act, or a configured mode)
        #[arg(long)]
        mode: Option<String>,

        /// Continue this session instead of starting a new one
        #[arg(long)]
        session: Option<String>,

        /// JSON file defining the tools
        #[arg(long)]
        tools: Option<PathBuf>,

        /// Approve every tool call that needs confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Resume a session from its last checkpoint
    Resume {
        #[arg(long)]
        session: String,

        #[arg(long)]
        tools: Option<PathBuf>,

        #[arg(long)]
        yes: bool,
    },
    /// Rank tools for a free-text query
    SearchTools {
        #[arg(long)]
        query: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Append related tools of the top results
        #[arg(long)]
        related: bool,

        /// Force semantic ranking (needs embeddings)
        #[arg(long)]
        vector: bool,

        #[arg(long)]
        tools: PathBuf,
    },
    /// List stored sessions
    Sessions,
}

// ── Tool file types ────────────────────────────────────────────────

/// One entry of the tools JSON file: an OpenAI-style definition plus a
/// shell command template.
#[derive(Deserialize)]
struct ToolFileEntry {
    #[serde(flatten)]
    def: ToolDef,
    /// Shell command template. Use {{param_name}} for argument substitution.
    execute: String,
    #[serde(default)]
    metadata: ToolFileMetadata,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ToolFileMetadata {
    examples: Vec<String>,
    category: Option<String>,
    related: Vec<String>,
    risk: RiskLevel,
    mutation: bool,
    requires_confirmation: bool,
}

/// A tool from the tools file that executes via `sh -c`.
struct ShellCommandTool {
    def: ToolDef,
    template: String,
    mutation: bool,
    confirm: bool,
}

impl Tool for ShellCommandTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute<'a>(&'a self, input: &'a Value, _ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let name = self.def.name();
            let cmd = render_command(&self.template, input);
            info!(tool = name, %cmd, "Running shell tool");

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .output()
                .await
                .map_err(|e| format!("failed to start tool '{name}': {e}"))?;

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if !output.status.success() {
                Err(format!(
                    "tool '{name}' exited with {}: {}",
                    output.status,
                    if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() }
                ))
            } else if stderr.trim().is_empty() {
                Ok(Value::String(stdout))
            } else {
                Ok(Value::String(format!("{stdout}\n\n[stderr]\n{stderr}")))
            }
        })
    }

    fn is_mutation(&self) -> bool {
        self.mutation
    }

    fn requires_confirmation(&self) -> bool {
        self.confirm
    }
}

/// Load the tools file into a [`ToolSet`] plus discovery metadata.
fn load_tools(path: &Path) -> Result<(ToolSet, Vec<ToolMetadata>), AgentError> {
    let content = std::fs::read_to_string(path)?;
    let entries: Vec<ToolFileEntry> = serde_json::from_str(&content).map_err(|e| {
        AgentError::Config(format!("failed to parse tools file '{}': {e}", path.display()))
    })?;

    let mut set = ToolSet::new();
    let mut metadata = Vec::with_capacity(entries.len());
    for entry in entries {
        let meta = entry.metadata;
        metadata.push(ToolMetadata {
            examples: meta.examples,
            category: meta.category,
            related: meta.related,
            risk: meta.risk,
            requires_confirmation: meta.requires_confirmation,
            ..ToolMetadata::from_def(&entry.def)
        });
        set.register(ShellCommandTool {
            def: entry.def,
            template: entry.execute,
            mutation: meta.mutation,
            confirm: meta.requires_confirmation,
        });
    }
    info!(path = %path.display(), tools = set.len(), "Loaded tools");
    Ok((set, metadata))
}

/// Substitute `{{param}}` placeholders with single-quoted argument values in
/// one left-to-right pass. A placeholder without an argument becomes `''`.
/// Substituted text is never scanned again.
fn render_command(template: &str, input: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest.get(start + 2..).and_then(|r| r.find("}}")) else {
            break;
        };
        out.push_str(rest.get(..start).unwrap_or_default());
        let name = rest.get(start + 2..start + 2 + end).unwrap_or_default().trim();
        out.push_str(&shell_quote(&argument_text(input.get(name))));
        rest = rest.get(start + 2 + end + 2..).unwrap_or_default();
    }
    out.push_str(rest);
    out
}

fn argument_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ── Console approval ───────────────────────────────────────────────

/// Asks on the terminal before tools that need confirmation run.
struct ConsoleApproval {
    auto_approve: bool,
}

impl EventHandler for ConsoleApproval {
    fn on_event(&self, event: &ControllerEvent<'_>) -> Option<EventResponse> {
        let ControllerEvent::ApprovalRequired { name, input } = event else {
            return None;
        };
        if self.auto_approve {
            return Some(EventResponse::Approve);
        }
        eprint!("Allow {name} {input}? [y/N] ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return Some(EventResponse::Deny("no answer from the operator".into()));
        }
        if matches!(answer.trim(), "y" | "Y" | "yes") {
            Some(EventResponse::Approve)
        } else {
            Some(EventResponse::Deny("the operator declined".into()))
        }
    }
}

// ── Commands ───────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match run_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli(cli: Cli) -> Result<(), AgentError> {
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            prompt,
            mode,
            session,
            tools,
            yes,
        } => {
            let runtime = build_runtime(&settings, tools.as_deref())?;
            let mode = mode.unwrap_or_else(|| settings.controller.default_mode.clone());
            let approval = ConsoleApproval { auto_approve: yes };
            let handler = CompositeEventHandler::new()
                .with(LoggingHandler)
                .with(approval);
            let mut controller = Controller::new(&runtime, settings.controller.clone())
                .with_event_handler(&handler)
                .with_cancellation(cancel_on_ctrl_c());

            let prior = match &session {
                Some(id) => runtime.store().get_messages(id).await?.unwrap_or_default(),
                None => Vec::new(),
            };
            if let Some(id) = session {
                controller = controller.with_session_id(id);
            }

            let result = controller.execute(&prior, &prompt, &mode).await;
            report(&runtime, result)
        }
        Command::Resume {
            session,
            tools,
            yes,
        } => {
            let runtime = build_runtime(&settings, tools.as_deref())?;
            let handler = CompositeEventHandler::new()
                .with(LoggingHandler)
                .with(ConsoleApproval { auto_approve: yes });
            let result = Controller::new(&runtime, settings.controller.clone())
                .with_event_handler(&handler)
                .with_cancellation(cancel_on_ctrl_c())
                .resume(&session)
                .await;
            report(&runtime, result)
        }
        Command::SearchTools {
            query,
            limit,
            related,
            vector,
            tools,
        } => {
            let (_, metadata) = load_tools(&tools)?;
            let index = discovery_index(&settings, metadata)?;
            if settings.discovery.embeddings {
                if let Err(e) = index.build_embeddings().await {
                    warn!("Embedding failed, ranking lexically: {e}");
                }
            }
            let opts = SearchOptions {
                expand_related: related,
                force_vector: vector,
            };
            for hit in index.search(&query, limit, opts).await {
                println!("{:<32} {:>8.3}  {:?}", hit.name, hit.score, hit.source);
            }
            Ok(())
        }
        Command::Sessions => {
            let store = FileSessionStore::new(&settings.session.dir)?;
            for manifest in store.list_sessions().await? {
                println!(
                    "{:<28} {:<12} {:>4} msgs  {}  {}",
                    manifest.session_id,
                    manifest.status,
                    manifest.message_count,
                    manifest.updated_at.format("%Y-%m-%d %H:%M"),
                    manifest.message_preview,
                );
            }
            Ok(())
        }
    }
}

fn build_runtime(settings: &Settings, tools_path: Option<&Path>) -> Result<Runtime, AgentError> {
    let api_key = std::env::var(&settings.model.api_key_env).map_err(|_| {
        AgentError::Config(format!("{} is not set", settings.model.api_key_env))
    })?;
    let mut client = OpenRouterClient::new(api_key)?;
    if let Some(url) = &settings.model.base_url {
        client = client.with_url(url);
    }
    if let Some(temperature) = settings.model.temperature {
        client = client.with_temperature(temperature);
    }
    let model: Arc<dyn ChatModel> = Arc::new(client);

    let (tools, metadata) = match tools_path {
        Some(path) => load_tools(path)?,
        None => (ToolSet::new(), Vec::new()),
    };
    let store = Arc::new(FileSessionStore::new(&settings.session.dir)?);
    let compaction = CompactionEngine::new(settings.compaction.clone()).with_summarizer(model.clone());

    let mut runtime = Runtime::new(model, tools, store)
        .with_recovery(settings.recovery_manager().shared())
        .with_compaction(compaction);
    if !metadata.is_empty() {
        let index = Arc::new(discovery_index(settings, metadata)?);
        // Ranking works lexically until the background build finishes.
        let _ = index.spawn_embedding();
        runtime = runtime.with_discovery(index);
    }
    Ok(runtime)
}

fn discovery_index(
    settings: &Settings,
    metadata: Vec<ToolMetadata>,
) -> Result<ToolDiscoveryIndex, AgentError> {
    let config = settings.discovery.clone();
    let mut index = ToolDiscoveryIndex::new(metadata, config.clone());
    if config.embeddings {
        match std::env::var(&settings.model.embedding_api_key_env) {
            Ok(key) => {
                let embedder =
                    OpenAiEmbedder::new(&config.embedding_base_url, &config.embedding_model, key)?;
                index = index.with_embedder(Arc::new(embedder));
            }
            Err(_) => warn!(
                var = %settings.model.embedding_api_key_env,
                "Embeddings enabled but no API key set, discovery stays lexical-only"
            ),
        }
    }
    Ok(index)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the turn");
            child.cancel();
        }
    });
    token
}

/// Print the turn result and log runtime introspection.
fn report(runtime: &Runtime, result: Result<TurnResult, AgentError>) -> Result<(), AgentError> {
    for status in runtime.breaker_status() {
        info!(
            tool = %status.tool,
            state = ?status.state,
            failures = status.failures,
            "Circuit breaker"
        );
    }

    let result = result?;
    if let Some(stats) = runtime.compaction_stats(&result.session_id) {
        info!(
            passes = stats.passes,
            prune_runs = stats.prune_runs,
            compactions = stats.compactions,
            tokens_saved = stats.tokens_saved,
            "Compaction statistics"
        );
    }
    for error in &result.persistence_errors {
        warn!(%error, "Persistence error during the turn");
    }

    println!("{}", result.final_text);
    if result.step_limit_reached {
        eprintln!(
            "[partial] step limit reached after {} steps ({:.0}% complete). \
             Resume with: pagewright resume --session {}",
            result.steps_used(),
            result.completion_pct,
            result.session_id
        );
    }
    info!(
        session_id = %result.session_id,
        trace_id = %result.trace_id,
        steps = result.steps_used(),
        tokens = result.total_tokens(),
        "Turn finished"
    );
    Ok(())
}
