//! Convenience re-exports for common `pagewright` types.
//!
//! Meant to be glob-imported when embedding the engine:
//!
//! ```ignore
//! use pagewright::prelude::*;
//! ```
//!
//! This pulls in the types needed by most programs: the [`Controller`] and
//! its config, the [`Runtime`], [`Message`] constructors, the [`Tool`] trait
//! and [`ToolSet`], event handlers and the session stores. Compaction
//! internals and breaker tables are left out; import those from their
//! modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    AgentError, ChatModel, Message, MessageRole, ModelRequest, ModelResponse, Part,
    ToolCallRequest, ToolDef, json_schema_for,
};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    CompositeEventHandler, Controller, ControllerConfig, ControllerEvent, EventHandler,
    EventResponse, FileSessionStore, FnEventHandler, LoggingHandler, MemorySessionStore,
    ModeConfig, NoopHandler, Phase, Runtime, SessionStore, Toggle, ToolNarrowingConfig,
    ToolSelector, TurnResult,
};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::api::{Embedder, OpenAiEmbedder, OpenRouterClient};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{CompactionConfig, CompactionEngine, ContextBudget, PruneConfig};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    DisabledTool, DiscoveryConfig, FnTool, SearchOptions, Tool, ToolContext, ToolDiscoveryIndex,
    ToolFuture, ToolMetadata, ToolSet, parse_tool_args,
};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::settings::{Settings, load_settings};
