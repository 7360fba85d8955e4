//! Tool abstractions for the controller's function-calling loop.
//!
//! Every capability the model has over the content store (reading pages,
//! creating sections, uploading media) is a [`Tool`] implementor. Tools are
//! collected into a [`ToolSet`] which handles dispatch, validation,
//! truncation, and timeouts.
//!
//! # Defining tools
//!
//! - **[`FnTool`]**: closure-based, auto-parses arguments. Best for simple tools.
//! - **`impl Tool`**: full struct with manual [`Tool::definition()`] and
//!   [`Tool::execute()`]. Best for tools with state.
//! - **[`DisabledTool`]**: visible to the model but always returns an error.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`ToolSet`], [`FnTool`], [`DisabledTool`].
//! - [`recovery`]: error classification and retry decisions.
//! - [`breaker`]: per-tool circuit breakers.
//! - [`reflection`]: structured error observations for self-correction.
//! - [`discovery`]: hybrid lexical and semantic tool search.

pub mod breaker;
pub mod core;
pub mod discovery;
pub mod recovery;
pub mod reflection;

pub use breaker::{BreakerConfig, BreakerStatus, CircuitBreakerTable, CircuitState};
pub use core::{
    DEFAULT_MAX_RESULT_BYTES, DEFAULT_TOOL_TIMEOUT, DisabledTool, FnTool, Tool, ToolContext,
    ToolFuture, ToolOutput, ToolSet, parse_tool_args, truncate_result, validate_tool_arguments,
};
pub use discovery::{
    DiscoveryConfig, MatchSource, RankedTool, RiskLevel, SearchOptions, ToolDiscoveryIndex,
    ToolMetadata,
};
pub use recovery::{
    ErrorCategory, ErrorClassification, ErrorRecoveryManager, RecoveryConfig, RecoveryStrategy,
    RetryDecision, classify_error,
};
pub use reflection::{format_tool_failure, format_with_error};
