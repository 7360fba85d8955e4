//! Context window management: model limits, pruning, and compaction.
//!
//! The context window is the scarcest resource in a long tool-calling turn.
//! Three layers keep usage under control:
//!
//! 1. **[`budget`]**: [`ModelLimits`] per model (usable budget is
//!    `context_limit - max_output`), token accounting over [`Message`](crate::Message)
//!    parts, [`ContextUsage`] snapshots, and advisory notices at 60% / 80%.
//!
//! 2. **[`pruning`]**: redacts old, large tool results in place while keeping
//!    call ids, tool names, and `original_tokens`. No model call needed.
//!
//! 3. **[`compaction`]**: [`CompactionEngine`] runs pruning above a trigger
//!    ratio and, only when forced or above a hard ceiling, replaces the oldest
//!    block of messages with a single summary message.

pub mod budget;
pub mod compaction;
pub mod pruning;

// Re-export commonly used items at the module level.
pub use budget::{
    CharEstimator, ContextBudget, ContextUsage, ModelLimitTable, ModelLimits, TokenCounter,
    limits_for_model,
};
pub use compaction::{
    CompactionConfig, CompactionEngine, CompactionResult, CompactionStage, CompactionStats,
    MemoryFit, PrepareOptions,
};
pub use pruning::{PruneConfig, PruneEstimate, PruneOutcome};
