//! Agent runtime: the [`Controller`] loop and its supporting modules.
//!
//! - [`controller::Controller`]: the step-bounded tool-calling loop. Start here.
//! - [`runtime::Runtime`]: process-wide collaborators (model, tools, breaker
//!   table, compaction engine, checkpoint store, discovery index).
//! - [`config`]: [`ControllerConfig`], modes and the [`Toggle`] wrapper.
//! - [`events`]: [`EventHandler`] and [`ControllerEvent`] for observing a turn,
//!   plus the [`TurnResult`] it returns.
//! - [`checkpoint`] and [`session`]: resumable turns over a [`SessionStore`].
//! - [`memory`]: working memory and subgoal tracking.
//! - [`phase`]: best-effort phase tagging of assistant prose.

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod events;
pub mod execution;
pub mod memory;
pub mod phase;
pub mod runtime;
pub mod session;

pub use checkpoint::{CHECKPOINT_INTERVAL, Checkpoint, CheckpointManager, CheckpointParams, should_checkpoint};
pub use config::{ControllerConfig, ModeConfig, Toggle, ToolNarrowingConfig, ToolSelector};
pub use controller::Controller;
pub use events::{
    CompositeEventHandler, ControllerEvent, EventHandler, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler, StepRecord, ToolCallRecord, TurnResult,
};
pub use memory::{HierarchicalMemory, MemoryState, Subgoal, SubgoalStatus};
pub use phase::{Phase, detect_phase, extract_subgoals};
pub use runtime::Runtime;
pub use session::{
    FileSessionStore, MemorySessionStore, SessionManifest, SessionStatus, SessionStore,
    validate_session_id,
};
