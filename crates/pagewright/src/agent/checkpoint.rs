//! Checkpoint and resume for long tool-calling turns.
//!
//! A [`Checkpoint`] captures everything needed to rebuild a controller
//! mid-turn: messages, both memory layers, step number, phase and mode.
//! One checkpoint per session; saving replaces the previous one.
//!
//! Persistence goes through a [`SessionStore`]. Whether a checkpoint is due
//! is decided by the pure [`should_checkpoint`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::agent::memory::MemoryState;
use crate::agent::phase::Phase;
use crate::agent::session::SessionStore;
use crate::{AgentError, Message};

/// Steps between cadence checkpoints.
pub const CHECKPOINT_INTERVAL: u32 = 3;

/// Serializable snapshot of one session's execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub session_id: String,
    /// Trace id of the execution that wrote the checkpoint.
    pub trace_id: String,
    pub phase: Phase,
    pub mode: String,
    /// Last completed step.
    pub step: u32,
    pub messages: Vec<Message>,
    pub memory: MemoryState,
    #[serde(default)]
    pub current_subgoal: Option<String>,
    #[serde(default)]
    pub completed_subgoals: Vec<String>,
    #[serde(default)]
    pub last_tool_result: Option<Value>,
    pub token_estimate: usize,
    /// 0.0 to 100.0.
    pub completion_pct: f64,
    /// Messages from the last completed step that have not yet been folded
    /// into working memory.
    #[serde(default)]
    pub unfolded_step: Vec<Message>,
    pub saved_at: DateTime<Utc>,
}

/// Inputs to [`should_checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointParams {
    pub step: u32,
    pub phase: Phase,
    pub previous_phase: Phase,
    /// The next step needs human approval.
    pub needs_approval: bool,
    /// The step that just finished had a tool error.
    pub is_after_error: bool,
}

/// Checkpoint every [`CHECKPOINT_INTERVAL`] steps, on a phase transition,
/// before an approval step, and after a tool error. Any one trigger is
/// enough.
pub fn should_checkpoint(params: &CheckpointParams) -> bool {
    let cadence = params.step > 0 && params.step % CHECKPOINT_INTERVAL == 0;
    cadence
        || params.previous_phase != params.phase
        || params.needs_approval
        || params.is_after_error
}

/// Saves and restores checkpoints through a [`SessionStore`].
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Persist `checkpoint`, replacing the session's previous one.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        let blob = serde_json::to_value(checkpoint)?;
        self.store
            .set_checkpoint(&checkpoint.session_id, &blob)
            .await?;
        info!(
            session_id = %checkpoint.session_id,
            step = checkpoint.step,
            phase = %checkpoint.phase,
            tokens = checkpoint.token_estimate,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// The last saved checkpoint, or `None` when the session has none.
    pub async fn restore(&self, session_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let Some(blob) = self.store.get_checkpoint(session_id).await? else {
            debug!(session_id, "No checkpoint to restore");
            return Ok(None);
        };
        let checkpoint: Checkpoint = serde_json::from_value(blob)
            .map_err(|e| AgentError::Persistence(format!("corrupt checkpoint for {session_id}: {e}")))?;
        Ok(Some(checkpoint))
    }

    pub async fn clear(&self, session_id: &str) -> Result<(), AgentError> {
        self.store.delete_checkpoint(session_id).await
    }

    pub fn should_checkpoint(&self, params: &CheckpointParams) -> bool {
        should_checkpoint(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::memory::HierarchicalMemory;
    use crate::agent::session::MemorySessionStore;

    fn params(step: u32) -> CheckpointParams {
        CheckpointParams {
            step,
            phase: Phase::Executing,
            previous_phase: Phase::Executing,
            needs_approval: false,
            is_after_error: false,
        }
    }

    #[test]
    fn cadence_every_third_step() {
        let due: Vec<u32> = (0..=10).filter(|s| should_checkpoint(&params(*s))).collect();
        assert_eq!(due, vec![3, 6, 9]);
    }

    #[test]
    fn each_trigger_is_independent() {
        let phase_change = CheckpointParams {
            previous_phase: Phase::Planning,
            ..params(1)
        };
        assert!(should_checkpoint(&phase_change));

        let approval = CheckpointParams {
            needs_approval: true,
            ..params(2)
        };
        assert!(should_checkpoint(&approval));

        let error = CheckpointParams {
            is_after_error: true,
            ..params(4)
        };
        assert!(should_checkpoint(&error));

        let cadence_with_flags = CheckpointParams {
            is_after_error: true,
            needs_approval: true,
            ..params(6)
        };
        assert!(should_checkpoint(&cadence_with_flags));
        assert!(!should_checkpoint(&params(5)));
    }

    fn sample(step: u32) -> Checkpoint {
        let mut memory = HierarchicalMemory::new();
        memory.add_message(Message::assistant_text("read the home page"));
        memory.add_subgoal("Create the About page");
        Checkpoint {
            session_id: "ses-1".into(),
            trace_id: "tr-1".into(),
            phase: Phase::Executing,
            mode: "act".into(),
            step,
            messages: vec![Message::user("Create an About page")],
            memory: memory.get_state(),
            current_subgoal: memory.current_subgoal().map(String::from),
            completed_subgoals: Vec::new(),
            last_tool_result: Some(serde_json::json!({"id": 7})),
            token_estimate: 12,
            completion_pct: 0.0,
            unfolded_step: vec![Message::assistant_text("creating")],
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_restore_is_exact() {
        let manager = CheckpointManager::new(Arc::new(MemorySessionStore::new()));
        let cp = sample(3);
        manager.save(&cp).await.unwrap();
        let restored = manager.restore("ses-1").await.unwrap().unwrap();
        assert_eq!(restored, cp);
    }

    #[tokio::test]
    async fn save_overwrites_previous() {
        let manager = CheckpointManager::new(Arc::new(MemorySessionStore::new()));
        manager.save(&sample(3)).await.unwrap();
        manager.save(&sample(6)).await.unwrap();
        assert_eq!(manager.restore("ses-1").await.unwrap().unwrap().step, 6);
    }

    #[tokio::test]
    async fn restore_missing_and_corrupt() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = CheckpointManager::new(store.clone());
        assert!(manager.restore("ses-x").await.unwrap().is_none());

        store
            .set_checkpoint("ses-x", &serde_json::json!({"step": "nope"}))
            .await
            .unwrap();
        let err = manager.restore("ses-x").await.unwrap_err();
        assert!(matches!(err, AgentError::Persistence(_)));

        manager.clear("ses-x").await.unwrap();
        assert!(manager.restore("ses-x").await.unwrap().is_none());
    }
}
