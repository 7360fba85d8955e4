//! Two-layer working state for one session.
//!
//! - **Working memory**: the recent assistant and tool messages the
//!   controller folds in after each step.
//! - **Subgoal memory**: the task decomposition extracted from the model's
//!   plan, with per-subgoal progress.
//!
//! Both layers only grow within a turn. [`HierarchicalMemory::compact_working`]
//! (driven by the compaction engine) and [`HierarchicalMemory::restore_state`]
//! (driven by a checkpoint restore) are the only ways to replace contents.

use serde::{Deserialize, Serialize};

use crate::context::budget::output_text;
use crate::{Message, Part};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubgoalStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subgoal {
    pub label: String,
    pub status: SubgoalStatus,
}

/// Serializable snapshot of both layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    pub working: Vec<Message>,
    pub subgoals: Vec<Subgoal>,
}

#[derive(Debug, Clone, Default)]
pub struct HierarchicalMemory {
    working: Vec<Message>,
    subgoals: Vec<Subgoal>,
}

impl HierarchicalMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, message: Message) {
        self.working.push(message);
    }

    /// Working memory in insertion order.
    pub fn get_context(&self) -> &[Message] {
        &self.working
    }

    /// Add a pending subgoal. Returns `false` for an empty or duplicate label.
    pub fn add_subgoal(&mut self, label: impl Into<String>) -> bool {
        let label = label.into();
        let label = label.trim();
        if label.is_empty() || self.subgoals.iter().any(|s| s.label == label) {
            return false;
        }
        self.subgoals.push(Subgoal {
            label: label.to_string(),
            status: SubgoalStatus::Pending,
        });
        true
    }

    /// First subgoal not yet completed.
    pub fn current_subgoal(&self) -> Option<&str> {
        self.subgoals
            .iter()
            .find(|s| s.status == SubgoalStatus::Pending)
            .map(|s| s.label.as_str())
    }

    /// Mark the current subgoal completed. Returns its label.
    pub fn complete_current(&mut self) -> Option<String> {
        let current = self
            .subgoals
            .iter_mut()
            .find(|s| s.status == SubgoalStatus::Pending)?;
        current.status = SubgoalStatus::Completed;
        Some(current.label.clone())
    }

    pub fn completed_subgoals(&self) -> Vec<String> {
        self.subgoals
            .iter()
            .filter(|s| s.status == SubgoalStatus::Completed)
            .map(|s| s.label.clone())
            .collect()
    }

    pub fn subgoals(&self) -> &[Subgoal] {
        &self.subgoals
    }

    /// Completed fraction of subgoals, `None` when there are none.
    pub fn subgoal_progress(&self) -> Option<f64> {
        if self.subgoals.is_empty() {
            return None;
        }
        Some(self.completed_subgoals().len() as f64 / self.subgoals.len() as f64)
    }

    pub fn get_state(&self) -> MemoryState {
        MemoryState {
            working: self.working.clone(),
            subgoals: self.subgoals.clone(),
        }
    }

    pub fn restore_state(&mut self, state: MemoryState) {
        self.working = state.working;
        self.subgoals = state.subgoals;
    }

    /// Swap in a rewritten working layer (redacted copies of the same
    /// messages). Reserved for the compaction engine.
    pub(crate) fn replace_working(&mut self, working: Vec<Message>) {
        self.working = working;
    }

    /// Keep only the `keep` most recent working messages. Returns how many
    /// were dropped.
    pub fn compact_working(&mut self, keep: usize) -> usize {
        let excess = self.working.len().saturating_sub(keep);
        self.working.drain(..excess);
        excess
    }

    /// Cheap token estimate: total characters of both layers / 4, rounded up.
    pub fn estimate_tokens(&self) -> usize {
        let working: usize = self.working.iter().map(message_chars).sum();
        let subgoals: usize = self.subgoals.iter().map(|s| s.label.chars().count()).sum();
        (working + subgoals).div_ceil(4)
    }

    /// Subgoal progress rendered for the system prompt. Empty when there are
    /// no subgoals.
    pub fn to_prompt_section(&self) -> String {
        if self.subgoals.is_empty() {
            return String::new();
        }
        let current = self.current_subgoal();
        let mut s = String::from("## Plan progress\n");
        for goal in &self.subgoals {
            let mark = match goal.status {
                SubgoalStatus::Completed => "[x]",
                SubgoalStatus::Pending if Some(goal.label.as_str()) == current => "[>]",
                SubgoalStatus::Pending => "[ ]",
            };
            s.push_str(&format!("{mark} {}\n", goal.label));
        }
        s
    }
}

fn message_chars(message: &Message) -> usize {
    message
        .parts
        .iter()
        .map(|part| match part {
            Part::Text { text } => text.chars().count(),
            Part::ToolCall {
                tool_name, input, ..
            } => tool_name.chars().count() + input.to_string().chars().count(),
            Part::ToolResult {
                tool_name, output, ..
            } => tool_name.chars().count() + output_text(output).chars().count(),
        })
        .sum()
}
