//! Best-effort phase tagging from assistant prose.
//!
//! The model does not report its phase, so the controller infers a coarse
//! label from textual markers. This misfires on unrelated text that happens
//! to contain a marker; callers treat the result as a hint for checkpoint
//! cadence and subgoal tracking only, and keep the previous phase when
//! nothing matches.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Executing,
    Verifying,
    Reflecting,
    #[default]
    Unknown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Planning => "planning",
            Phase::Executing => "executing",
            Phase::Verifying => "verifying",
            Phase::Reflecting => "reflecting",
            Phase::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Checked in this order; the first phase with a matching marker wins.
const MARKERS: &[(Phase, &[&str])] = &[
    (
        Phase::Reflecting,
        &[
            "looking back",
            "in hindsight",
            "what went wrong",
            "i should have",
            "lesson learned",
            "reflecting on",
            "my mistake",
        ],
    ),
    (
        Phase::Verifying,
        &[
            "verify",
            "verifying",
            "double-check",
            "double check",
            "confirm that",
            "let me check",
            "make sure",
            "looks correct",
        ],
    ),
    (
        Phase::Planning,
        &[
            "my plan",
            "here's the plan",
            "here is the plan",
            "plan:",
            "steps:",
            "first, i will",
            "first, i'll",
            "i will start by",
            "i'll start by",
        ],
    ),
    (
        Phase::Executing,
        &[
            "now i will",
            "now i'll",
            "i'll now",
            "next, i",
            "creating",
            "updating",
            "adding",
            "deleting",
            "uploading",
        ],
    ),
];

/// Infer a phase from assistant text. Falls back to `Executing` when the
/// step issued tool calls, otherwise `Unknown`.
pub fn detect_phase(text: &str, has_tool_calls: bool) -> Phase {
    let lower = text.to_lowercase();
    MARKERS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(phase, _)| *phase)
        .unwrap_or(if has_tool_calls {
            Phase::Executing
        } else {
            Phase::Unknown
        })
}

/// Numbered or bulleted lines from a plan, cleaned of list markers and
/// markdown emphasis.
pub fn extract_subgoals(text: &str) -> Vec<String> {
    const MAX_SUBGOALS: usize = 12;

    text.lines()
        .filter_map(strip_list_marker)
        .map(|s| s.replace("**", "").replace('`', "").trim().to_string())
        .filter(|s| s.chars().count() >= 3)
        .take(MAX_SUBGOALS)
        .collect()
}

fn strip_list_marker(line: &str) -> Option<&str> {
    let line = line.trim_start();
    for bullet in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return Some(rest);
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 || digits > 2 {
        return None;
    }
    let rest = line.get(digits..)?;
    rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_phases_by_marker() {
        assert_eq!(detect_phase("Here's the plan:\n1. a", false), Phase::Planning);
        assert_eq!(detect_phase("Now I will create the page.", true), Phase::Executing);
        assert_eq!(detect_phase("Let me check the result.", true), Phase::Verifying);
        assert_eq!(detect_phase("In hindsight the slug was wrong.", false), Phase::Reflecting);
    }

    #[test]
    fn reflecting_outranks_other_markers() {
        let text = "Looking back, I should verify the plan: it failed.";
        assert_eq!(detect_phase(text, false), Phase::Reflecting);
    }

    #[test]
    fn fallback_depends_on_tool_calls() {
        assert_eq!(detect_phase("ok", true), Phase::Executing);
        assert_eq!(detect_phase("ok", false), Phase::Unknown);
        assert_eq!(detect_phase("", false), Phase::Unknown);
    }

    #[test]
    fn extracts_numbered_and_bulleted_lines() {
        let plan = "My plan:\n1. Create the **About** page\n2) Add `about` to the menu\n\
                    - Publish\n* ok\nNot a step\n123. too many digits";
        assert_eq!(
            extract_subgoals(plan),
            vec!["Create the About page", "Add about to the menu", "Publish"]
        );
    }

    #[test]
    fn extraction_caps_results() {
        let plan: String = (1..=20).map(|i| format!("{i}. step number {i}\n")).collect();
        assert_eq!(extract_subgoals(&plan).len(), 12);
    }
}
