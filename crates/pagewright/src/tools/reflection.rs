//! Structured reflection on tool failures.
//!
//! When a tool returns an error, wrap it in a structured format that helps
//! the model reason about what went wrong and how to recover.

use serde_json::Value;

use crate::tools::recovery::{ErrorClassification, RecoveryStrategy};

/// Format a tool failure as the observation the model sees.
///
/// Includes the original error, its category, the category's suggestions,
/// and a truncated copy of the arguments.
pub fn format_tool_failure(tool_name: &str, input: &Value, class: &ErrorClassification) -> String {
    format_with_error(tool_name, input, class, None)
}

/// Like [`format_tool_failure`] but with the raw error text included.
pub fn format_with_error(
    tool_name: &str,
    input: &Value,
    class: &ErrorClassification,
    error: Option<&str>,
) -> String {
    let mut msg = format!("Error from tool '{tool_name}' ({}):\n", class.category);
    if let Some(error) = error {
        msg.push_str(&format!("  {error}\n"));
    }

    if !class.suggestions.is_empty() {
        msg.push_str("\nPossible causes and recovery:\n");
        for suggestion in class.suggestions {
            msg.push_str(&format!("  - {suggestion}\n"));
        }
    }
    if class.strategy == RecoveryStrategy::Escalate {
        msg.push_str("  - Do not retry this call automatically.\n");
    }

    let arguments = input.to_string();
    let args_preview: String = arguments.chars().take(200).collect();
    msg.push_str(&format!("\nArguments used: {args_preview}"));
    if arguments.chars().count() > 200 {
        msg.push_str("...");
    }

    msg
}
