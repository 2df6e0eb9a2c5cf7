//! The reasoning-engine seam.
//!
//! Orchestrators talk to any [`ReasoningEngine`]: they send a
//! [`ReasoningRequest`] and get back a [`ReasoningTurn`] holding a reasoning
//! trace, the capability invocations the engine wants executed, and a signal.
//! The engine never touches files itself.

mod openrouter;
mod parse;
mod prompts;

pub use openrouter::OpenRouterEngine;
pub use parse::parse_turn;

use crate::capability::{CapabilityReply, Invocation};
use serde::{Deserialize, Serialize};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Diagnose a failing test and edit it until it passes.
    Repair,
    /// Write one new test function for an uncovered scenario.
    Generate,
}

/// Name, purpose and JSON-schema parameters of one capability, as shown to
/// the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

/// A capability call and what came back, fed into the next turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub invocation: Invocation,
    pub reply: CapabilityReply,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningRequest {
    pub task: Task,
    pub context: String,
    pub capabilities: Vec<CapabilitySpec>,
    /// Feedback from every earlier attempt, oldest first.
    pub prior_feedback: Vec<String>,
    /// Invocations executed so far in the current attempt.
    pub exchanges: Vec<Exchange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Execute the invocations and come back with their results.
    #[default]
    Continue,
    FixApplied,
    NoFurtherAction,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReasoningTurn {
    pub reasoning: String,
    pub invocations: Vec<Invocation>,
    pub signal: Signal,
    /// Source code produced by a `Generate` task.
    pub artifact: Option<String>,
}

pub trait ReasoningEngine {
    fn respond(
        &self,
        request: &ReasoningRequest,
    ) -> impl Future<Output = anyhow::Result<ReasoningTurn>> + Send;
}

/// Capabilities the engine may invoke for `task`.
pub fn capability_specs(task: Task) -> Vec<CapabilitySpec> {
    match task {
        Task::Repair => vec![
            CapabilitySpec {
                name: "read",
                description: "Read a test source file. Paths are relative to the project root and must stay inside the test directory.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "e.g. tests/api/test_users.py"}
                    },
                    "required": ["path"]
                }),
            },
            CapabilitySpec {
                name: "write",
                description: "Replace a test source file with new content. The previous content is backed up first. Send the whole file.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string", "description": "Complete new file content"}
                    },
                    "required": ["path", "content"]
                }),
            },
            CapabilitySpec {
                name: "call_api",
                description: "Call the API under test to see what it really returns. Relative targets are resolved against the configured base URL.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "method": {"type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"]},
                        "target": {"type": "string", "description": "e.g. /users/1"},
                        "payload": {"type": "object", "description": "JSON body for POST/PUT/PATCH"}
                    },
                    "required": ["method", "target"]
                }),
            },
            CapabilitySpec {
                name: "run_test",
                description: "Run a pytest selector (file or file::test_name) and report pass/fail with output.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "selector": {"type": "string"}
                    },
                    "required": ["selector"]
                }),
            },
            CapabilitySpec {
                name: "list_test_files",
                description: "List every test file under the test directory.",
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            },
        ],
        // Generation gets its exemplars inline and answers with code only.
        Task::Generate => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_advertises_all_capabilities() {
        let names: Vec<_> = capability_specs(Task::Repair)
            .iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(
            names,
            vec!["read", "write", "call_api", "run_test", "list_test_files"]
        );
        assert!(capability_specs(Task::Generate).is_empty());
    }

    #[test]
    fn test_signal_wire_names() {
        let s: Signal = serde_json::from_str("\"fix_applied\"").unwrap();
        assert_eq!(s, Signal::FixApplied);
        assert_eq!(
            serde_json::to_string(&Signal::NoFurtherAction).unwrap(),
            "\"no_further_action\""
        );
    }
}
