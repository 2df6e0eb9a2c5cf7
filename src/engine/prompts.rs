use super::{ReasoningRequest, Task};
use crate::util::truncate;

/// Longest capability reply echoed back per exchange.
const MAX_REPLY_CHARS: usize = 12_000;

pub const REPAIR_SYSTEM: &str = r#"You repair failing Python API tests (pytest + requests).

You are given the failure details, the HTTP interaction from the failed run, and
feedback from earlier attempts. Work in rounds: ask for capabilities, read their
results, then decide.

Rules:
- Fix the TEST to match the API's real behavior. Never weaken an assertion into
  something that always passes.
- Read the test file before writing it. A write replaces the whole file, so send
  the complete new content.
- Only files under the test directory can be read or written.
- Use call_api to confirm what the endpoint actually returns when unsure.

Respond with ONLY a JSON object:
{
  "reasoning": "what is wrong and what you are doing about it",
  "invocations": [ {"capability": "<name>", ...arguments} ],
  "status": "continue" | "fix_applied" | "no_further_action"
}

Use "continue" while you still need capability results, "fix_applied" once your
write is in place, "no_further_action" if no test change can fix this."#;

pub const GENERATE_SYSTEM: &str = r#"You write ONE new pytest test function for an API scenario that has no test yet.

Match the exemplar files exactly: imports already present, fixture names,
BASE_URL usage, naming style, assertion style. Do not repeat imports or
fixtures; your function is appended to an existing file.

Respond with ONLY a JSON object:
{
  "reasoning": "one sentence",
  "status": "done",
  "code": "<the test function source, starting with the marker comment line>"
}"#;

pub fn system_prompt(task: Task) -> &'static str {
    match task {
        Task::Repair => REPAIR_SYSTEM,
        Task::Generate => GENERATE_SYSTEM,
    }
}

/// Render everything the engine needs for one turn.
pub fn render_user(request: &ReasoningRequest) -> String {
    let mut out = String::new();
    out.push_str(&request.context);
    if !out.ends_with('\n') {
        out.push('\n');
    }

    if !request.capabilities.is_empty() {
        out.push_str("\nAvailable capabilities:\n");
        for cap in &request.capabilities {
            out.push_str(&format!(
                "- {}: {} Parameters: {}\n",
                cap.name, cap.description, cap.parameters
            ));
        }
    }

    if !request.prior_feedback.is_empty() {
        out.push_str("\nPrevious attempts (all failed):\n");
        for (i, feedback) in request.prior_feedback.iter().enumerate() {
            out.push_str(&format!("--- attempt {} ---\n{}\n", i + 1, feedback.trim_end()));
        }
    }

    if !request.exchanges.is_empty() {
        out.push_str("\nResults of your capability calls so far:\n");
        for exchange in &request.exchanges {
            let reply = serde_json::to_string(&exchange.reply)
                .unwrap_or_else(|_| "{\"ok\": false}".to_string());
            out.push_str(&format!(
                "> {}\n{}\n",
                exchange.invocation.describe(),
                truncate(&reply, MAX_REPLY_CHARS)
            ));
        }
    }
    out
}
