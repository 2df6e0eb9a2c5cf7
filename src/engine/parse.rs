use super::{ReasoningTurn, Signal};
use crate::capability::Invocation;
use serde::Deserialize;
use serde_json::Value;

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = ["```json", "```python", "```py", "```"]
        .iter()
        .find_map(|fence| trimmed.strip_prefix(fence))
        .unwrap_or(trimmed);
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Try to fix common JSON issues from LLM responses
fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    fixed = fixed.replace(['\u{201C}', '\u{201D}'], "\"");

    fixed
}

#[derive(Deserialize)]
struct TurnJson {
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    invocations: Vec<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Parse a `{ reasoning, invocations, status, code? }` reply.
///
/// Invocations that don't match any capability are dropped with a warning
/// rather than failing the whole turn.
pub fn parse_turn(response: &str) -> anyhow::Result<ReasoningTurn> {
    let clean = strip_markdown_fences(response);
    let fragment = extract_json_fragment(clean, '{', '}')
        .ok_or_else(|| anyhow::anyhow!("No JSON object in engine response"))?;

    let parsed: TurnJson = match serde_json::from_str(fragment) {
        Ok(parsed) => parsed,
        Err(_) => serde_json::from_str(&fix_json_issues(fragment))
            .map_err(|e| anyhow::anyhow!("Failed to parse engine response: {}", e))?,
    };

    let mut invocations = Vec::with_capacity(parsed.invocations.len());
    for raw in parsed.invocations {
        match serde_json::from_value::<Invocation>(raw.clone()) {
            Ok(invocation) => invocations.push(invocation),
            Err(err) => tracing::warn!(
                invocation = %raw,
                error = %err,
                "dropping unrecognized invocation"
            ),
        }
    }

    let signal = match parsed
        .status
        .as_deref()
        .map(|s| s.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("fix_applied") | Some("fixed") | Some("done") => Signal::FixApplied,
        Some("no_further_action") | Some("give_up") | Some("none") => Signal::NoFurtherAction,
        _ => Signal::Continue,
    };

    let artifact = parsed
        .code
        .map(|code| strip_markdown_fences(&code).to_string())
        .filter(|code| !code.is_empty());

    Ok(ReasoningTurn {
        reasoning: parsed.reasoning,
        invocations,
        signal,
        artifact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn_with_fences_and_invocations() {
        let response = r#"```json
{
  "reasoning": "The API returns name, not firstName.",
  "invocations": [
    {"capability": "read", "path": "tests/api/test_users.py"},
    {"capability": "call_api", "method": "GET", "target": "/users/1"}
  ],
  "status": "continue"
}
```"#;
        let turn = parse_turn(response).unwrap();
        assert_eq!(turn.invocations.len(), 2);
        assert_eq!(turn.signal, Signal::Continue);
        assert!(turn.reasoning.contains("firstName"));
    }

    #[test]
    fn test_unknown_invocations_are_dropped() {
        let response = r#"{"invocations": [{"capability": "shell", "command": "ls"}, {"capability": "list_test_files"}], "status": "done",}"#;
        let turn = parse_turn(response).unwrap();
        assert_eq!(turn.invocations, vec![Invocation::ListTestFiles]);
        assert_eq!(turn.signal, Signal::FixApplied);
    }

    #[test]
    fn test_code_artifact_is_unfenced() {
        let response = r#"Here you go: {"reasoning": "r", "status": "done", "code": "```python\ndef test_x():\n    assert True\n```"}"#;
        let turn = parse_turn(response).unwrap();
        assert_eq!(
            turn.artifact.as_deref(),
            Some("def test_x():\n    assert True")
        );
    }

    #[test]
    fn test_no_json_is_an_error() {
        assert!(parse_turn("I could not decide.").is_err());
    }
}
