//! Captured test failures.
//!
//! The pytest capture hook writes one JSON record per failing test. Records
//! are read-only input: nothing here mutates them after load. Everything but
//! the test location is best-effort, because assertion text is mined with
//! heuristics and HTTP context is missing when the test never reached the
//! network.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_file: String,
    pub test_name: String,
    #[serde(default = "unknown_error_type", rename = "error_type")]
    pub error_kind: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub actual: Option<Value>,
    #[serde(default)]
    pub expected: Option<Value>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub traceback: Option<String>,
}

fn unknown_error_type() -> String {
    "Exception".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status_code: u16,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub test_failure: TestFailure,
    #[serde(default)]
    pub api_response: Option<ApiResponse>,
    #[serde(default)]
    pub request_method: Option<String>,
    #[serde(default)]
    pub request_url: Option<String>,
    #[serde(default)]
    pub request_payload: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl FailureRecord {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read failure record {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Malformed failure record {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let record: FailureRecord = serde_json::from_str(content)?;
        if record.test_failure.test_file.trim().is_empty()
            || record.test_failure.test_name.trim().is_empty()
        {
            anyhow::bail!("failure record is missing test_file or test_name");
        }
        Ok(record)
    }

    pub fn test_name(&self) -> &str {
        &self.test_failure.test_name
    }

    /// Runner selector for exactly the failing test, relative to the project
    /// root when the recorded path is absolute and lives under it.
    pub fn selector(&self, project_root: &Path) -> String {
        let file = Path::new(&self.test_failure.test_file);
        let shown = if file.is_absolute() {
            let root = project_root
                .canonicalize()
                .unwrap_or_else(|_| project_root.to_path_buf());
            file.strip_prefix(&root)
                .or_else(|_| file.strip_prefix(project_root))
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| self.test_failure.test_file.clone())
        } else {
            self.test_failure.test_file.clone()
        };
        format!("{}::{}", shown, self.test_failure.test_name)
    }

    /// Render the full failure context for the reasoning engine.
    pub fn to_context(&self) -> String {
        let tf = &self.test_failure;
        let mut out = String::new();
        out.push_str("Test Details:\n");
        out.push_str(&format!("- Test File: {}\n", tf.test_file));
        out.push_str(&format!("- Test Name: {}\n", tf.test_name));
        out.push_str(&format!("- Error Type: {}\n", tf.error_kind));
        out.push_str(&format!("- Error Message: {}\n", tf.error_message));
        out.push_str(&format!("- Line Number: {}\n", display_opt(tf.line_number)));
        out.push_str("\nFailure Information:\n");
        out.push_str(&format!("- Expected: {}\n", display_value(tf.expected.as_ref())));
        out.push_str(&format!("- Actual: {}\n", display_value(tf.actual.as_ref())));

        out.push_str("\nHTTP Interaction (from the failed run):\n");
        out.push_str(&format!(
            "- Request: {} {}\n",
            self.request_method.as_deref().unwrap_or("N/A"),
            self.request_url.as_deref().unwrap_or("N/A")
        ));
        if let Some(payload) = &self.request_payload {
            out.push_str(&format!("- Request Payload: {}\n", pretty(payload)));
        }
        match &self.api_response {
            Some(resp) => {
                out.push_str(&format!("- Status Code: {}\n", resp.status_code));
                out.push_str(&format!("- Response Body: {}\n", pretty(&resp.body)));
                if !resp.headers.is_empty() {
                    let headers = resp
                        .headers
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k, v))
                        .collect::<Vec<_>>()
                        .join(", ");
                    out.push_str(&format!("- Response Headers: {}\n", headers));
                }
            }
            None => out.push_str("- Response: N/A (no response captured)\n"),
        }

        if let Some(tb) = tf.traceback.as_deref().filter(|t| !t.trim().is_empty()) {
            out.push_str("\nFull Traceback:\n");
            out.push_str(tb);
            if !tb.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "N/A".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn pretty(value: &Value) -> String {
    if value.is_null() {
        return "N/A".to_string();
    }
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Every `*.json` directly inside `failures_dir`, sorted by name.
pub fn collect_failure_files(failures_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(failures_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter(|p| {
            !p.file_name()
                .map(|n| n.to_string_lossy().contains(".backup"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}
