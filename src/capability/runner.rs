use crate::error::CapabilityError;
use crate::util::{run_command_with_timeout, tail_chars};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const OUTPUT_TAIL_MAX_CHARS: usize = 8_000;

/// Result of one bounded test run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRun {
    pub selector: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl TestRun {
    /// Combined output, stdout first, for feeding back into a retry.
    pub fn output(&self) -> String {
        if self.stderr_tail.trim().is_empty() {
            return self.stdout_tail.clone();
        }
        format!("{}\n{}", self.stdout_tail, self.stderr_tail)
    }
}

/// Runs a test selector (`file` or `file::test_name`) under a hard timeout.
///
/// A timed-out run is `Err(Timeout)`; a run that could not start is
/// `Err(ExternalCallFailure)`. Everything else, pass or fail, is `Ok`.
pub trait TestRunner {
    fn run(&self, selector: &str, timeout: Duration) -> Result<TestRun, CapabilityError>;
}

#[derive(Debug, Clone)]
pub struct PytestRunner {
    cwd: PathBuf,
    program: String,
    args: Vec<String>,
}

impl PytestRunner {
    pub fn new(cwd: &Path, program: impl Into<String>, args: &[String]) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            program: program.into(),
            args: args.to_vec(),
        }
    }

    fn label(&self, selector: &str) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().map(String::as_str));
        if !selector.is_empty() {
            parts.push(selector);
        }
        parts.join(" ")
    }
}

impl TestRunner for PytestRunner {
    fn run(&self, selector: &str, timeout: Duration) -> Result<TestRun, CapabilityError> {
        let mut command = Command::new(&self.program);
        command.current_dir(&self.cwd).args(&self.args);
        if !selector.is_empty() {
            command.arg(selector);
        }

        tracing::debug!(command = %self.label(selector), "running tests");
        let result = run_command_with_timeout(&mut command, timeout).map_err(|e| {
            CapabilityError::external(format!("{}: {}", self.label(selector), e))
        })?;

        if result.timed_out {
            tracing::warn!(selector, secs = timeout.as_secs(), "test run timed out");
            return Err(CapabilityError::Timeout {
                selector: selector.to_string(),
                secs: timeout.as_secs(),
            });
        }

        Ok(TestRun {
            selector: selector.to_string(),
            passed: result.status.map(|s| s.success()).unwrap_or(false),
            exit_code: result.status.and_then(|s| s.code()),
            duration_ms: result.duration.as_millis() as u64,
            stdout_tail: tail_chars(&result.stdout, OUTPUT_TAIL_MAX_CHARS),
            stderr_tail: tail_chars(&result.stderr, OUTPUT_TAIL_MAX_CHARS),
        })
    }
}
