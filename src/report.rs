//! Session outcomes, attempt traces and the end-of-run summary.

use serde::Serialize;

/// How a repair or generation session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    Succeeded,
    FailedRolledBack,
    FailedQuotaExhausted,
}

impl SessionOutcome {
    pub fn label(self) -> &'static str {
        match self {
            SessionOutcome::Succeeded => "Succeeded",
            SessionOutcome::FailedRolledBack => "Failed-RolledBack",
            SessionOutcome::FailedQuotaExhausted => "Failed-QuotaExhausted",
        }
    }

    pub fn is_success(self) -> bool {
        self == SessionOutcome::Succeeded
    }
}

/// One executed capability call, as recorded in an attempt trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub invocation: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One diagnose/edit/validate cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptResult {
    pub attempt: u32,
    pub reasoning: Vec<String>,
    pub trace: Vec<TraceEntry>,
    pub validation_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttemptResult {
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            reasoning: Vec::new(),
            trace: Vec::new(),
            validation_passed: false,
            error: None,
        }
    }
}

/// A test-level line in the final summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryItem {
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub initial_suite_passed: Option<bool>,
    pub failures_found: usize,
    pub healed: Vec<SummaryItem>,
    pub heal_failures: Vec<SummaryItem>,
    pub generated: Vec<SummaryItem>,
    pub generation_failures: Vec<SummaryItem>,
    pub generation_outcome: Option<SessionOutcome>,
    pub final_suite_passed: Option<bool>,
}

impl Summary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("\n{}\n", "=".repeat(60)));
        out.push_str("  SUMMARY\n");
        out.push_str(&format!("{}\n", "=".repeat(60)));

        if let Some(passed) = self.initial_suite_passed {
            out.push_str(&format!("  Initial suite:       {}\n", pass_label(passed)));
        }
        out.push_str(&format!("  Failures found:      {}\n", self.failures_found));
        out.push_str(&format!("  Healed:              {}\n", self.healed.len()));
        for item in &self.healed {
            out.push_str(&format!("    + {} ({})\n", item.name, item.detail));
        }
        out.push_str(&format!("  Heal failures:       {}\n", self.heal_failures.len()));
        for item in &self.heal_failures {
            out.push_str(&format!("    - {}: {}\n", item.name, item.detail));
        }
        out.push_str(&format!("  Generated tests:     {}\n", self.generated.len()));
        for item in &self.generated {
            out.push_str(&format!("    + {} ({})\n", item.name, item.detail));
        }
        out.push_str(&format!(
            "  Generation failures: {}\n",
            self.generation_failures.len()
        ));
        for item in &self.generation_failures {
            out.push_str(&format!("    - {}: {}\n", item.name, item.detail));
        }
        if let Some(outcome) = self.generation_outcome {
            out.push_str(&format!("  Generation session:  {}\n", outcome.label()));
        }
        if let Some(passed) = self.final_suite_passed {
            out.push_str(&format!("  Final suite:         {}\n", pass_label(passed)));
        }
        out
    }
}

fn pass_label(passed: bool) -> &'static str {
    if passed {
        "PASSED"
    } else {
        "FAILED"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_every_section() {
        let summary = Summary {
            initial_suite_passed: Some(false),
            failures_found: 2,
            healed: vec![SummaryItem {
                name: "test_get_user".to_string(),
                detail: "1 attempt".to_string(),
            }],
            heal_failures: vec![SummaryItem {
                name: "test_list_posts".to_string(),
                detail: "Failed-RolledBack after 3 attempts".to_string(),
            }],
            generation_outcome: Some(SessionOutcome::FailedQuotaExhausted),
            final_suite_passed: Some(true),
            ..Summary::default()
        };
        let text = summary.render();
        assert!(text.contains("Failures found:      2"));
        assert!(text.contains("+ test_get_user (1 attempt)"));
        assert!(text.contains("- test_list_posts: Failed-RolledBack"));
        assert!(text.contains("Generation session:  Failed-QuotaExhausted"));
        assert!(text.contains("Final suite:         PASSED"));
    }
}
