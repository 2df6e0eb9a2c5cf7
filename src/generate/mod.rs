//! Generation orchestrator.
//!
//! Walks the gap queue in priority order. Each attempted gap costs one unit of
//! the quota whatever its fate; gaps found already covered are skipped for
//! free. A candidate is checked before it touches a file and validated after;
//! a failing candidate rolls back its own file only.

#[cfg(test)]
mod tests;

use crate::capability::{TestRunner, Workspace};
use crate::config::Config;
use crate::coverage::{detect_gaps, python, Catalog, CoverageIndex, Gap};
use crate::engine::{capability_specs, ReasoningEngine, ReasoningRequest, Task};
use crate::error::CapabilityError;
use crate::report::{AttemptResult, SessionOutcome, TraceEntry};
use crate::util::truncate;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

const MAX_EXEMPLARS: usize = 3;
const EXEMPLAR_MAX_CHARS: usize = 1_500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateSettings {
    pub max_generations: usize,
    pub reasoning_timeout: Duration,
    pub marker: String,
    pub base_url: String,
}

impl From<&Config> for GenerateSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_generations: config.max_generations,
            reasoning_timeout: config.reasoning_timeout(),
            marker: config.generated_marker.clone(),
            base_url: config.api_base_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GapStatus {
    /// Inserted, passed on its own, kept with its marker.
    Kept,
    /// Inserted, failed validation, file restored.
    RolledBack,
    /// Attempted but never written (engine failure, invalid or duplicate candidate).
    Discarded,
    /// Already covered when its turn came; no quota used.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct GapReport {
    pub gap: Gap,
    pub status: GapStatus,
    pub function_name: Option<String>,
    pub file: String,
    pub detail: Option<String>,
    pub attempt: Option<AttemptResult>,
}

impl GapReport {
    /// Per-gap session outcome; `None` for gaps that were never attempted.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self.status {
            GapStatus::Kept => Some(SessionOutcome::Succeeded),
            GapStatus::RolledBack | GapStatus::Discarded => Some(SessionOutcome::FailedRolledBack),
            GapStatus::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub outcome: SessionOutcome,
    pub attempts_used: usize,
    pub gaps: Vec<GapReport>,
    /// Uncovered gaps left in the queue when the quota ran out.
    pub remaining: Vec<Gap>,
}

impl GenerationReport {
    pub fn kept(&self) -> impl Iterator<Item = &GapReport> {
        self.gaps.iter().filter(|g| g.status == GapStatus::Kept)
    }
}

pub struct Generator<'a, E, R: TestRunner> {
    engine: &'a E,
    workspace: &'a mut Workspace<R>,
    catalog: &'a Catalog,
    settings: GenerateSettings,
}

impl<'a, E: ReasoningEngine, R: TestRunner> Generator<'a, E, R> {
    pub fn new(
        engine: &'a E,
        workspace: &'a mut Workspace<R>,
        catalog: &'a Catalog,
        settings: GenerateSettings,
    ) -> Self {
        Self {
            engine,
            workspace,
            catalog,
            settings,
        }
    }

    /// The ordered gap queue for the current tree.
    pub fn gaps(&self) -> Vec<Gap> {
        let index = CoverageIndex::scan(&*self.workspace, &self.settings.base_url);
        detect_gaps(self.catalog, &index)
    }

    pub async fn run(mut self) -> GenerationReport {
        let mut index = CoverageIndex::scan(&*self.workspace, &self.settings.base_url);
        let mut queue: VecDeque<Gap> = detect_gaps(self.catalog, &index).into();
        let max = self.settings.max_generations;
        println!("\n[GENERATE] {} gaps found, quota {}", queue.len(), max);

        let mut used = 0;
        let mut reports = Vec::new();
        while let Some(gap) = queue.pop_front() {
            if index.covers(&gap) {
                tracing::info!(gap = %gap.canonical_name, "gap already covered, skipping");
                reports.push(GapReport {
                    file: self.target_path(&gap),
                    gap,
                    status: GapStatus::Skipped,
                    function_name: None,
                    detail: Some("already covered".to_string()),
                    attempt: None,
                });
                continue;
            }
            if used >= max {
                queue.push_front(gap);
                break;
            }
            used += 1;
            println!("[GENERATE {}/{}] {}", used, max, gap.describe());
            let report = self.attempt(gap, used as u32, &mut index).await;
            reports.push(report);
        }

        let remaining: Vec<Gap> = queue.into_iter().filter(|g| !index.covers(g)).collect();
        let outcome = if remaining.is_empty() {
            SessionOutcome::Succeeded
        } else {
            SessionOutcome::FailedQuotaExhausted
        };
        tracing::info!(
            attempts = used,
            remaining = remaining.len(),
            outcome = outcome.label(),
            "generation session finished"
        );
        GenerationReport {
            outcome,
            attempts_used: used,
            gaps: reports,
            remaining,
        }
    }

    fn target_path(&self, gap: &Gap) -> String {
        let test_root = self
            .workspace
            .test_root()
            .strip_prefix(self.workspace.project_root())
            .unwrap_or(self.workspace.test_root());
        test_root.join(&gap.target_file).display().to_string()
    }

    async fn attempt(&mut self, gap: Gap, number: u32, index: &mut CoverageIndex) -> GapReport {
        let file = self.target_path(&gap);
        let mut result = AttemptResult::new(number);

        let candidate = match self.synthesize(&gap, &file, &mut result).await {
            Ok(candidate) => candidate,
            Err(err) => return discarded(gap, file, None, err, result),
        };

        let (function_name, source) = match python::single_test_function(&candidate) {
            Ok(found) => found,
            Err(err) => {
                println!("  discarded: {}", err);
                return discarded(gap, file, None, err, result);
            }
        };

        let existing = match self.workspace.read(&file) {
            Ok(content) => content,
            Err(CapabilityError::NotFound { .. }) => new_file_header(&gap, &self.settings.base_url),
            Err(err) => return discarded(gap, file, Some(function_name), err, result),
        };
        if index.has_function(&function_name)
            || python::function_names(&existing).contains(&function_name)
        {
            let detail = format!("duplicate: {} already exists", function_name);
            println!("  discarded: {}", detail);
            result.error = Some(detail.clone());
            return GapReport {
                gap,
                status: GapStatus::Discarded,
                function_name: Some(function_name),
                file,
                detail: Some(detail),
                attempt: Some(result),
            };
        }
        let block = ensure_marker(&source, &self.settings.marker);
        let updated = insert_block(&existing, &block);

        self.workspace.begin_session();
        let written = self.workspace.write(&file, &updated);
        result.trace.push(TraceEntry {
            invocation: format!("write {}", file),
            ok: written.is_ok(),
            error: written.as_ref().err().map(|e| e.to_string()),
        });
        if let Err(err) = written {
            self.workspace.end_session();
            return discarded(gap, file, Some(function_name), err, result);
        }

        let selector = format!("{}::{}", file, function_name);
        let validation = self.workspace.run_test(&selector);
        let report = match validation {
            Ok(run) if run.passed => {
                println!("[VALIDATION] PASSED {}", selector);
                result.validation_passed = true;
                index.record(&gap, &function_name);
                GapReport {
                    gap,
                    status: GapStatus::Kept,
                    function_name: Some(function_name),
                    file,
                    detail: None,
                    attempt: Some(result),
                }
            }
            other => {
                let detail = match other {
                    Ok(_) => "generated test failed".to_string(),
                    Err(err) => format!("{}: {}", err.kind(), err),
                };
                println!("[VALIDATION] FAILED {}", selector);
                println!("[ROLLBACK] {}", file);
                let detail = match self.workspace.rollback(&file) {
                    Ok(_) => detail,
                    Err(err) => {
                        tracing::error!(file = %file, error = %err, "rollback of generated test failed");
                        format!("{}; rollback failed: {}", detail, err)
                    }
                };
                result.error = Some(detail.clone());
                GapReport {
                    gap,
                    status: GapStatus::RolledBack,
                    function_name: Some(function_name),
                    file,
                    detail: Some(detail),
                    attempt: Some(result),
                }
            }
        };
        self.workspace.end_session();
        report
    }

    /// Ask the engine for the source of one test function.
    async fn synthesize(
        &self,
        gap: &Gap,
        file: &str,
        result: &mut AttemptResult,
    ) -> Result<String, CapabilityError> {
        let request = ReasoningRequest {
            task: Task::Generate,
            context: self.generation_context(gap, file),
            capabilities: capability_specs(Task::Generate),
            prior_feedback: Vec::new(),
            exchanges: Vec::new(),
        };
        let turn = match tokio::time::timeout(
            self.settings.reasoning_timeout,
            self.engine.respond(&request),
        )
        .await
        {
            Ok(Ok(turn)) => turn,
            Ok(Err(err)) => return Err(CapabilityError::external(format!("{:#}", err))),
            Err(_) => {
                return Err(CapabilityError::external(format!(
                    "reasoning engine timed out after {}s",
                    self.settings.reasoning_timeout.as_secs()
                )))
            }
        };
        if !turn.reasoning.trim().is_empty() {
            result.reasoning.push(turn.reasoning);
        }
        let code = turn
            .artifact
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CapabilityError::SyntaxInvalid {
                message: "engine returned no code".to_string(),
            })?;
        Ok(code)
    }

    fn generation_context(&self, gap: &Gap, file: &str) -> String {
        let scenario = &gap.scenario;
        let existing_names = self
            .workspace
            .read(file)
            .map(|content| python::function_names(&content))
            .unwrap_or_default();

        let mut out = String::new();
        out.push_str("Task: write one new pytest test function for an uncovered API scenario.\n\n");
        out.push_str(&format!("Resource: {}\n", gap.resource));
        out.push_str(&format!(
            "Request: {} {}\n",
            scenario.method, scenario.template
        ));
        out.push_str(&format!("Expected status: {}\n", scenario.status));
        out.push_str(&format!(
            "Scenario: {} (priority tier {})\n",
            scenario.kind.slug(),
            gap.tier
        ));
        if !scenario.precondition.is_empty() {
            out.push_str(&format!("Precondition: {}\n", scenario.precondition));
        }
        out.push_str(&format!("Function name: {}\n", gap.canonical_name));
        out.push_str(&format!("Target file: {}\n", file));
        out.push_str(&format!(
            "The first line must be the marker comment: {}\n",
            self.settings.marker
        ));
        if !existing_names.is_empty() {
            out.push_str(&format!(
                "Names already taken in the target file: {}\n",
                existing_names.join(", ")
            ));
        }

        for (path, content) in self.exemplars(file) {
            out.push_str(&format!(
                "\nExemplar: {}\n```python\n{}\n```\n",
                path,
                truncate(&content, EXEMPLAR_MAX_CHARS)
            ));
        }
        out
    }

    /// Up to three existing test files, the target file first.
    fn exemplars(&self, target: &str) -> Vec<(String, String)> {
        let mut files = self.workspace.list_test_files();
        if let Some(pos) = files.iter().position(|f| Path::new(f) == Path::new(target)) {
            let target = files.remove(pos);
            files.insert(0, target);
        }
        files
            .into_iter()
            .filter_map(|path| {
                let content = self.workspace.read(&path).ok()?;
                Some((path, content))
            })
            .take(MAX_EXEMPLARS)
            .collect()
    }
}

fn discarded(
    gap: Gap,
    file: String,
    function_name: Option<String>,
    err: CapabilityError,
    mut result: AttemptResult,
) -> GapReport {
    let detail = format!("{}: {}", err.kind(), err);
    tracing::warn!(gap = %gap.canonical_name, error = %detail, "candidate discarded");
    result.error = Some(detail.clone());
    GapReport {
        gap,
        status: GapStatus::Discarded,
        function_name,
        file,
        detail: Some(detail),
        attempt: Some(result),
    }
}

/// Put the marker directly above a function's source (its first decorator or
/// `def` line), exactly once.
pub fn ensure_marker(code: &str, marker: &str) -> String {
    let body: Vec<&str> = code
        .lines()
        .filter(|line| line.trim() != marker)
        .collect();
    let body = body.join("\n");
    format!("{}\n{}", marker, body.trim_matches('\n'))
}

/// Append `block` after `existing`, separated by two blank lines.
pub fn insert_block(existing: &str, block: &str) -> String {
    let head = existing.trim_end();
    if head.is_empty() {
        return format!("{}\n", block.trim_end());
    }
    format!("{}\n\n\n{}\n", head, block.trim_end())
}

fn new_file_header(gap: &Gap, base_url: &str) -> String {
    format!(
        "\"\"\"Tests for {} endpoints.\"\"\"\nimport pytest\nimport requests\n\nBASE_URL = \"{}\"\n",
        gap.resource,
        base_url.trim_end_matches('/')
    )
}
