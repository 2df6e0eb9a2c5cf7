//! The `run` workflow
//!
//! Tracks progress through: suite -> collect failures -> heal -> generate ->
//! verify -> summary. Each step reports what it did; none of them aborts the
//! run, so the summary always reflects everything that was attempted.

use crate::capability::{TestRun, TestRunner, Workspace};
use crate::config::Config;
use crate::coverage::Catalog;
use crate::engine::ReasoningEngine;
use crate::failure::{collect_failure_files, FailureRecord};
use crate::generate::{GapStatus, GenerateSettings, GenerationReport, Generator};
use crate::heal::{HealReport, HealSettings, Healer};
use crate::report::{Summary, SummaryItem};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Skip test generation, only heal failures.
    pub heal_only: bool,
    /// Skip healing, only generate tests for coverage gaps.
    pub generate_only: bool,
    /// List what would be attempted; write nothing.
    pub dry_run: bool,
    /// Do not run the suite before collecting failures.
    pub skip_suite: bool,
}

/// Counts from a pytest summary line such as `2 failed, 8 passed in 1.2s`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuiteCounts {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
}

impl SuiteCounts {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.errors
    }
}

fn counts_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) (passed|failed|errors?)\b").ok())
        .as_ref()
}

/// Parse the last pytest summary counts out of runner output.
pub fn parse_suite_counts(output: &str) -> Option<SuiteCounts> {
    let re = counts_regex()?;
    let line = output
        .lines()
        .rev()
        .find(|line| re.is_match(line))?;
    let mut counts = SuiteCounts::default();
    for cap in re.captures_iter(line) {
        let n: usize = cap[1].parse().unwrap_or(0);
        match &cap[2] {
            "passed" => counts.passed += n,
            "failed" => counts.failed += n,
            _ => counts.errors += n,
        }
    }
    Some(counts)
}

/// Run the whole workflow and return the summary. Config overrides (such as
/// the generation quota) are applied by the caller.
pub async fn run_workflow<E: ReasoningEngine, R: TestRunner>(
    engine: &E,
    workspace: &mut Workspace<R>,
    config: &Config,
    catalog: &Catalog,
    options: RunOptions,
) -> Summary {
    let mut summary = Summary::default();
    if options.dry_run {
        println!("DRY RUN MODE: no changes will be applied\n");
    }

    if options.skip_suite {
        println!("Step 1: Skipped (--skip-suite)");
    } else {
        println!("Step 1: Running all tests...");
        summary.initial_suite_passed = Some(run_suite_step(workspace, config));
    }

    println!("\nStep 2: Collecting failures...");
    let failures_dir = workspace.project_root().join(&config.failures_dir);
    let failure_files = collect_failure_files(&failures_dir);
    summary.failures_found = failure_files.len();
    if failure_files.is_empty() {
        println!("  No failures found");
    } else {
        println!("  Found {} failure(s)", failure_files.len());
    }

    if options.generate_only {
        println!("\nStep 3: Skipped (--generate-only)");
    } else if failure_files.is_empty() {
        println!("\nStep 3: Skipped (no failures)");
    } else {
        println!("\nStep 3: Healing {} failure(s)...", failure_files.len());
        let total = failure_files.len();
        for (i, path) in failure_files.iter().enumerate() {
            let name = record_label(path);
            println!("[{}/{}] Healing {}...", i + 1, total, name);
            let record = match FailureRecord::load(path) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "malformed failure record");
                    summary.heal_failures.push(SummaryItem {
                        name,
                        detail: format!("{:#}", err),
                    });
                    continue;
                }
            };
            if options.dry_run {
                println!(
                    "  [DRY RUN] would attempt to heal {}",
                    record.selector(workspace.project_root())
                );
                continue;
            }
            let report = Healer::new(engine, workspace, HealSettings::from(config))
                .heal(&record)
                .await;
            record_heal(&mut summary, report);
        }
    }

    if options.heal_only {
        println!("\nStep 4: Skipped (--heal-only)");
    } else {
        println!("\nStep 4: Checking for critical test gaps...");
        let settings = GenerateSettings::from(config);
        let quota = settings.max_generations;
        let generator = Generator::new(engine, workspace, catalog, settings);
        if options.dry_run {
            let gaps = generator.gaps();
            println!("  [DRY RUN] {} gap(s) found, quota {}", gaps.len(), quota);
            for gap in gaps.iter().take(quota) {
                println!("    - {} [{}]", gap.describe(), gap.canonical_name);
            }
            if gaps.len() > quota {
                println!("    ... and {} more", gaps.len() - quota);
            }
        } else {
            let report = generator.run().await;
            record_generation(&mut summary, report);
        }
    }

    if options.dry_run {
        println!("\nStep 5: Skipped (dry run)");
    } else {
        println!("\nStep 5: Final verification (running all tests)...");
        summary.final_suite_passed = Some(run_suite_step(workspace, config));
    }

    summary
}

fn run_suite_step<R: TestRunner>(workspace: &Workspace<R>, config: &Config) -> bool {
    match workspace.run_suite(config.suite_timeout()) {
        Ok(run) => {
            print_suite_result(&run);
            run.passed
        }
        Err(err) => {
            tracing::warn!(error = %err, "suite run did not complete");
            println!("  Error running tests: {}", err);
            false
        }
    }
}

fn print_suite_result(run: &TestRun) {
    let counts = parse_suite_counts(&run.output());
    match (run.passed, counts) {
        (true, Some(counts)) => println!("  All {} tests passed ({} ms)", counts.total(), run.duration_ms),
        (true, None) => println!("  All tests passed ({} ms)", run.duration_ms),
        (false, Some(counts)) => println!(
            "  Some tests failed: {} passed, {} failed, {} errors",
            counts.passed, counts.failed, counts.errors
        ),
        (false, None) => println!("  Some tests failed"),
    }
}

fn record_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn record_heal(summary: &mut Summary, report: HealReport) {
    let attempts = report.attempts.len();
    if report.outcome.is_success() {
        summary.healed.push(SummaryItem {
            name: report.test_name,
            detail: format!("healed in {} attempt(s)", attempts),
        });
        return;
    }
    let mut detail = format!("{} after {} attempt(s)", report.outcome.label(), attempts);
    if let Some(last) = report.attempts.last().and_then(|a| a.error.as_deref()) {
        detail.push_str(&format!("; last error: {}", crate::util::truncate(last, 200)));
    }
    if let Some(err) = &report.rollback_error {
        detail.push_str(&format!("; rollback failed: {}", err));
    }
    summary.heal_failures.push(SummaryItem {
        name: report.test_name,
        detail,
    });
}

fn record_generation(summary: &mut Summary, report: GenerationReport) {
    summary.generation_outcome = Some(report.outcome);
    for gap in report.gaps {
        match gap.status {
            GapStatus::Kept => summary.generated.push(SummaryItem {
                name: gap
                    .function_name
                    .unwrap_or_else(|| gap.gap.canonical_name.clone()),
                detail: format!("{} in {}", gap.gap.describe(), gap.file),
            }),
            GapStatus::RolledBack | GapStatus::Discarded => {
                let status = if gap.status == GapStatus::RolledBack {
                    "rolled back"
                } else {
                    "discarded"
                };
                let detail = match gap.detail {
                    Some(detail) => format!("{}: {}", status, crate::util::truncate(&detail, 200)),
                    None => status.to_string(),
                };
                summary.generation_failures.push(SummaryItem {
                    name: gap.gap.canonical_name,
                    detail,
                });
            }
            GapStatus::Skipped => {}
        }
    }
}
