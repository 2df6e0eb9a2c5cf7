//! Coverage gap detection.
//!
//! Existing tests are read through the capability surface and analyzed
//! statically. A catalog scenario counts as covered when some test function
//! both calls its (template, method) and is named for the scenario, or when a
//! function with the scenario's canonical name already exists. Everything else
//! is a [`Gap`].

pub mod catalog;
pub mod python;

pub use catalog::{Catalog, EndpointDescriptor, Scenario, ScenarioKind};

use crate::capability::{TestRunner, Workspace};
use serde::Serialize;
use std::collections::BTreeSet;

/// A normalized (template, method) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CoveragePattern {
    pub template: String,
    pub method: String,
}

impl CoveragePattern {
    pub fn new(template: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            method: method.into().to_ascii_uppercase(),
        }
    }
}

impl std::fmt::Display for CoveragePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub resource: String,
    pub scenario: Scenario,
    pub tier: u8,
    /// `test_{method}_{singular}_{slug}`, e.g. `test_get_user_not_found`.
    pub canonical_name: String,
    /// File name under the test root that a generated test goes into.
    pub target_file: String,
}

impl Gap {
    pub fn pattern(&self) -> CoveragePattern {
        CoveragePattern::new(&self.scenario.template, &self.scenario.method)
    }

    pub fn describe(&self) -> String {
        format!(
            "{} -> {} ({})",
            self.pattern(),
            self.scenario.status,
            self.scenario.kind.slug()
        )
    }
}

/// What the current test sources already exercise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageIndex {
    patterns: BTreeSet<CoveragePattern>,
    scenarios: BTreeSet<(CoveragePattern, ScenarioKind)>,
    functions: BTreeSet<String>,
}

impl CoverageIndex {
    /// Analyze every test file in the workspace. Unreadable or unparsable
    /// files are skipped with a warning.
    pub fn scan<R: TestRunner>(workspace: &Workspace<R>, base_url: &str) -> Self {
        let mut index = Self::default();
        for path in workspace.list_test_files() {
            match workspace.read(&path) {
                Ok(content) => {
                    if let Err(err) = index.add_source(&content, base_url) {
                        tracing::warn!(path = %path, error = %err, "skipping unparsable test file");
                    }
                }
                Err(err) => tracing::warn!(path = %path, error = %err, "skipping unreadable test file"),
            }
        }
        tracing::debug!(
            patterns = index.patterns.len(),
            functions = index.functions.len(),
            "coverage scanned"
        );
        index
    }

    pub fn add_source(&mut self, content: &str, base_url: &str) -> anyhow::Result<()> {
        let summary = python::analyze(content, base_url)?;
        self.functions.extend(summary.functions);
        for call in summary.calls {
            let pattern = CoveragePattern::new(call.template, call.method);
            if let Some(function) = &call.function {
                let name = function.to_ascii_lowercase();
                for kind in [
                    ScenarioKind::ErrorResponse,
                    ScenarioKind::ValidationError,
                    ScenarioKind::MutationEdgeCase,
                ] {
                    if kind.aliases().iter().any(|alias| name.contains(alias)) {
                        self.scenarios.insert((pattern.clone(), kind));
                    }
                }
            }
            self.patterns.insert(pattern);
        }
        Ok(())
    }

    pub fn patterns(&self) -> &BTreeSet<CoveragePattern> {
        &self.patterns
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    pub fn covers(&self, gap: &Gap) -> bool {
        self.has_function(&gap.canonical_name)
            || self
                .scenarios
                .contains(&(gap.pattern(), gap.scenario.kind))
    }

    /// Mark a gap as satisfied by a newly accepted test.
    pub fn record(&mut self, gap: &Gap, function_name: &str) {
        self.functions.insert(function_name.to_string());
        self.patterns.insert(gap.pattern());
        self.scenarios.insert((gap.pattern(), gap.scenario.kind));
    }
}

pub fn canonical_name(resource: &EndpointDescriptor, scenario: &Scenario) -> String {
    format!(
        "test_{}_{}_{}",
        scenario.method.to_ascii_lowercase(),
        resource.singular(),
        scenario.kind.slug()
    )
}

/// Uncovered scenarios, ordered by tier and then catalog order.
pub fn detect_gaps(catalog: &Catalog, index: &CoverageIndex) -> Vec<Gap> {
    let mut seen_names = BTreeSet::new();
    let mut gaps = Vec::new();
    for resource in &catalog.resources {
        for scenario in &resource.scenarios {
            let gap = Gap {
                resource: resource.name.clone(),
                scenario: scenario.clone(),
                tier: scenario.kind.tier(),
                canonical_name: canonical_name(resource, scenario),
                target_file: resource.target_file.clone(),
            };
            if index.covers(&gap) || !seen_names.insert(gap.canonical_name.clone()) {
                continue;
            }
            gaps.push(gap);
        }
    }
    // Stable: catalog order survives within a tier.
    gaps.sort_by_key(|g| g.tier);
    gaps
}
