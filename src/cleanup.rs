//! Strip marker-tagged generated tests from the test tree.

use crate::capability::{TestRunner, Workspace};
use crate::coverage::python;
use crate::error::CapabilityError;
use serde::Serialize;
use std::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanedFile {
    pub path: String,
    pub removed: usize,
}

/// Remove every marker line together with the top-level function that
/// directly follows it (decorators and body included, as parsed).
///
/// A marker with anything but blank lines between it and the next function
/// is dropped on its own. Blank-line runs longer than two are collapsed and
/// trailing whitespace is dropped; the caller decides on the final newline.
/// Returns the cleaned text and the number of functions removed.
pub fn strip_generated(content: &str, marker: &str) -> (String, usize) {
    let lines: Vec<&str> = content.lines().collect();
    let spans = python::top_level_definitions(content).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "could not parse file; only marker lines are removed");
        Vec::new()
    });
    let mut dropped = vec![false; lines.len()];
    let mut removed = 0;

    for (row, line) in lines.iter().enumerate() {
        if line.trim() != marker {
            continue;
        }
        dropped[row] = true;
        let Some(span) = spans.iter().find(|s| s.start_row > row) else {
            continue;
        };
        let adjacent = lines[row + 1..span.start_row.min(lines.len())]
            .iter()
            .all(|l| l.trim().is_empty());
        if !adjacent {
            continue;
        }
        let last = span.end_row.min(lines.len().saturating_sub(1));
        for flag in &mut dropped[row + 1..=last] {
            *flag = true;
        }
        removed += 1;
    }

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut blank_run = 0;
    for (&line, _) in lines.iter().zip(&dropped).filter(|(_, d)| !**d) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(line);
    }
    (out.join("\n").trim_end().to_string(), removed)
}

/// Clean every test file containing `marker`. Each rewrite goes through the
/// workspace, so it is backed up like any other edit.
pub fn cleanup_generated<R: TestRunner>(
    workspace: &mut Workspace<R>,
    marker: &str,
    dry_run: bool,
) -> Result<Vec<CleanedFile>, CapabilityError> {
    let mut cleaned = Vec::new();
    let mut session_started = false;

    for path in workspace.list_test_files() {
        let content = workspace.read(&path)?;
        if !content.lines().any(|line| line.trim() == marker) {
            continue;
        }
        let (mut stripped, removed) = strip_generated(&content, marker);
        if keeps_trailing_newline(workspace, &path)? && !stripped.is_empty() {
            stripped.push('\n');
        }

        println!(
            "  {} {} generated test(s) from {}",
            if dry_run { "would remove" } else { "removed" },
            removed,
            path
        );
        if !dry_run {
            if !session_started {
                workspace.begin_session();
                session_started = true;
            }
            workspace.write(&path, &stripped)?;
        }
        cleaned.push(CleanedFile { path, removed });
    }

    if session_started {
        workspace.end_session();
    }
    Ok(cleaned)
}

/// Whether the file's pre-generation content ended with a newline. The
/// earliest snapshot is the reference; without one a newline is assumed.
fn keeps_trailing_newline<R: TestRunner>(
    workspace: &Workspace<R>,
    path: &str,
) -> Result<bool, CapabilityError> {
    let scoped = workspace.scope(path)?;
    let Some(record) = workspace.backups().earliest_for(&scoped.absolute) else {
        return Ok(true);
    };
    match &record.backup_path {
        Some(backup) => {
            let bytes = fs::read(backup).map_err(|e| CapabilityError::io(backup, e))?;
            Ok(bytes.is_empty() || bytes.ends_with(b"\n"))
        }
        None => Ok(true),
    }
}
