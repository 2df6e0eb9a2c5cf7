use crate::error::CapabilityError;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep the last `max_chars` characters. Pytest prints its failure summary
/// at the end, so tails carry more signal than heads.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(format!("Failed to wait for command: {}", e)),
        }
    };
    let duration = start.elapsed();

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        duration,
    })
}

/// A path confined to a scope root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedPath {
    pub absolute: PathBuf,
    /// Relative to the project root, for display and test selectors.
    pub relative: PathBuf,
}

/// Resolve `candidate` (relative to `project_root`, or absolute) and require it
/// to land inside `scope_root`.
///
/// Any `..` component is rejected before resolution. The deepest existing
/// ancestor is canonicalized so symlinks cannot smuggle a path out of scope.
pub fn resolve_scoped_path(
    project_root: &Path,
    scope_root: &Path,
    candidate: &Path,
) -> Result<ScopedPath, CapabilityError> {
    let shown = candidate.display().to_string();
    if candidate.as_os_str().is_empty() {
        return Err(CapabilityError::out_of_scope(shown));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(CapabilityError::out_of_scope(shown));
    }

    let project = canonicalize_lenient(project_root);
    let scope = canonicalize_lenient(scope_root);

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project.join(candidate)
    };
    let resolved = canonicalize_lenient(&joined);

    if !resolved.starts_with(&scope) || resolved == scope {
        return Err(CapabilityError::out_of_scope(shown));
    }

    let relative = resolved
        .strip_prefix(&project)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| resolved.clone());

    Ok(ScopedPath {
        absolute: resolved,
        relative,
    })
}

/// Canonicalize the deepest existing ancestor and re-append the missing tail.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => tail.push(name.to_os_string()),
            None => return path.to_path_buf(),
        }
        if !existing.pop() {
            return path.to_path_buf();
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    resolved
}

/// Write `content` to `path` all-or-nothing: a sibling temp file is written
/// first and renamed over the target.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp_path = path.with_file_name(format!(".{}.apimend.tmp", file_name));
    fs::write(&tmp_path, content)?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }

    fn project() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let scope = dir.path().join("tests/api");
        fs::create_dir_all(&scope).unwrap();
        fs::write(scope.join("test_users.py"), "def test_x():\n    pass\n").unwrap();
        (dir, scope)
    }

    #[test]
    fn test_resolve_accepts_relative_inside_scope() {
        let (dir, scope) = project();
        let resolved =
            resolve_scoped_path(dir.path(), &scope, Path::new("tests/api/test_users.py")).unwrap();
        assert_eq!(resolved.relative, PathBuf::from("tests/api/test_users.py"));
        assert!(resolved.absolute.ends_with("tests/api/test_users.py"));
    }

    #[test]
    fn test_resolve_accepts_new_file_inside_scope() {
        let (dir, scope) = project();
        let resolved =
            resolve_scoped_path(dir.path(), &scope, Path::new("tests/api/nested/test_new.py"))
                .unwrap();
        assert_eq!(
            resolved.relative,
            PathBuf::from("tests/api/nested/test_new.py")
        );
    }

    #[test]
    fn test_resolve_rejects_traversal_even_when_it_lands_inside() {
        let (dir, scope) = project();
        let err = resolve_scoped_path(
            dir.path(),
            &scope,
            Path::new("tests/api/../api/test_users.py"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "OutOfScope");
    }

    #[test]
    fn test_resolve_rejects_relative_outside_scope() {
        let (dir, scope) = project();
        fs::write(dir.path().join("conftest.py"), "").unwrap();
        let err = resolve_scoped_path(dir.path(), &scope, Path::new("conftest.py")).unwrap_err();
        assert_eq!(err.kind(), "OutOfScope");
    }

    #[test]
    fn test_resolve_rejects_absolute_outside_scope() {
        let (dir, scope) = project();
        let err = resolve_scoped_path(dir.path(), &scope, Path::new("/etc/passwd")).unwrap_err();
        assert_eq!(err.kind(), "OutOfScope");
    }

    #[test]
    fn test_resolve_accepts_absolute_inside_scope() {
        let (dir, scope) = project();
        let absolute = scope.join("test_users.py");
        let resolved = resolve_scoped_path(dir.path(), &scope, &absolute).unwrap();
        assert_eq!(resolved.relative, PathBuf::from("tests/api/test_users.py"));
    }

    #[test]
    fn test_resolve_rejects_scope_root_itself() {
        let (dir, scope) = project();
        let err = resolve_scoped_path(dir.path(), &scope, Path::new("tests/api")).unwrap_err();
        assert_eq!(err.kind(), "OutOfScope");
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub/test_a.py");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("sub"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_run_command_with_timeout_reports_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_command_with_timeout(&mut cmd, Duration::from_millis(200)).unwrap();
        assert!(result.timed_out);
        assert!(result.duration < Duration::from_secs(5));
    }
}
