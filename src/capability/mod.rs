//! The capability surface: the only way orchestrators touch the outside world.
//!
//! Five operations (`read`, `write`, `run_test`, `call_external_api`,
//! `list_test_files`) each return `Result<_, CapabilityError>`. When the
//! reasoning engine asked for the operation, the result is folded into a
//! [`CapabilityReply`] and handed back to it as data.

pub mod http;
pub mod runner;

pub use http::{ApiClient, ApiReply};
pub use runner::{PytestRunner, TestRun, TestRunner};

use crate::backup::{BackupManager, BackupRecord, SessionId};
use crate::config::Config;
use crate::error::CapabilityError;
use crate::util::{resolve_scoped_path, write_atomic, ScopedPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// One capability call requested by the reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "capability", rename_all = "snake_case")]
pub enum Invocation {
    Read {
        path: String,
    },
    Write {
        path: String,
        content: String,
    },
    CallApi {
        method: String,
        target: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    RunTest {
        selector: String,
    },
    ListTestFiles,
}

impl Invocation {
    /// One-line label for traces and progress output.
    pub fn describe(&self) -> String {
        match self {
            Invocation::Read { path } => format!("read {}", path),
            Invocation::Write { path, content } => {
                format!("write {} ({} bytes)", path, content.len())
            }
            Invocation::CallApi { method, target, .. } => {
                format!("call_api {} {}", method.to_ascii_uppercase(), target)
            }
            Invocation::RunTest { selector } => format!("run_test {}", selector),
            Invocation::ListTestFiles => "list_test_files".to_string(),
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Invocation::Write { .. })
    }
}

/// Uniform `{ ok, data | error }` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CapabilityError>,
}

impl CapabilityReply {
    pub fn from_result<T: Serialize>(result: Result<T, CapabilityError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(data) => Self {
                    ok: true,
                    data: Some(data),
                    error: None,
                },
                Err(err) => Self::failure(CapabilityError::Io {
                    path: String::new(),
                    message: format!("unserializable capability result: {}", err),
                }),
            },
            Err(err) => Self::failure(err),
        }
    }

    pub fn failure(error: CapabilityError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Returned by a successful `write`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteReceipt {
    pub path: String,
    pub backup_id: String,
    /// The file did not exist before this session wrote it.
    pub created: bool,
}

pub struct Workspace<R: TestRunner> {
    project_root: PathBuf,
    test_root: PathBuf,
    backups: BackupManager,
    runner: R,
    api: ApiClient,
    test_timeout: Duration,
    session: Option<SessionId>,
}

impl<R: TestRunner> Workspace<R> {
    pub fn open(project_root: &Path, config: &Config, runner: R) -> anyhow::Result<Self> {
        let backups = BackupManager::open(&project_root.join(&config.backup_dir))?;
        Ok(Self {
            project_root: project_root.to_path_buf(),
            test_root: project_root.join(&config.test_root),
            backups,
            runner,
            api: ApiClient::new(&config.api_base_url, config.api_timeout()),
            test_timeout: config.test_timeout(),
            session: None,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn test_root(&self) -> &Path {
        &self.test_root
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn backups_mut(&mut self) -> &mut BackupManager {
        &mut self.backups
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Start a new backup session; subsequent writes snapshot into it.
    pub fn begin_session(&mut self) -> SessionId {
        let id = self.backups.begin_session();
        self.session = Some(id);
        id
    }

    pub fn end_session(&mut self) {
        self.session = None;
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn scope(&self, path: impl AsRef<Path>) -> Result<ScopedPath, CapabilityError> {
        resolve_scoped_path(&self.project_root, &self.test_root, path.as_ref())
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Result<String, CapabilityError> {
        let scoped = self.scope(path)?;
        fs::read_to_string(&scoped.absolute)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    CapabilityError::not_found(scoped.relative.display().to_string())
                }
                _ => CapabilityError::io(&scoped.relative, e),
            })
    }

    /// Snapshot (once per session) then replace the file atomically.
    ///
    /// Outside a session the write gets a session of its own, closed again
    /// before returning, so every such write is snapshotted.
    pub fn write(
        &mut self,
        path: impl AsRef<Path>,
        content: &str,
    ) -> Result<WriteReceipt, CapabilityError> {
        let scoped = self.scope(path)?;
        let (session, own_session) = match self.session {
            Some(session) => (session, false),
            None => (self.begin_session(), true),
        };
        let result = self.snapshot_and_write(session, &scoped, content);
        if own_session {
            self.end_session();
        }
        let record = result?;

        tracing::info!(path = %scoped.relative.display(), "file written");
        Ok(WriteReceipt {
            path: scoped.relative.display().to_string(),
            backup_id: record.id.to_string(),
            created: record.is_tombstone(),
        })
    }

    fn snapshot_and_write(
        &mut self,
        session: SessionId,
        scoped: &ScopedPath,
        content: &str,
    ) -> Result<BackupRecord, CapabilityError> {
        let record = self.backups.snapshot(session, &scoped.absolute)?;
        write_atomic(&scoped.absolute, content.as_bytes())
            .map_err(|e| CapabilityError::io(&scoped.relative, e))?;
        Ok(record)
    }

    pub fn run_test(&self, selector: &str) -> Result<TestRun, CapabilityError> {
        self.runner.run(selector, self.test_timeout)
    }

    /// Run the whole suite under a separate, longer bound.
    pub fn run_suite(&self, timeout: Duration) -> Result<TestRun, CapabilityError> {
        self.runner.run("", timeout)
    }

    pub async fn call_external_api(
        &self,
        method: &str,
        target: &str,
        payload: Option<&Value>,
    ) -> Result<ApiReply, CapabilityError> {
        self.api.call(method, target, payload).await
    }

    /// Every `test_*.py` under the test root, relative to the project root.
    pub fn list_test_files(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.test_root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let name = e.file_name().to_string_lossy();
                name.starts_with("test_") && name.ends_with(".py")
            })
            .map(|e| {
                e.path()
                    .strip_prefix(&self.project_root)
                    .unwrap_or(e.path())
                    .display()
                    .to_string()
            })
            .collect();
        files.sort();
        files
    }

    pub fn rollback(&self, path: impl AsRef<Path>) -> Result<BackupRecord, CapabilityError> {
        let scoped = self.scope(path)?;
        self.backups.rollback(&scoped.absolute)
    }

    pub fn rollback_all(&self, session: SessionId) -> Result<Vec<PathBuf>, CapabilityError> {
        self.backups.rollback_all(session)
    }

    /// Put a named snapshot back over its original, which must still lie in
    /// the test root.
    pub fn restore_backup(&self, backup: &str) -> Result<BackupRecord, CapabilityError> {
        let record = self
            .backups
            .find_by_backup(backup)
            .ok_or_else(|| CapabilityError::not_found(backup.to_string()))?;
        self.scope(&record.original)?;
        self.backups.restore_record(record)?;
        Ok(record.clone())
    }

    /// Execute an engine-requested invocation and wrap the outcome.
    pub async fn execute(&mut self, invocation: &Invocation) -> CapabilityReply {
        let reply = match invocation {
            Invocation::Read { path } => CapabilityReply::from_result(self.read(path)),
            Invocation::Write { path, content } => {
                CapabilityReply::from_result(self.write(path, content))
            }
            Invocation::CallApi {
                method,
                target,
                payload,
            } => CapabilityReply::from_result(
                self.call_external_api(method, target, payload.as_ref())
                    .await,
            ),
            Invocation::RunTest { selector } => {
                CapabilityReply::from_result(self.run_test(selector))
            }
            Invocation::ListTestFiles => {
                CapabilityReply::from_result(Ok::<_, CapabilityError>(self.list_test_files()))
            }
        };
        if let Some(err) = &reply.error {
            tracing::debug!(
                invocation = %invocation.describe(),
                error = %err,
                "capability returned an error"
            );
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{project_with_tests, ScriptedRunner};
    use serde_json::json;

    #[test]
    fn test_read_write_stay_inside_test_root() {
        let (dir, config) = project_with_tests();
        let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();

        for bad in ["../secrets.txt", "conftest.py", "/etc/passwd", "tests/api/../../x.py"] {
            assert_eq!(ws.read(bad).unwrap_err().kind(), "OutOfScope", "{}", bad);
            assert_eq!(ws.write(bad, "x").unwrap_err().kind(), "OutOfScope", "{}", bad);
        }
        let absolute_outside = dir.path().join("conftest.py");
        assert_eq!(
            ws.write(&absolute_outside, "x").unwrap_err().kind(),
            "OutOfScope"
        );
        assert!(ws.backups().records().is_empty());
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let (dir, config) = project_with_tests();
        let ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
        let err = ws.read("tests/api/test_missing.py").unwrap_err();
        assert_eq!(err, CapabilityError::not_found("tests/api/test_missing.py"));
    }

    #[test]
    fn test_write_snapshots_before_first_write_only() {
        let (dir, config) = project_with_tests();
        let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
        let original = ws.read("tests/api/test_users.py").unwrap();

        let session = ws.begin_session();
        let first = ws.write("tests/api/test_users.py", "one\n").unwrap();
        let second = ws.write("tests/api/test_users.py", "two\n").unwrap();
        assert_eq!(first.backup_id, second.backup_id);
        assert!(!first.created);

        let created = ws.write("tests/api/test_new.py", "new\n").unwrap();
        assert!(created.created);

        ws.rollback_all(session).unwrap();
        assert_eq!(ws.read("tests/api/test_users.py").unwrap(), original);
        assert!(!dir.path().join("tests/api/test_new.py").exists());
    }

    #[test]
    fn test_write_outside_session_snapshots_every_time() {
        let (dir, config) = project_with_tests();
        let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
        let original = ws.read("tests/api/test_users.py").unwrap();

        let first = ws.write("tests/api/test_users.py", "one\n").unwrap();
        assert_eq!(ws.active_session(), None);
        let second = ws.write("tests/api/test_users.py", "two\n").unwrap();
        assert_eq!(ws.active_session(), None);
        assert_ne!(first.backup_id, second.backup_id);
        assert_eq!(ws.backups().records().len(), 2);

        ws.rollback("tests/api/test_users.py").unwrap();
        assert_eq!(ws.read("tests/api/test_users.py").unwrap(), "one\n");
        let earliest = ws.backups().records()[0].backup_path.clone().unwrap();
        assert_eq!(fs::read_to_string(earliest).unwrap(), original);

        let session = ws.begin_session();
        ws.write("tests/api/test_users.py", "three\n").unwrap();
        assert_eq!(ws.active_session(), Some(session));
    }

    #[test]
    fn test_list_test_files_sorted_and_relative() {
        let (dir, config) = project_with_tests();
        fs::write(dir.path().join("tests/api/helpers.py"), "").unwrap();
        fs::create_dir_all(dir.path().join("tests/api/nested")).unwrap();
        fs::write(dir.path().join("tests/api/nested/test_deep.py"), "").unwrap();
        let ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
        assert_eq!(
            ws.list_test_files(),
            vec![
                "tests/api/nested/test_deep.py",
                "tests/api/test_resources.py",
                "tests/api/test_users.py",
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_wraps_errors_as_data() {
        let (dir, config) = project_with_tests();
        let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();

        let reply = ws
            .execute(&Invocation::Read {
                path: "../outside.py".to_string(),
            })
            .await;
        assert!(!reply.ok);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["error"]["kind"], "out_of_scope");

        let reply = ws.execute(&Invocation::ListTestFiles).await;
        assert!(reply.ok);
        assert_eq!(reply.data.unwrap()[0], "tests/api/test_resources.py");
    }

    #[tokio::test]
    async fn test_execute_call_api_reports_unreachable_host() {
        let (dir, mut config) = project_with_tests();
        config.api_base_url = "http://127.0.0.1:1".to_string();
        config.api_timeout_secs = 2;
        let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
        let reply = ws
            .execute(&Invocation::CallApi {
                method: "GET".to_string(),
                target: "/users/1".to_string(),
                payload: None,
            })
            .await;
        assert!(!reply.ok);
        assert_eq!(reply.error.unwrap().kind(), "ExternalCallFailure");
    }

    #[test]
    fn test_invocation_wire_format() {
        let parsed: Invocation = serde_json::from_value(json!({
            "capability": "call_api",
            "method": "get",
            "target": "/users/1"
        }))
        .unwrap();
        assert_eq!(parsed.describe(), "call_api GET /users/1");
        let parsed: Invocation =
            serde_json::from_value(json!({"capability": "list_test_files"})).unwrap();
        assert_eq!(parsed, Invocation::ListTestFiles);
    }
}
