//! Deterministic stand-ins for the reasoning engine and the test runner.

use crate::capability::{Invocation, TestRun, TestRunner};
use crate::config::Config;
use crate::engine::{ReasoningEngine, ReasoningRequest, ReasoningTurn, Signal};
use crate::error::CapabilityError;
use std::collections::VecDeque;
use std::fs;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub const USERS_TEST: &str = r#"import requests

BASE_URL = "https://jsonplaceholder.typicode.com"


def test_get_user(api_client):
    response = api_client.get(f"{BASE_URL}/users/1")
    assert response.status_code == 200
    data = response.json()
    assert data["firstName"] == "Leanne Graham"


def test_list_users(api_client):
    response = api_client.get(f"{BASE_URL}/users")
    assert response.status_code == 200
    assert len(response.json()) == 10
"#;

pub const RESOURCES_TEST: &str = r#"import requests

BASE_URL = "https://jsonplaceholder.typicode.com"


def test_get_comment(api_client):
    response = api_client.get(f"{BASE_URL}/comments/1")
    assert response.status_code == 200
"#;

/// A project with `tests/api/test_users.py`, `tests/api/test_resources.py`
/// and a `conftest.py` outside the test root.
pub fn project_with_tests() -> (TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("tests/api");
    fs::create_dir_all(&api).unwrap();
    fs::write(api.join("test_users.py"), USERS_TEST).unwrap();
    fs::write(api.join("test_resources.py"), RESOURCES_TEST).unwrap();
    fs::write(dir.path().join("conftest.py"), "# hooks\n").unwrap();
    let config = Config {
        api_base_url: "http://127.0.0.1:1".to_string(),
        reasoning_timeout_secs: 5,
        ..Config::default()
    };
    (dir, config)
}

pub fn turn(invocations: Vec<Invocation>, signal: Signal) -> ReasoningTurn {
    ReasoningTurn {
        reasoning: "scripted".to_string(),
        invocations,
        signal,
        artifact: None,
    }
}

pub fn code_turn(code: &str) -> ReasoningTurn {
    ReasoningTurn {
        reasoning: "scripted".to_string(),
        invocations: Vec::new(),
        signal: Signal::FixApplied,
        artifact: Some(code.to_string()),
    }
}

pub fn write(path: &str, content: &str) -> Invocation {
    Invocation::Write {
        path: path.to_string(),
        content: content.to_string(),
    }
}

pub fn read(path: &str) -> Invocation {
    Invocation::Read {
        path: path.to_string(),
    }
}

/// Replays queued turns in order and records every request it saw. Once the
/// queue is empty it answers `NoFurtherAction`.
#[derive(Default)]
pub struct ScriptedEngine {
    turns: Mutex<VecDeque<Result<ReasoningTurn, String>>>,
    requests: Mutex<Vec<ReasoningRequest>>,
    delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new(turns: Vec<ReasoningTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn with_results(turns: Vec<Result<ReasoningTurn, String>>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Every response takes `delay` before it arrives.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ReasoningEngine for ScriptedEngine {
    async fn respond(&self, request: &ReasoningRequest) -> anyhow::Result<ReasoningTurn> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.turns.lock().unwrap().pop_front();
        match next {
            Some(Ok(turn)) => Ok(turn),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(turn(Vec::new(), Signal::NoFurtherAction)),
        }
    }
}

type Judge = Box<dyn Fn(&str) -> Result<bool, CapabilityError> + Send + Sync>;

/// Decides pass/fail per selector without spawning anything.
pub struct ScriptedRunner {
    judge: Judge,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(judge: impl Fn(&str) -> Result<bool, CapabilityError> + Send + Sync + 'static) -> Self {
        Self {
            judge: Box::new(judge),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(|_| Ok(true))
    }

    pub fn failing() -> Self {
        Self::new(|_| Ok(false))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl TestRunner for ScriptedRunner {
    fn run(&self, selector: &str, _timeout: Duration) -> Result<TestRun, CapabilityError> {
        self.calls.lock().unwrap().push(selector.to_string());
        let passed = (self.judge)(selector)?;
        Ok(TestRun {
            selector: selector.to_string(),
            passed,
            exit_code: Some(if passed { 0 } else { 1 }),
            duration_ms: 1,
            stdout_tail: if passed {
                "1 passed".to_string()
            } else {
                format!("FAILED {}", selector)
            },
            stderr_tail: String::new(),
        })
    }
}
