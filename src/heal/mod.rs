//! Repair orchestrator.
//!
//! One session per failure record, driven as an explicit state machine:
//!
//! ```text
//! Loaded -> Diagnosing <-> Acting -> Validating -> Succeeded
//!               ^                        |
//!               +------- Retrying <------+ -> RolledBack (attempts exhausted)
//! ```
//!
//! Every write goes through the workspace, so the session's first snapshot of
//! each touched file is what `RolledBack` restores.


use crate::backup::SessionId;
use crate::capability::{TestRunner, Workspace};
use crate::config::Config;
use crate::engine::{
    capability_specs, Exchange, ReasoningEngine, ReasoningRequest, ReasoningTurn, Signal, Task,
};
use crate::error::CapabilityError;
use crate::failure::FailureRecord;
use crate::report::{AttemptResult, SessionOutcome, TraceEntry};
use crate::util::tail_chars;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Validation output carried into the next attempt's feedback.
const FEEDBACK_OUTPUT_CHARS: usize = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealState {
    Loaded,
    Diagnosing,
    Acting,
    Validating,
    Retrying,
    Succeeded,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealSettings {
    pub max_attempts: u32,
    pub max_tool_rounds: u32,
    pub reasoning_timeout: Duration,
}

impl From<&Config> for HealSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_tool_rounds: config.max_tool_rounds.max(1),
            reasoning_timeout: config.reasoning_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealReport {
    pub test_name: String,
    pub selector: String,
    pub outcome: SessionOutcome,
    pub attempts: Vec<AttemptResult>,
    /// Files restored by the final rollback.
    pub rolled_back: Vec<PathBuf>,
    /// Set when the rollback itself failed.
    pub rollback_error: Option<String>,
    pub states: Vec<HealState>,
}

/// What the Diagnosing/Acting rounds of one attempt produced.
struct RoundsOutcome {
    wrote: bool,
    engine_error: Option<CapabilityError>,
}

pub struct Healer<'a, E, R: TestRunner> {
    engine: &'a E,
    workspace: &'a mut Workspace<R>,
    settings: HealSettings,
    states: Vec<HealState>,
}

impl<'a, E: ReasoningEngine, R: TestRunner> Healer<'a, E, R> {
    pub fn new(engine: &'a E, workspace: &'a mut Workspace<R>, settings: HealSettings) -> Self {
        Self {
            engine,
            workspace,
            settings,
            states: Vec::new(),
        }
    }

    fn enter(&mut self, state: HealState) {
        if self.states.last() != Some(&state) {
            tracing::debug!(?state, "heal state");
            self.states.push(state);
        }
    }

    pub async fn heal(mut self, record: &FailureRecord) -> HealReport {
        self.enter(HealState::Loaded);
        let selector = record.selector(self.workspace.project_root());
        let test_name = record.test_name().to_string();
        let context = format!(
            "Task: make this failing test pass by fixing the test code.\n\
             Failing selector: {}\n\
             Test directory: {}\n\n{}",
            selector,
            self.workspace
                .test_root()
                .strip_prefix(self.workspace.project_root())
                .unwrap_or(self.workspace.test_root())
                .display(),
            record.to_context()
        );

        println!("\n[HEALING] {}", test_name);
        let session = self.workspace.begin_session();
        let mut feedback: Vec<String> = Vec::new();
        let mut attempts = Vec::new();
        let max = self.settings.max_attempts;

        for attempt in 1..=max {
            println!("[ATTEMPT {}/{}] {}", attempt, max, test_name);
            tracing::info!(test = %test_name, attempt, "repair attempt started");
            let mut result = AttemptResult::new(attempt);

            let rounds = self.run_rounds(&context, &feedback, &mut result).await;

            if let Some(err) = rounds.engine_error {
                let detail = format!("{}: {}", err.kind(), err);
                tracing::warn!(test = %test_name, attempt, error = %detail, "reasoning engine failed");
                feedback.push(format!("Attempt {}: the reasoning step failed ({}).", attempt, detail));
                result.error = Some(detail);
            } else if !rounds.wrote {
                println!("[ATTEMPT {}/{}] no edit proposed", attempt, max);
                feedback.push(format!(
                    "Attempt {}: no file was written, so nothing could be validated. \
                     A fix must write the corrected test file.",
                    attempt
                ));
                result.error = Some("no edit proposed".to_string());
            } else {
                self.enter(HealState::Validating);
                match self.workspace.run_test(&selector) {
                    Ok(run) if run.passed => {
                        println!("[VALIDATION] PASSED {}", selector);
                        result.validation_passed = true;
                        attempts.push(result);
                        self.enter(HealState::Succeeded);
                        self.workspace.end_session();
                        tracing::info!(test = %test_name, attempt, "test healed");
                        return HealReport {
                            test_name,
                            selector,
                            outcome: SessionOutcome::Succeeded,
                            attempts,
                            rolled_back: Vec::new(),
                            rollback_error: None,
                            states: self.states,
                        };
                    }
                    Ok(run) => {
                        println!("[VALIDATION] FAILED {}", selector);
                        feedback.push(format!(
                            "Attempt {}: the edit was applied but the test still fails.\n{}",
                            attempt,
                            tail_chars(&run.output(), FEEDBACK_OUTPUT_CHARS)
                        ));
                        result.error = Some("validation failed".to_string());
                    }
                    Err(err) => {
                        println!("[VALIDATION] {} {}", err.kind().to_uppercase(), selector);
                        feedback.push(format!("Attempt {}: validation run failed: {}", attempt, err));
                        result.error = Some(format!("{}: {}", err.kind(), err));
                    }
                }
            }

            attempts.push(result);
            if attempt < max {
                self.enter(HealState::Retrying);
            }
        }

        self.roll_back(session, test_name, selector, attempts)
    }

    /// Diagnosing/Acting: ask, execute, feed results back, until the engine
    /// signals it is done or the round budget runs out.
    async fn run_rounds(
        &mut self,
        context: &str,
        feedback: &[String],
        result: &mut AttemptResult,
    ) -> RoundsOutcome {
        let mut exchanges: Vec<Exchange> = Vec::new();
        let mut wrote = false;

        for _ in 0..self.settings.max_tool_rounds {
            self.enter(HealState::Diagnosing);
            let request = ReasoningRequest {
                task: Task::Repair,
                context: context.to_string(),
                capabilities: capability_specs(Task::Repair),
                prior_feedback: feedback.to_vec(),
                exchanges: exchanges.clone(),
            };
            let turn = match self.ask(&request).await {
                Ok(turn) => turn,
                Err(err) => {
                    return RoundsOutcome {
                        wrote,
                        engine_error: Some(err),
                    }
                }
            };
            if !turn.reasoning.trim().is_empty() {
                result.reasoning.push(turn.reasoning.clone());
            }

            if !turn.invocations.is_empty() {
                self.enter(HealState::Acting);
            }
            for invocation in &turn.invocations {
                let reply = self.workspace.execute(invocation).await;
                println!(
                    "  {} {}",
                    if reply.ok { "ok " } else { "err" },
                    invocation.describe()
                );
                if invocation.is_write() && reply.ok {
                    wrote = true;
                }
                result.trace.push(TraceEntry {
                    invocation: invocation.describe(),
                    ok: reply.ok,
                    error: reply.error.as_ref().map(|e| e.to_string()),
                });
                exchanges.push(Exchange {
                    invocation: invocation.clone(),
                    reply,
                });
            }

            match turn.signal {
                Signal::FixApplied | Signal::NoFurtherAction => break,
                Signal::Continue if turn.invocations.is_empty() => break,
                Signal::Continue => {}
            }
        }

        RoundsOutcome {
            wrote,
            engine_error: None,
        }
    }

    async fn ask(&self, request: &ReasoningRequest) -> Result<ReasoningTurn, CapabilityError> {
        match tokio::time::timeout(self.settings.reasoning_timeout, self.engine.respond(request))
            .await
        {
            Ok(Ok(turn)) => Ok(turn),
            Ok(Err(err)) => Err(CapabilityError::external(format!("{:#}", err))),
            Err(_) => Err(CapabilityError::external(format!(
                "reasoning engine timed out after {}s",
                self.settings.reasoning_timeout.as_secs()
            ))),
        }
    }

    fn roll_back(
        mut self,
        session: SessionId,
        test_name: String,
        selector: String,
        attempts: Vec<AttemptResult>,
    ) -> HealReport {
        println!("[ROLLBACK] {} attempts exhausted for {}", attempts.len(), test_name);
        let (rolled_back, rollback_error) = match self.workspace.rollback_all(session) {
            Ok(paths) => {
                for path in &paths {
                    println!("[ROLLBACK] restored {}", path.display());
                }
                (paths, None)
            }
            Err(err) => {
                tracing::error!(test = %test_name, error = %err, "rollback failed");
                (Vec::new(), Some(err.to_string()))
            }
        };
        self.workspace.end_session();
        self.enter(HealState::RolledBack);

        HealReport {
            test_name,
            selector,
            outcome: SessionOutcome::FailedRolledBack,
            attempts,
            rolled_back,
            rollback_error,
            states: self.states,
        }
    }
}
