//! Operator console state.
//!
//! [`OperatorConsole`] is the consumer side of a run: one handler per
//! [`MessageKind`], installed in a [`Dispatcher`] by [`OperatorConsole::dispatcher`].
//! Handlers only touch the console. Output is queued as text lines for the
//! front end to print, and device check prompts are queued until the operator
//! answers (or answered at once in auto-ack mode).

use crate::dispatch::Dispatcher;
use crate::error::TesterError;
use crate::measurement::{FailureCategory, RunResult};
use crate::messages::{ControlSender, MessageKind, Phase, ProgressMessage};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// A device check waiting for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCheck {
    /// Model the orchestrator is paused on.
    pub model_id: String,
    /// Question to show.
    pub question: String,
}

/// Consumer-owned view of a run.
#[derive(Debug)]
pub struct OperatorConsole {
    control: ControlSender,
    auto_ack: bool,
    phase: Phase,
    run_finished: bool,
    pending_checks: VecDeque<PendingCheck>,
    results: Vec<RunResult>,
    sub_failures: Vec<(String, FailureCategory)>,
    fatal_errors: Vec<String>,
    lines: Vec<String>,
}

impl OperatorConsole {
    /// Creates a console that answers through `control`.
    pub fn new(control: ControlSender, auto_ack: bool) -> Self {
        Self {
            control,
            auto_ack,
            phase: Phase::Idle,
            run_finished: false,
            pending_checks: VecDeque::new(),
            results: Vec::new(),
            sub_failures: Vec::new(),
            fatal_errors: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Dispatch table with one handler per message kind.
    pub fn dispatcher() -> Dispatcher<Self> {
        Dispatcher::new()
            .on(MessageKind::Status, on_status)
            .on(MessageKind::PhaseChange, on_phase_change)
            .on(MessageKind::Tick, on_tick)
            .on(MessageKind::DeviceCheckPrompt, on_device_check)
            .on(MessageKind::SubFailure, on_sub_failure)
            .on(MessageKind::Done, on_done)
            .on(MessageKind::FatalError, on_fatal_error)
    }

    /// Last reported orchestrator phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the orchestrator went back to idle after working.
    pub fn run_finished(&self) -> bool {
        self.run_finished
    }

    /// Completed model results in arrival order.
    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    /// Sub-failures reported so far.
    pub fn sub_failures(&self) -> &[(String, FailureCategory)] {
        &self.sub_failures
    }

    /// Fatal error messages reported so far.
    pub fn fatal_errors(&self) -> &[String] {
        &self.fatal_errors
    }

    /// Takes the lines rendered since the last call.
    pub fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }

    /// Oldest unanswered device check.
    pub fn next_pending_check(&self) -> Option<&PendingCheck> {
        self.pending_checks.front()
    }

    /// Answers the oldest device check.
    pub fn acknowledge(&mut self) -> Result<(), TesterError> {
        match self.pending_checks.pop_front() {
            Some(check) => self.control.ack_device_check(check.model_id),
            None => Ok(()),
        }
    }

    /// Abandons the model under test, or the whole run.
    pub fn cancel(&mut self, current_only: bool) -> Result<(), TesterError> {
        self.pending_checks.clear();
        if current_only {
            self.control.cancel_current()
        } else {
            self.control.cancel()
        }
    }

    /// Pass/fail totals for the end of a run.
    pub fn summary(&self) -> String {
        let passed = self.results.iter().filter(|r| r.verdict.is_pass()).count();
        format!(
            "{} model(s): {} passed, {} failed",
            self.results.len(),
            passed,
            self.results.len() - passed
        )
    }

    fn render(&mut self, line: String) {
        self.lines.push(line);
    }
}

fn on_status(console: &mut OperatorConsole, message: ProgressMessage) {
    if let ProgressMessage::Status(text) = message {
        console.render(text);
    }
}

fn on_phase_change(console: &mut OperatorConsole, message: ProgressMessage) {
    let ProgressMessage::PhaseChange(phase) = message else {
        return;
    };
    debug!(%phase, "phase change");
    if phase == Phase::Idle && console.phase != Phase::Idle {
        console.run_finished = true;
    }
    console.phase = phase;
}

fn on_tick(console: &mut OperatorConsole, message: ProgressMessage) {
    if let ProgressMessage::Tick {
        elapsed,
        remaining,
        current,
    } = message
    {
        let reading = current.map_or_else(|| "--".to_string(), |c| format!("{:.4} A", c));
        console.render(format!(
            "  {:>5.1}s elapsed, {:>5.1}s left  {}",
            elapsed.as_secs_f64(),
            remaining.as_secs_f64(),
            reading
        ));
    }
}

fn on_device_check(console: &mut OperatorConsole, message: ProgressMessage) {
    let ProgressMessage::DeviceCheckPrompt { model_id, question } = message else {
        return;
    };
    if console.auto_ack {
        console.render(format!("{} (auto-acknowledged)", question));
        if let Err(err) = console.control.ack_device_check(model_id) {
            warn!(error = %err, "auto-acknowledge failed");
            console.render(format!("Could not acknowledge: {}", err));
        }
        return;
    }
    console
        .pending_checks
        .push_back(PendingCheck { model_id, question });
}

fn on_sub_failure(console: &mut OperatorConsole, message: ProgressMessage) {
    if let ProgressMessage::SubFailure { model_id, category } = message {
        console.render(format!("!! {} sub-failure: {}", model_id, category));
        console.sub_failures.push((model_id, category));
    }
}

fn on_done(console: &mut OperatorConsole, message: ProgressMessage) {
    if let ProgressMessage::Done(result) = message {
        console.render(format!("== {}", result.summary()));
        console.results.push(*result);
    }
}

fn on_fatal_error(console: &mut OperatorConsole, message: ProgressMessage) {
    if let ProgressMessage::FatalError { model_id, message } = message {
        let line = match model_id {
            Some(model_id) => format!("FATAL [{}] {}", model_id, message),
            None => format!("FATAL {}", message),
        };
        console.render(line.clone());
        console.fatal_errors.push(line);
    }
}
