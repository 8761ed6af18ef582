//! Run results and the observer hooks the orchestrator reports through

use std::fmt;

use tonic::Code;

use crate::error::{EXIT_STATUS_OFFSET, EXIT_TEST_FAILED};
use crate::expect::Severity;
use crate::invoker::{CallOutcome, InvokeStats};
use crate::registry::Invoke;
use crate::syntax::{Position, SpecFile, TestMeta};

/// The source line a diagnostic points at
#[derive(Debug, Clone, PartialEq)]
pub struct SourceExcerpt {
    pub pos: Position,
    pub text: String,
}

impl SourceExcerpt {
    pub fn new(spec: &SpecFile, pos: &Position) -> Self {
        Self { pos: pos.clone(), text: spec.line(pos.line).to_string() }
    }

    /// Marker line with `^` under the column; tabs are kept so it lines up
    pub fn caret(&self) -> String {
        let mut marker: String = self
            .text
            .chars()
            .take(self.pos.column.saturating_sub(1))
            .map(|c| if c == '\t' { '\t' } else { ' ' })
            .collect();
        marker.push('^');
        marker
    }
}

impl fmt::Display for SourceExcerpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Related line on file: {}:{}\n{}\n{}",
            self.pos.filename,
            self.pos.line,
            self.text,
            self.caret()
        )
    }
}

/// A failed expectation, ready for display
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub test_name: String,
    pub description: String,
    pub invoke: String,
    pub goal: Option<String>,
    pub message: String,
    pub excerpt: SourceExcerpt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    /// Aborted by a Panic-severity failure
    Failed { invoke: String, code: Code },
}

/// Summary of one specification run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub test_name: String,
    pub outcome: RunOutcome,
    pub warnings: usize,
    pub ignores: usize,
    pub invokes_executed: usize,
    pub stats: InvokeStats,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.outcome == RunOutcome::Passed
    }

    /// `3` for a Panic failure, or `64 + code` when status exit codes are requested
    pub fn exit_code(&self, status_exit_codes: bool) -> i32 {
        match &self.outcome {
            RunOutcome::Passed => 0,
            RunOutcome::Failed { code, .. } if status_exit_codes => EXIT_STATUS_OFFSET + i32::from(*code),
            RunOutcome::Failed { .. } => EXIT_TEST_FAILED,
        }
    }
}

/// Progress hooks called by the orchestrator, in execution order
pub trait RunObserver {
    fn run_started(&mut self, _meta: &TestMeta) {}

    fn invoke_started(&mut self, _invoke: &Invoke, _meta: &TestMeta) {}

    /// `verbose` is the run's verbosity level from the test metadata
    fn call_completed(&mut self, _invoke: &Invoke, _outcome: &CallOutcome, _stats: InvokeStats, _verbose: i64) {}

    fn condition_recorded(&mut self, _diagnostic: &Diagnostic) {}

    fn finished(&mut self, _report: &RunReport) {}
}

/// Observer that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl RunObserver for SilentObserver {}
