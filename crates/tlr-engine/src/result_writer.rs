//! Result writer (Section 4.10): consumes the Run Driver's start/end events
//! and accumulates a serializable `TestResultDocument`.

use serde::Serialize;
use thiserror::Error;
use tlr_core::{Case, Set, Verdict};
use tracing::info;

use crate::case_runner::RunCounters;

/// Raised when a `ResultWriter` cannot persist its document (Section 4.10).
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to serialize result document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write result document: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
pub struct StepResult {
    pub command: String,
    pub return_code: i32,
    pub signaled: i32,
    pub start: i64,
    pub end: i64,
    pub failure_info: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CaseResult {
    pub name: String,
    pub verdict: &'static str,
    pub failure_info: Option<String>,
    pub crash_uuid: Option<String>,
    pub steps: Vec<StepResult>,
}

impl From<&Case> for CaseResult {
    fn from(case: &Case) -> Self {
        CaseResult {
            name: case.name.clone(),
            verdict: case.verdict.as_str(),
            failure_info: case.failure_info.clone(),
            crash_uuid: case.rich_core_uuid.clone(),
            steps: case
                .steps
                .iter()
                .map(|s| StepResult {
                    command: s.command.clone(),
                    return_code: s.return_code,
                    signaled: s.signaled,
                    start: s.start,
                    end: s.end,
                    failure_info: s.failure_info.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SetResult {
    pub name: String,
    pub environment: String,
    pub cases: Vec<CaseResult>,
}

#[derive(Debug, Serialize, Default)]
pub struct RunCountersDocument {
    pub executed: u64,
    pub passed: u64,
    pub failed: u64,
    pub na: u64,
    pub filtered: u64,
}

impl From<RunCounters> for RunCountersDocument {
    fn from(c: RunCounters) -> Self {
        Self { executed: c.executed, passed: c.passed, failed: c.failed, na: c.na, filtered: c.filtered }
    }
}

#[derive(Debug, Serialize, Default)]
pub struct TestResultDocument {
    pub suite: String,
    pub sets: Vec<SetResult>,
    pub counters: RunCountersDocument,
}

/// Lifecycle sink the Run Driver pushes events into as it walks the plan
/// (Section 4.10).
pub trait ResultWriter {
    fn suite_start(&mut self, name: &str);
    fn set_start(&mut self, set: &Set);
    fn case_end(&mut self, case: &Case);
    fn set_end(&mut self, set: &Set);
    fn suite_end(&mut self);
    fn finish(self: Box<Self>, counters: RunCounters) -> Result<(), WriterError>;
}

/// Reference `ResultWriter`: accumulates a `TestResultDocument` in memory and
/// serializes it with `serde_json` to `output_path` on `finish`.
pub struct JsonResultWriter {
    output_path: std::path::PathBuf,
    document: TestResultDocument,
    current_set: Option<SetResult>,
}

impl JsonResultWriter {
    pub fn new(output_path: impl Into<std::path::PathBuf>) -> Self {
        Self { output_path: output_path.into(), document: TestResultDocument::default(), current_set: None }
    }
}

impl ResultWriter for JsonResultWriter {
    fn suite_start(&mut self, name: &str) {
        self.document.suite = name.to_string();
    }

    fn set_start(&mut self, set: &Set) {
        self.current_set = Some(SetResult { name: set.name.clone(), environment: set.environment.clone(), cases: Vec::new() });
    }

    fn case_end(&mut self, case: &Case) {
        if let Some(set) = &mut self.current_set {
            set.cases.push(CaseResult::from(case));
        }
    }

    fn set_end(&mut self, _set: &Set) {
        if let Some(set) = self.current_set.take() {
            self.document.sets.push(set);
        }
    }

    fn suite_end(&mut self) {}

    fn finish(mut self: Box<Self>, counters: RunCounters) -> Result<(), WriterError> {
        self.document.counters = counters.into();
        let json = serde_json::to_string_pretty(&self.document)?;
        std::fs::write(&self.output_path, json)?;
        info!(
            executed = counters.executed,
            passed = counters.passed,
            failed = counters.failed,
            na = counters.na,
            filtered = counters.filtered,
            "run finished"
        );
        Ok(())
    }
}
