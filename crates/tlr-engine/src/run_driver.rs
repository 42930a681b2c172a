//! Run Driver (Section 4.8): the top-level loop that pulls `PlanEvent`s from a
//! `PlanReader` and dispatches them to the Suite/Set/Case machinery, while
//! maintaining the "current anchor" diagnostics named in Section 9's design
//! notes.

use std::sync::Mutex;

use tlr_core::{Definition, EngineConfig, PlanEvent, PlanReader, RunContext};
use tracing::{info, warn};

use crate::case_runner::{CaseManualHelper, NoopCaseManualHelper, NoopPowerStreamer, PowerStreamer, RunCounters};
use crate::executor::{ExecConfig, Executor};
use crate::get_processor::{MeasurementEvaluator, NoopMeasurementEvaluator};
use crate::reboot::{PollingRebootWaiter, RebootWaiter};
use crate::result_writer::{ResultWriter, WriterError};
use crate::set_runner;

/// Engine-owned diagnostics, written only by the driver thread and read by
/// anything wanting to label a log line or crash report with "where are we"
/// (Section 5, Section 9: `current_set_name`/`current_case_name`/`current_step_num`).
#[derive(Debug, Default)]
pub struct CurrentAnchors {
    set_name: Mutex<Option<String>>,
    case_name: Mutex<Option<String>>,
    step_num: Mutex<usize>,
}

impl CurrentAnchors {
    pub fn current_set_name(&self) -> Option<String> {
        self.set_name.lock().unwrap().clone()
    }

    pub fn current_case_name(&self) -> Option<String> {
        self.case_name.lock().unwrap().clone()
    }

    pub fn current_step_num(&self) -> usize {
        *self.step_num.lock().unwrap()
    }

    fn set_set(&self, name: Option<String>) {
        *self.set_name.lock().unwrap() = name;
    }

    fn set_case(&self, name: Option<String>) {
        *self.case_name.lock().unwrap() = name;
    }

    /// Record which step of the current Case is executing, 1-based; 0 means
    /// "no step currently running" (between cases, or inside pre/post groups).
    /// Called by the Case Runner's step loop as it walks a Case's steps.
    pub fn set_step(&self, step_num: usize) {
        *self.step_num.lock().unwrap() = step_num;
    }
}

/// Runs a plan to completion (Section 4.8). Returns `Err` only on a parser/I/O
/// error (Section 7): test failures never produce an `Err` here, they are
/// recorded in the result document and counters instead.
pub fn run(
    reader: &mut dyn PlanReader,
    config: &EngineConfig,
    mut writer: Box<dyn ResultWriter>,
) -> Result<RunCounters, tlr_core::PlanError> {
    let anchors = CurrentAnchors::default();
    let mut definition = Definition::default();
    let mut run_ctx = RunContext::default();
    let mut counters = RunCounters::default();
    let executor = Executor::new();
    let mut power: Box<dyn PowerStreamer> = Box::new(NoopPowerStreamer);
    let mut evaluator: Box<dyn MeasurementEvaluator> = Box::new(NoopMeasurementEvaluator);
    let mut case_manual: Box<dyn CaseManualHelper> = Box::new(NoopCaseManualHelper);
    let mut reboot: Box<dyn RebootWaiter> = Box::new(PollingRebootWaiter::new(
        std::time::Duration::from_secs(config.common_hard_timeout_sec as u64 * 3),
        || true,
    ));

    loop {
        let event = reader.next_event()?;
        let Some(event) = event else { break };
        match event {
            PlanEvent::TdStart(def) => {
                definition = def;
                if let Some(forced) = &config.forced_hwid {
                    definition.detected_hw = Some(forced.clone());
                }
                info!("TD start");
            }
            PlanEvent::HwIdDetect => {
                if let Some(forced) = &config.forced_hwid {
                    info!(hwid = %forced, "using forced HW ID");
                    definition.detected_hw = Some(forced.clone());
                } else if let Some(cmd) = definition.hwid_detect_cmd.clone() {
                    let outcome = executor.execute(&cmd, &ExecConfig::default());
                    if outcome.result != 0 || outcome.signaled != 0 {
                        warn!(result = outcome.result, "hwid detector command failed");
                    } else {
                        let trimmed = String::from_utf8_lossy(&outcome.stdout).trim().to_string();
                        info!(hwid = %trimmed, "detected HW ID");
                        definition.detected_hw = Some(trimmed);
                    }
                }
            }
            PlanEvent::SuiteStart(suite) => {
                writer.suite_start(&suite.name);
                info!(suite = %suite.name, "SUITE start");
            }
            PlanEvent::SetProcess(mut set) => {
                anchors.set_set(Some(set.name.clone()));
                writer.set_start(&set);
                set_runner::run_set(
                    &mut set,
                    &definition,
                    config,
                    &executor,
                    reboot.as_mut(),
                    &mut run_ctx,
                    power.as_mut(),
                    evaluator.as_mut(),
                    &mut counters,
                    case_manual.as_mut(),
                    &anchors,
                );
                for case in &set.cases {
                    anchors.set_case(Some(case.name.clone()));
                    writer.case_end(case);
                }
                anchors.set_case(None);
                writer.set_end(&set);
                anchors.set_set(None);
            }
            PlanEvent::SuiteEnd => {
                writer.suite_end();
                info!("SUITE end");
            }
            PlanEvent::TdEnd => {
                info!("TD end");
            }
        }
    }

    info!(
        executed = counters.executed,
        passed = counters.passed,
        failed = counters.failed,
        na = counters.na,
        filtered = counters.filtered,
        "run driver terminated"
    );
    writer.finish(counters).map_err(|e| {
        let io_err = match e {
            WriterError::Io(err) => err,
            WriterError::Serialize(err) => std::io::Error::new(std::io::ErrorKind::Other, err),
        };
        tlr_core::PlanError::Io(io_err)
    })?;
    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlr_core::YamlPlanReader;

    const PLAN: &str = r#"
suite:
  name: my-suite
  sets:
    - name: my-set
      cases:
        - name: case-1
          steps:
            - step: "true"
              expected_result: 0
"#;

    #[test]
    fn runs_minimal_plan_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("result.json");
        let mut reader = YamlPlanReader::from_str(PLAN).unwrap();
        let config = EngineConfig::default();
        let writer = Box::new(crate::result_writer::JsonResultWriter::new(&output));
        let counters = run(&mut reader, &config, writer).unwrap();
        assert_eq!(counters.passed, 1);
        assert!(output.exists());
    }

    #[test]
    fn current_anchors_start_empty() {
        let anchors = CurrentAnchors::default();
        assert!(anchors.current_set_name().is_none());
        assert!(anchors.current_case_name().is_none());
        assert_eq!(anchors.current_step_num(), 0);
    }

    #[test]
    fn current_anchors_reports_step_progress() {
        let anchors = CurrentAnchors::default();
        anchors.set_step(3);
        assert_eq!(anchors.current_step_num(), 3);
        anchors.set_step(0);
        assert_eq!(anchors.current_step_num(), 0);
    }

}
