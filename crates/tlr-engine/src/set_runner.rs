//! Set Runner (Section 4.5): filters a Set against the active environment and
//! hardware id, then walks its pre/post step groups and cases.

use thiserror::Error;
use tlr_core::{Definition, EngineConfig, ResumeMode, RunContext, Set, Step, Verdict};
use tracing::info;

use crate::case_runner::{self, CaseManualHelper, PowerStreamer, RunCounters};
use crate::executor::Executor;
use crate::get_processor::{process_get, MeasurementEvaluator};
use crate::reboot::RebootWaiter;
use crate::run_driver::CurrentAnchors;
use crate::step_post_processor;
use crate::step_runner::{
    AutoAckManualHelper, EventHelper, ManualHelper, StepContext, StepContextKind,
    UnsupportedEventHelper,
};

/// Raised for Set-level bookkeeping failures, as opposed to a Case or step
/// failing (which is recorded as a verdict, never an `Err`).
#[derive(Debug, Error)]
pub enum SetRunnerError {
    #[error("pre_steps failed: {0}")]
    PreStepsFailed(String),
}

fn hwid_excludes(set: &Set, definition: &Definition) -> bool {
    if set.hwid.is_empty() {
        return false;
    }
    match &definition.detected_hw {
        Some(detected) => !set.hwid.split(',').map(str::trim).any(|id| id == detected),
        None => false,
    }
}

fn should_skip(set: &Set, config: &EngineConfig, definition: &Definition) -> bool {
    if let Some(filter) = &config.set_filter {
        if set.name != *filter {
            return true;
        }
    }
    if hwid_excludes(set, definition) {
        return true;
    }
    if !set.environments.is_empty() && !set.environments.contains(&config.environment) {
        return true;
    }
    false
}

/// Runs a `StepGroup`'s steps under a synthetic dummy Case (Section 4.5, 4.2 step 8).
/// Returns `(passed, failure_info)`.
fn run_dummy_group(
    steps: &mut [Step],
    timeout: u32,
    executor: &Executor,
    config: &EngineConfig,
    reboot: &mut dyn RebootWaiter,
    run_ctx: &mut RunContext,
) -> (bool, Option<String>) {
    let mut failed = false;
    let mut failure_info = None;
    let mut ctx = StepContext {
        kind: StepContextKind::PrePost,
        timeout,
        verdict_failed: &mut failed,
        failure_info: &mut failure_info,
    };
    let mut events = UnsupportedEventHelper;
    let mut manual: Box<dyn ManualHelper> = Box::new(AutoAckManualHelper);
    for step in steps.iter_mut() {
        crate::step_runner::run_step(
            step,
            &mut ctx,
            executor,
            config.chroot_folder.clone(),
            &mut events as &mut dyn EventHelper,
            manual.as_mut(),
            reboot,
            run_ctx,
            &mut [],
        );
    }
    (!failed, failure_info)
}

fn post_process_groups(groups: &mut [tlr_core::StepGroup]) {
    for group in groups.iter_mut() {
        for step in group.steps.iter_mut() {
            step_post_processor::post_process(step, false);
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn run_set(
    set: &mut Set,
    definition: &Definition,
    config: &EngineConfig,
    executor: &Executor,
    reboot: &mut dyn RebootWaiter,
    run_ctx: &mut RunContext,
    power: &mut dyn PowerStreamer,
    measurement_evaluator: &mut dyn MeasurementEvaluator,
    counters: &mut RunCounters,
    case_manual: &mut dyn CaseManualHelper,
    anchors: &CurrentAnchors,
) {
    if should_skip(set, config, definition) {
        return;
    }

    set.environment = config.environment.clone();
    info!(set = %set.name, environment = %set.environment, "SET start (pre_set)");

    let mut short_circuited = false;
    for group in set.pre_steps.iter_mut() {
        let (passed, info) =
            run_dummy_group(&mut group.steps, group.timeout, executor, config, reboot, run_ctx);
        if !passed {
            let reason = run_ctx
                .global_failure
                .clone()
                .or(info)
                .unwrap_or_else(|| SetRunnerError::PreStepsFailed("no failure detail reported".to_string()).to_string());
            for case in set.cases.iter_mut() {
                case.fail(reason.clone());
            }
            short_circuited = true;
            break;
        }
    }

    if !short_circuited {
        for case in set.cases.iter_mut() {
            case_runner::run_case(
                case,
                config,
                executor,
                reboot,
                run_ctx,
                power,
                measurement_evaluator,
                case_manual,
                anchors,
            );
        }

        if let Some(ResumeMode::WaitForSignal) = config.resume_mode {
            block_for_resume_signal();
        }

        if !set.post_steps.is_empty() {
            for group in set.post_steps.iter_mut() {
                // post_steps failure is logged only; it never alters Case verdicts.
                let _ = run_dummy_group(&mut group.steps, group.timeout, executor, config, reboot, run_ctx);
            }
        }
    }

    for case in set.cases.iter() {
        counters.record(case);
    }

    let still_passing = set.cases.iter().all(|c| c.verdict != Verdict::Fail);
    for get in &set.gets {
        let _ = process_get(get, config, executor, run_ctx, still_passing, measurement_evaluator);
    }

    if matches!(config.resume_mode, Some(ResumeMode::ExitAfter)) {
        run_ctx.raise(tlr_core::REMOTE_FAIL, "resume-mode exit-after checkpoint reached");
    }

    info!(set = %set.name, "SET end (post_set)");
    post_process_groups(&mut set.pre_steps);
    post_process_groups(&mut set.post_steps);
}

/// Blocks until an external resume signal arrives (Section 4.5). The engine has
/// no built-in transport for this signal (it is deployment-specific: a file
/// touch, a socket message, an operator keypress); this reference
/// implementation polls for a conventional `RESUME` file in the working
/// directory so the Set Runner has a working default without a hard external
/// dependency.
fn block_for_resume_signal() {
    let marker = std::path::Path::new("RESUME");
    loop {
        if marker.exists() {
            let _ = std::fs::remove_file(marker);
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}
