//! Step Runner: executes a single `Step` and classifies its outcome.
//!
//! Implements Section 4.2. The dummy-case sentinel from the original
//! implementation is replaced (Section 9) with an explicit `StepContext` so
//! pre/post step groups don't need a fake `Case` to hang their verdict off of.

use thiserror::Error;
use tlr_core::{Control, EventKind, RunContext, Step, REMOTE_FAIL};
use tracing::{info, warn};

use crate::executor::{ExecConfig, Executor};
use crate::reboot::RebootWaiter;

/// Raised when the target connection itself is the reason a step could not be
/// classified normally (Section 4.2 steps 2, 3 and 7), as opposed to the step
/// simply returning an unexpected exit code.
#[derive(Debug, Error)]
pub enum StepRunnerError {
    #[error("connection to target lost: {0}")]
    ConnectionLost(String),
}

fn connection_lost(reason: &str) -> String {
    StepRunnerError::ConnectionLost(reason.to_string()).to_string()
}

/// What kind of owner a step group is running under (Section 9's replacement for
/// the `dummy` sentinel flag on `Case`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepContextKind {
    Case,
    PrePost,
}

/// Carries the bits of case state the Step Runner needs without borrowing a
/// whole `Case` - real cases and pre/post step groups both go through this.
pub struct StepContext<'a> {
    pub kind: StepContextKind,
    pub timeout: u32,
    pub verdict_failed: &'a mut bool,
    pub failure_info: &'a mut Option<String>,
}

impl<'a> StepContext<'a> {
    fn fail(&mut self, info: impl Into<String>) {
        *self.verdict_failed = true;
        if self.failure_info.is_none() {
            *self.failure_info = Some(info.into());
        }
    }
}

/// Dispatches an `event` step. Stubbed: `SEND`/`WAIT` events are out of scope
/// (Section 1's Non-goals list event transport among the manual-step/measurement
/// helpers referenced only by interface), so this simply fails with a
/// descriptive message naming the resource, matching the failure-info contract
/// in Section 4.2 step 4 without claiming to implement real event delivery.
pub trait EventHelper {
    fn dispatch(&mut self, kind: EventKind, resource: &str) -> Result<(), String>;
}

/// No-op `EventHelper` that always fails; used when no real transport is wired up.
#[derive(Debug, Default)]
pub struct UnsupportedEventHelper;

impl EventHelper for UnsupportedEventHelper {
    fn dispatch(&mut self, _kind: EventKind, resource: &str) -> Result<(), String> {
        Err(format!("no event transport configured for resource '{resource}'"))
    }
}

/// Runs a manual step. Stubbed to a fixed pass in headless runs (Section 1: manual-step
/// UI is out of scope); a real UI implementation would prompt the operator here.
pub trait ManualHelper {
    fn execute_manual_step(&mut self, step: &Step) -> bool;
}

#[derive(Debug, Default)]
pub struct AutoAckManualHelper;

impl ManualHelper for AutoAckManualHelper {
    fn execute_manual_step(&mut self, _step: &Step) -> bool {
        true
    }
}

/// Runs `steps` as post-reboot recovery steps under their own `PrePost` context
/// (Section 4.2 step 2 and step 7). Returns true iff every step passed. Used both
/// as the public Case Runner entry point and internally after a reboot succeeds.
#[allow(clippy::too_many_arguments)]
pub fn run_post_reboot_steps(
    steps: &mut [Step],
    timeout: u32,
    executor: &Executor,
    chroot: Option<std::path::PathBuf>,
    event_helper: &mut dyn EventHelper,
    manual_helper: &mut dyn ManualHelper,
    reboot: &mut dyn RebootWaiter,
    run_ctx: &mut RunContext,
) -> bool {
    let mut failed = false;
    let mut failure_info = None;
    let mut ctx = StepContext {
        kind: StepContextKind::PrePost,
        timeout,
        verdict_failed: &mut failed,
        failure_info: &mut failure_info,
    };
    for step in steps.iter_mut() {
        run_step(step, &mut ctx, executor, chroot.clone(), event_helper, manual_helper, reboot, run_ctx, &mut []);
    }
    !failed
}

/// Execute one step (Section 4.2). `ctx` carries the owning case/pre-post group's
/// mutable verdict sink so the runner never needs a real `Case` for dummy groups.
/// `post_reboot_steps` belongs to the enclosing Case (empty for pre/post groups,
/// which have none of their own) and runs immediately after any reboot this step
/// triggers succeeds, before the step's own classification (Section 4.2 step 2, 7).
#[allow(clippy::too_many_arguments)]
pub fn run_step(
    step: &mut Step,
    ctx: &mut StepContext<'_>,
    executor: &Executor,
    chroot: Option<std::path::PathBuf>,
    event_helper: &mut dyn EventHelper,
    manual_helper: &mut dyn ManualHelper,
    reboot: &mut dyn RebootWaiter,
    run_ctx: &mut RunContext,
    post_reboot_steps: &mut [Step],
) -> bool {
    // Step 2: forced reboot, not already bailed out.
    if step.control == Control::RebootForced && !run_ctx.is_bailed_out() {
        step.start = now();
        let recovered = reboot.wait_for_reboot();
        step.end = now();
        if !recovered {
            let msg = connection_lost("forced reboot did not complete");
            run_ctx.raise(REMOTE_FAIL, msg.as_str());
            step.has_result = true;
            step.return_code = REMOTE_FAIL;
            step.failure_info = Some(msg.clone());
            ctx.fail(msg);
            return false;
        }
        step.has_result = true;
        step.return_code = 0;
        if !post_reboot_steps.is_empty()
            && !run_post_reboot_steps(
                post_reboot_steps,
                ctx.timeout,
                executor,
                chroot,
                event_helper,
                manual_helper,
                reboot,
                run_ctx,
            )
        {
            ctx.fail("post reboot steps failed");
            return false;
        }
        return true;
    }

    // Step 3: already bailed out.
    if run_ctx.is_bailed_out() {
        step.has_result = true;
        step.return_code = run_ctx.bail_out;
        if step.control == Control::RebootForced {
            let msg = connection_lost("forced reboot did not complete");
            run_ctx.raise(REMOTE_FAIL, msg.as_str());
            step.failure_info = Some(msg.clone());
            ctx.fail(msg);
        } else if let Some(failure) = run_ctx.global_failure.clone() {
            step.failure_info = Some(failure.clone());
            ctx.fail(failure);
        }
        return false;
    }

    // Step 4: event dispatch.
    if let Some(event) = &step.event {
        let outcome = event_helper.dispatch(event.kind, &event.resource);
        step.has_result = true;
        if let Err(info) = outcome {
            step.return_code = 1;
            step.failure_info = Some(info.clone());
            info!(resource = %event.resource, "EVENT failed");
            ctx.fail(info);
            return false;
        }
        return true;
    }

    // Step 5: manual dispatch.
    if step.manual {
        if ctx.kind == StepContextKind::PrePost {
            warn!("manual pre/post steps not supported");
            step.has_result = true;
            return true;
        }
        let passed = manual_helper.execute_manual_step(step);
        step.has_result = true;
        if !passed {
            ctx.fail("manual step failed");
        }
        return passed;
    }

    if step.command.is_empty() {
        step.has_result = true;
        return true;
    }

    // Step 6: run through the Executor.
    let config = ExecConfig {
        soft_timeout_sec: if ctx.timeout > 0 { ctx.timeout } else { 90 },
        hard_timeout_sec: (ctx.timeout.max(1) * 2).max(ctx.timeout + 30),
        chroot: chroot.clone(),
        disobey_chroot: false,
    };
    let outcome = executor.execute(&step.command, &config);

    step.stdout = outcome.stdout;
    step.stderr = outcome.stderr;
    step.return_code = outcome.result;
    step.signaled = outcome.signaled;
    step.pgid = outcome.pgid;
    step.start = outcome.start_time;
    step.end = outcome.end_time;
    step.has_result = true;
    if let Some(info) = &outcome.failure_info {
        step.failure_info = Some(info.clone());
        info!(step = %step.command, failure_info = %info, "FAILURE INFO");
    }

    // Step 7: outcome classification.
    let passed = match step.control {
        Control::RebootExpected => classify_reboot_expected(
            step,
            ctx,
            executor,
            chroot,
            event_helper,
            manual_helper,
            reboot,
            run_ctx,
            post_reboot_steps,
        ),
        Control::RebootForced => unreachable!("handled above"),
        Control::None => {
            // Step 8: dummy groups pass unless an expected result was specified.
            if ctx.kind == StepContextKind::PrePost && !step.has_expected_result {
                true
            } else {
                step.signaled == 0 && step.return_code == step.expected_result
            }
        }
    };

    if !passed {
        let info = step.failure_info.clone().unwrap_or_else(|| {
            format!("STEP: {} return {} expected {}", step.command, step.return_code, step.expected_result)
        });
        step.failure_info.get_or_insert_with(|| info.clone());
        ctx.fail(info);
    }
    passed
}

/// Classifies a `REBOOT_EXPECTED` step's outcome once the Executor has returned
/// (Section 4.2 step 7). The engine has no live connection-monitoring channel
/// of its own (Section 1 Non-goals: no real SSH transport), so a disconnect is
/// inferred from the command's own abnormal exit — the expected shape of a
/// "reboot now" command whose shell connection drops mid-flight — rather than
/// from `run_ctx.bail_out`, which nothing sets during Executor::execute.
#[allow(clippy::too_many_arguments)]
fn classify_reboot_expected(
    step: &mut Step,
    ctx: &mut StepContext<'_>,
    executor: &Executor,
    chroot: Option<std::path::PathBuf>,
    event_helper: &mut dyn EventHelper,
    manual_helper: &mut dyn ManualHelper,
    reboot: &mut dyn RebootWaiter,
    run_ctx: &mut RunContext,
    post_reboot_steps: &mut [Step],
) -> bool {
    let disconnect_detected = step.signaled != 0 || step.return_code != step.expected_result;
    if disconnect_detected {
        if reboot.wait_for_reboot() {
            run_ctx.clear();
            step.return_code = step.expected_result;
            step.signaled = 0;
            if !post_reboot_steps.is_empty()
                && !run_post_reboot_steps(
                    post_reboot_steps,
                    ctx.timeout,
                    executor,
                    chroot,
                    event_helper,
                    manual_helper,
                    reboot,
                    run_ctx,
                )
            {
                ctx.fail("post reboot steps failed");
                return false;
            }
            true
        } else {
            let msg = connection_lost("reboot wait timed out");
            run_ctx.raise(REMOTE_FAIL, msg.as_str());
            step.failure_info = Some(msg.clone());
            ctx.fail(msg);
            false
        }
    } else {
        // No disconnect happened: the step was supposed to reboot but didn't.
        step.return_code = step.expected_result + 1;
        let info = format!(
            "STEP: {} expected reboot but none occurred",
            step.command
        );
        step.failure_info.get_or_insert_with(|| info.clone());
        ctx.fail(info);
        false
    }
}

fn now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reboot::AlwaysRecoversReboot;

    fn run(
        step: &mut Step,
        kind: StepContextKind,
        run_ctx: &mut RunContext,
    ) -> bool {
        let mut failed = false;
        let mut failure_info = None;
        let mut ctx =
            StepContext { kind, timeout: 5, verdict_failed: &mut failed, failure_info: &mut failure_info };
        let executor = Executor::new();
        let mut events = UnsupportedEventHelper;
        let mut manual = AutoAckManualHelper;
        let mut reboot = AlwaysRecoversReboot;
        run_step(step, &mut ctx, &executor, None, &mut events, &mut manual, &mut reboot, run_ctx, &mut [])
    }

    #[test]
    fn passing_step_matches_expected_result() {
        let mut step = Step::new("true");
        step.expected_result = 0;
        let mut run_ctx = RunContext::default();
        assert!(run(&mut step, StepContextKind::Case, &mut run_ctx));
        assert!(step.has_result);
    }

    #[test]
    fn failing_step_sets_return_code_and_fails() {
        let mut step = Step::new("false");
        step.expected_result = 0;
        let mut run_ctx = RunContext::default();
        assert!(!run(&mut step, StepContextKind::Case, &mut run_ctx));
        assert_eq!(step.return_code, 1);
        assert!(step.failure_info.is_some());
    }

    #[test]
    fn bailed_out_step_auto_fails_without_running() {
        let mut step = Step::new("true");
        let mut run_ctx = RunContext::default();
        run_ctx.raise(REMOTE_FAIL, "earlier connection failure");
        assert!(!run(&mut step, StepContextKind::Case, &mut run_ctx));
        assert_eq!(step.return_code, REMOTE_FAIL);
        assert!(step.has_result);
        assert_eq!(step.start, 0, "bailed-out step never actually spawns");
    }

    #[test]
    fn dummy_group_ignores_exit_code_without_expected_result() {
        let mut step = Step::new("false");
        step.has_expected_result = false;
        let mut run_ctx = RunContext::default();
        assert!(run(&mut step, StepContextKind::PrePost, &mut run_ctx));
    }

    #[test]
    fn dummy_group_honors_explicit_expected_result() {
        let mut step = Step::new("false");
        step.has_expected_result = true;
        step.expected_result = 0;
        let mut run_ctx = RunContext::default();
        assert!(!run(&mut step, StepContextKind::PrePost, &mut run_ctx));
    }

    #[test]
    fn manual_pre_post_step_is_skipped_not_failed() {
        let mut step = Step::new("");
        step.manual = true;
        let mut run_ctx = RunContext::default();
        assert!(run(&mut step, StepContextKind::PrePost, &mut run_ctx));
    }

    #[test]
    fn reboot_forced_step_recovers_and_passes() {
        let mut step = Step::new("");
        step.control = Control::RebootForced;
        let mut run_ctx = RunContext::default();
        assert!(run(&mut step, StepContextKind::Case, &mut run_ctx));
        assert!(step.has_result);
        assert!(!run_ctx.is_bailed_out());
    }

    #[test]
    fn reboot_forced_step_raises_bail_out_when_target_never_comes_back() {
        use crate::reboot::NeverRecoversReboot;

        let mut step = Step::new("");
        step.control = Control::RebootForced;
        let mut run_ctx = RunContext::default();
        let mut failed = false;
        let mut failure_info = None;
        let mut ctx = StepContext {
            kind: StepContextKind::Case,
            timeout: 5,
            verdict_failed: &mut failed,
            failure_info: &mut failure_info,
        };
        let executor = Executor::new();
        let mut events = UnsupportedEventHelper;
        let mut manual = AutoAckManualHelper;
        let mut reboot = NeverRecoversReboot;
        let passed =
            run_step(&mut step, &mut ctx, &executor, None, &mut events, &mut manual, &mut reboot, &mut run_ctx, &mut []);

        assert!(!passed);
        assert!(run_ctx.is_bailed_out());
        assert_eq!(run_ctx.bail_out, REMOTE_FAIL);
    }

    #[test]
    fn reboot_expected_step_reconnects_after_command_drops_connection() {
        // "false" stands in for a reboot command whose shell connection drops
        // mid-flight: the abnormal exit is what signals "disconnect happened".
        let mut step = Step::new("false");
        step.control = Control::RebootExpected;
        step.expected_result = 0;
        let mut run_ctx = RunContext::default();
        assert!(run(&mut step, StepContextKind::Case, &mut run_ctx));
        assert!(!run_ctx.is_bailed_out());
        assert_eq!(step.return_code, 0);
    }

    #[test]
    fn reboot_expected_step_fails_when_no_disconnect_occurred() {
        let mut step = Step::new("true");
        step.control = Control::RebootExpected;
        step.expected_result = 0;
        let mut run_ctx = RunContext::default();
        assert!(!run(&mut step, StepContextKind::Case, &mut run_ctx));
        assert_eq!(step.return_code, 1);
    }
}
