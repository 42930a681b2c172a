//! Step Post-Processor (Section 4.4): idempotent cleanup of dangling process
//! groups left behind by the Executor.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tlr_core::Step;
use tracing::debug;

/// Send SIGKILL to `step`'s process group unless it should be skipped. Safe to
/// call more than once on the same step: `pgid` is left as-is and killing an
/// already-reaped process group is a harmless no-op (Section 4.4 guarantee:
/// no orphan process group outlives the Case).
pub fn post_process(step: &Step, case_filtered: bool) {
    if step.manual || case_filtered || step.start == 0 || step.pgid == 0 {
        return;
    }
    match killpg(Pid::from_raw(step.pgid), Signal::SIGKILL) {
        Ok(()) => debug!(pgid = step.pgid, "killed dangling step process group"),
        Err(nix::errno::Errno::ESRCH) => {} // already gone, nothing to clean up
        Err(e) => debug!(pgid = step.pgid, error = %e, "failed to kill step process group"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_manual_steps() {
        let mut step = Step::new("true");
        step.manual = true;
        step.pgid = 99999;
        step.start = 1;
        post_process(&step, false);
    }

    #[test]
    fn skips_steps_that_never_started() {
        let step = Step::new("true");
        post_process(&step, false);
    }

    #[test]
    fn skips_steps_with_no_pgid() {
        let mut step = Step::new("true");
        step.start = 1;
        post_process(&step, false);
    }

    #[test]
    fn tolerates_already_reaped_process_group() {
        let mut step = Step::new("true");
        step.start = 1;
        step.pgid = 999_999; // unlikely to be a real pgid
        post_process(&step, false);
    }
}
