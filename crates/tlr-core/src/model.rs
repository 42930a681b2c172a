//! Core data model for the test execution engine.
//!
//! These types match the data model defined in the spec (Section 3): Definition,
//! Suite, Set, Case, Step, StepGroup, GetFile and the crash-report table. Ownership
//! follows the parent/child shape described there - each entity is owned by its
//! parent and the engine never stashes references to them beyond a callback frame.

use std::collections::BTreeMap;
use std::collections::HashSet;

/// Replacement character used when normalising a case UUID into a marker-file-safe
/// string (Section 4.3 / Section 9): every `-` in the canonical 36-char form becomes
/// this character so the marker filename stays "word-like" for the downstream dumper.
pub const UUID_DASH_REPLACEMENT: char = '0';

/// Sentinel `bail_out` code raised when the target connection is lost and cannot be
/// distinguished from an ordinary step exit code. Any value outside 0..=255 would do;
/// this one is kept distinct from common shell exit codes on purpose.
pub const REMOTE_FAIL: i32 = 111;

/// Root of a test plan. Created on `TdStart`, destroyed on `TdEnd` (Section 3).
#[derive(Debug, Clone, Default)]
pub struct Definition {
    /// Command used to detect the hardware identifier of the target, if any.
    pub hwid_detect_cmd: Option<String>,
    /// Hardware identifier detected by `hwid_detect_cmd`. Populated once by the
    /// Run Driver's `HwIdDetect` handling and immutable afterwards.
    pub detected_hw: Option<String>,
}

/// A named group of sets, bracketed by `SuiteStart`/`SuiteEnd` (Section 3).
#[derive(Debug, Clone, Default)]
pub struct Suite {
    pub name: String,
}

/// Control mode for a step (Section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    #[default]
    None,
    RebootForced,
    RebootExpected,
}

/// Which of the two supported events a step dispatches to (Section 4.2 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Send,
    Wait,
}

/// An inter-process synchronisation event attached to a step.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub kind: EventKind,
    pub resource: String,
}

/// Case/Set verdict. Transitions are one-way: PASS may move to FAIL or NA, but
/// nothing ever moves back to PASS once it has failed (Section 3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Na,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Na => "NA",
        }
    }
}

/// A single step within a case or a pre/post step group (Section 3).
#[derive(Debug, Clone)]
pub struct Step {
    /// Shell command to run. Empty means "no-op" (e.g. an event-only step).
    pub command: String,
    pub event: Option<EventSpec>,
    pub manual: bool,
    pub control: Control,
    pub expected_result: i32,
    pub has_expected_result: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub return_code: i32,
    /// Terminating signal number, 0 if the process exited normally.
    pub signaled: i32,
    /// Wall-clock start time (unix seconds), 0 if never started.
    pub start: i64,
    /// Wall-clock end time (unix seconds).
    pub end: i64,
    /// Process group id owning the step's subprocess, 0 if none/cleaned up.
    pub pgid: i32,
    pub failure_info: Option<String>,
    pub has_result: bool,
}

impl Step {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            event: None,
            manual: false,
            control: Control::None,
            expected_result: 0,
            has_expected_result: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            return_code: 0,
            signaled: 0,
            start: 0,
            end: 0,
            pgid: 0,
            failure_info: None,
            has_result: false,
        }
    }
}

/// An ordered group of pre- or post-steps with its own timeout override.
#[derive(Debug, Clone, Default)]
pub struct StepGroup {
    /// Soft timeout override for every step in the group, 0 = engine default.
    pub timeout: u32,
    pub steps: Vec<Step>,
}

/// A declarative request to fetch (and optionally delete) a file from the target
/// (Section 3, Section 4.6).
#[derive(Debug, Clone)]
pub struct GetFile {
    pub path: String,
    pub delete_after: bool,
    pub measurement: bool,
    pub series: bool,
}

/// Telemetry-URL table keyed by crash report base filename. An empty/`None` value
/// means the uploader has not yet published a URL for that report (Section 3, 4.7).
pub type CrashReportMap = BTreeMap<String, Option<String>>;

/// A single test case (Section 3).
#[derive(Debug, Clone)]
pub struct Case {
    pub name: String,
    pub manual: bool,
    /// Free-text lifecycle state; the literal value `"Design"` means "skip".
    pub state: String,
    /// Soft timeout in seconds, 0 means "use the engine-wide default".
    pub timeout: u32,
    pub steps: Vec<Step>,
    pub post_reboot_steps: Vec<Step>,
    pub gets: Vec<GetFile>,
    pub verdict: Verdict,
    pub failure_info: Option<String>,
    pub crash_reports: CrashReportMap,
    /// Set iff at least one crash report was associated with this case.
    pub rich_core_uuid: Option<String>,
    /// True once a pre-run filter decided to skip this case entirely.
    pub filtered: bool,
}

impl Case {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manual: false,
            state: String::new(),
            timeout: 0,
            steps: Vec::new(),
            post_reboot_steps: Vec::new(),
            gets: Vec::new(),
            verdict: Verdict::Pass,
            failure_info: None,
            crash_reports: CrashReportMap::new(),
            rich_core_uuid: None,
            filtered: false,
        }
    }

    /// Fail the case (Section 3 invariant: PASS -> FAIL is the only forward
    /// transition out of PASS, and FAIL never reverts). `info` is recorded only
    /// the first time the case fails.
    pub fn fail(&mut self, info: impl Into<String>) {
        if self.verdict != Verdict::Fail {
            self.verdict = Verdict::Fail;
        }
        if self.failure_info.is_none() {
            self.failure_info = Some(info.into());
        }
    }

    /// Mark the case not-applicable. Per the invariant this only makes sense
    /// before any step has failed; callers are expected to check that up front.
    pub fn mark_na(&mut self) {
        if self.verdict == Verdict::Pass {
            self.verdict = Verdict::Na;
        }
    }
}

/// A named group of test cases plus their fixtures (Section 3).
#[derive(Debug, Clone, Default)]
pub struct Set {
    pub name: String,
    pub environments: HashSet<String>,
    /// Comma-separated hardware-id whitelist; empty means "no restriction".
    pub hwid: String,
    pub pre_steps: Vec<StepGroup>,
    pub post_steps: Vec<StepGroup>,
    pub cases: Vec<Case>,
    pub gets: Vec<GetFile>,
    /// Active environment name, stamped by the Set Runner at execution time.
    pub environment: String,
}

/// Process-wide bail-out state (Section 3, Section 9). Re-architected as an
/// explicit value threaded through the runners rather than true global state;
/// transitions are limited to the three call sites named in the design notes.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// 0 = healthy, non-zero = unrecoverable target-connection failure code.
    pub bail_out: i32,
    pub global_failure: Option<String>,
}

impl RunContext {
    pub fn is_bailed_out(&self) -> bool {
        self.bail_out != 0
    }

    /// Raise the bail-out condition. Write-once per incident: a second call before
    /// `clear` is a no-op on the message so the original failure reason survives.
    pub fn raise(&mut self, code: i32, message: impl Into<String>) {
        if self.bail_out == 0 {
            self.bail_out = code;
            self.global_failure = Some(message.into());
        }
    }

    /// Clear the bail-out condition. Only reboot-expected recovery calls this.
    pub fn clear(&mut self) {
        self.bail_out = 0;
        self.global_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_fail_keeps_first_failure_info() {
        let mut c = Case::new("c1");
        c.fail("first reason");
        c.fail("second reason");
        assert_eq!(c.verdict, Verdict::Fail);
        assert_eq!(c.failure_info.as_deref(), Some("first reason"));
    }

    #[test]
    fn case_mark_na_does_not_override_fail() {
        let mut c = Case::new("c1");
        c.fail("boom");
        c.mark_na();
        assert_eq!(c.verdict, Verdict::Fail);
    }

    #[test]
    fn run_context_raise_is_write_once() {
        let mut ctx = RunContext::default();
        ctx.raise(REMOTE_FAIL, "earlier connection failure");
        ctx.raise(999, "ignored");
        assert_eq!(ctx.bail_out, REMOTE_FAIL);
        assert_eq!(ctx.global_failure.as_deref(), Some("earlier connection failure"));
    }

    #[test]
    fn run_context_clear_resets_state() {
        let mut ctx = RunContext::default();
        ctx.raise(REMOTE_FAIL, "boom");
        ctx.clear();
        assert!(!ctx.is_bailed_out());
        assert!(ctx.global_failure.is_none());
    }
}
