//! Executor: runs a single shell command under dual-timeout control.
//!
//! Implements Section 4.1. Every command is spawned as the leader of its own
//! process group so that the soft/hard timeout escalation (SIGTERM then SIGKILL)
//! can be delivered to the whole group rather than just the immediate child,
//! matching the process-group cleanup contract the rest of the engine relies on
//! (Section 4.4, Section 8 invariant 1).

use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;

/// Raised when the Executor cannot even start a command; never raised for a
/// command that ran and merely returned an unexpected exit code.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Per-invocation configuration (Section 4.1).
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub soft_timeout_sec: u32,
    pub hard_timeout_sec: u32,
    /// Chroot the command under this directory, if the engine is configured for
    /// it and `disobey_chroot` is not set.
    pub chroot: Option<PathBuf>,
    /// Run the command in the host environment even if the engine is otherwise
    /// configured to chroot.
    pub disobey_chroot: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self { soft_timeout_sec: 90, hard_timeout_sec: 120, chroot: None, disobey_chroot: false }
    }
}

/// Outcome of a single command execution (Section 4.1, feeds into `Step`).
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code. Untrustworthy (and ignored by callers) when `signaled != 0`.
    pub result: i32,
    /// Signal used to terminate the process group, 0 if the command exited on its own.
    pub signaled: i32,
    pub pgid: i32,
    pub start_time: i64,
    pub end_time: i64,
    pub failure_info: Option<String>,
}

/// ASCII control characters stripped from captured output, except LF/CR which are
/// kept so multi-line output stays readable (Section 4.1, Section 8 law).
fn is_strippable_control_byte(b: u8) -> bool {
    matches!(b, 0x01..=0x1F | 0x7F) && b != 0x0A && b != 0x0D
}

/// Replace stripped control bytes with 0x20 (SPACE). Operates on raw bytes so
/// multi-byte UTF-8 sequences (whose continuation bytes are all >= 0x80) pass
/// through untouched; idempotent by construction (Section 8 invariant 6).
pub fn sanitize(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|&b| if is_strippable_control_byte(b) { b' ' } else { b }).collect()
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Runs shell commands with soft/hard timeout enforcement and output sanitisation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Execute `command` via `/bin/sh -c`, enforcing `config`'s timeouts.
    pub fn execute(&self, command: &str, config: &ExecConfig) -> ExecOutcome {
        let start_time = now_unix();
        let start_instant = Instant::now();

        let mut cmd = match (&config.chroot, config.disobey_chroot) {
            (Some(dir), false) => {
                let mut c = Command::new("chroot");
                c.arg(dir).arg("/bin/sh").arg("-c").arg(command);
                c
            }
            _ => {
                let mut c = Command::new("/bin/sh");
                c.arg("-c").arg(command);
                c
            }
        };
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        // SAFETY: `setpgid` is async-signal-safe and the closure touches no
        // heap state shared with the parent, satisfying `pre_exec`'s contract.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecOutcome {
                    start_time,
                    end_time: now_unix(),
                    failure_info: Some(ExecutorError::from(e).to_string()),
                    ..Default::default()
                };
            }
        };

        let pid = child.id() as i32;
        let pgid = pid;
        let soft = Duration::from_secs(config.soft_timeout_sec as u64);
        let hard = Duration::from_secs(config.hard_timeout_sec.max(config.soft_timeout_sec) as u64);

        let mut signaled = 0i32;
        let mut failure_info = None;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    failure_info = Some(format!("wait error: {e}"));
                    break None;
                }
            }

            let elapsed = start_instant.elapsed();
            if elapsed >= hard {
                let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
                signaled = Signal::SIGKILL as i32;
                failure_info = Some(format!("killed by signal {signaled}"));
                let _ = child.wait();
                break None;
            } else if elapsed >= soft && signaled == 0 {
                let _ = killpg(Pid::from_raw(pgid), Signal::SIGTERM);
                signaled = Signal::SIGTERM as i32;
                failure_info = Some("command timed out".to_string());
                // keep polling towards the hard timeout in case SIGTERM is ignored
            }

            std::thread::sleep(Duration::from_millis(20));
        };

        // If the process reacted to SIGTERM and exited on its own before the hard
        // deadline, trust that it is gone but keep the timeout classification.
        let result = status
            .as_ref()
            .and_then(|s| s.code())
            .unwrap_or(0);
        let exit_signal = status.as_ref().and_then(|s| s.signal()).unwrap_or(0);
        if exit_signal != 0 {
            signaled = exit_signal;
            failure_info.get_or_insert_with(|| format!("killed by signal {exit_signal}"));
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_end(&mut stdout);
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_end(&mut stderr);
        }

        ExecOutcome {
            stdout: sanitize(&stdout),
            stderr: sanitize(&stderr),
            result,
            signaled,
            pgid,
            start_time,
            end_time: now_unix(),
            failure_info,
        }
    }
}
