//! Reboot waiter: blocks a `REBOOT_FORCED`/`REBOOT_EXPECTED` step until the
//! target is reachable again, or reports failure (Section 4.2).
//!
//! The engine has no built-in notion of "reachable" (that is target-specific:
//! ping, SSH banner, serial heartbeat, ...), so this is a trait with a
//! poll-based reference implementation rather than a fixed protocol.

use std::time::{Duration, Instant};

pub trait RebootWaiter {
    /// Block until the target comes back, or the waiter gives up. Returns
    /// false on timeout or any unrecoverable error probing the target.
    fn wait_for_reboot(&mut self) -> bool;
}

/// Polls a user-supplied reachability probe at a fixed interval until it
/// succeeds or `timeout` elapses.
pub struct PollingRebootWaiter {
    pub timeout: Duration,
    pub poll_interval: Duration,
    probe: Box<dyn FnMut() -> bool + Send>,
}

impl PollingRebootWaiter {
    pub fn new(timeout: Duration, probe: impl FnMut() -> bool + Send + 'static) -> Self {
        Self { timeout, poll_interval: Duration::from_secs(1), probe: Box::new(probe) }
    }
}

impl RebootWaiter for PollingRebootWaiter {
    fn wait_for_reboot(&mut self) -> bool {
        let start = Instant::now();
        loop {
            if (self.probe)() {
                return true;
            }
            if start.elapsed() >= self.timeout {
                return false;
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

/// Test double that always reports success immediately.
#[derive(Debug, Default)]
pub struct AlwaysRecoversReboot;

impl RebootWaiter for AlwaysRecoversReboot {
    fn wait_for_reboot(&mut self) -> bool {
        true
    }
}

/// Test double that always reports failure immediately.
#[derive(Debug, Default)]
pub struct NeverRecoversReboot;

impl RebootWaiter for NeverRecoversReboot {
    fn wait_for_reboot(&mut self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_waiter_returns_true_once_probe_succeeds() {
        let mut calls = 0;
        let mut waiter = PollingRebootWaiter::new(Duration::from_secs(2), move || {
            calls += 1;
            calls >= 2
        });
        waiter.poll_interval = Duration::from_millis(10);
        assert!(waiter.wait_for_reboot());
    }

    #[test]
    fn polling_waiter_times_out() {
        let mut waiter = PollingRebootWaiter::new(Duration::from_millis(50), || false);
        waiter.poll_interval = Duration::from_millis(10);
        assert!(!waiter.wait_for_reboot());
    }
}
