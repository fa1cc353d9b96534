//! Table of spawned helpers.
//!
//! Helpers are not restarted or monitored. The table exists so a Stop can
//! terminate each one individually and reap it.

use super::HelperRole;
use crate::util::wait_timeout;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::process::Child;
use std::time::{Duration, Instant};

struct TrackedProcess {
    pid: u32,
    role: HelperRole,
    child: Child,
}

/// Every helper spawned by this launcher, by process id.
#[derive(Default)]
pub struct ProcessTable {
    entries: Vec<TrackedProcess>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: HelperRole, child: Child) -> u32 {
        let pid = child.id();
        self.entries.push(TrackedProcess { pid, role, child });
        pid
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(pid, role)` of every tracked helper, in spawn order.
    pub fn processes(&self) -> Vec<(u32, HelperRole)> {
        self.entries.iter().map(|p| (p.pid, p.role)).collect()
    }

    /// Terminate and reap every tracked helper.
    ///
    /// Sends SIGTERM to all, waits until `grace` after the signals for them
    /// to exit, then SIGKILLs and reaps whatever is left. Returns the number
    /// of helpers reaped.
    pub fn terminate_all(&mut self, grace: Duration) -> usize {
        for p in &mut self.entries {
            if matches!(p.child.try_wait(), Ok(Some(_))) {
                continue;
            }
            match kill(Pid::from_raw(p.pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pid = p.pid, role = %p.role, "SIGTERM failed: {}", e),
            }
        }

        let deadline = Instant::now() + grace;
        let mut reaped = 0;
        for mut p in self.entries.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match wait_timeout(&mut p.child, remaining) {
                Ok(Some(status)) => {
                    tracing::debug!(pid = p.pid, role = %p.role, %status, "Helper exited");
                    reaped += 1;
                }
                Ok(None) | Err(_) => {
                    tracing::warn!(pid = p.pid, role = %p.role, "Helper ignored SIGTERM, killing");
                    let _ = p.child.kill();
                    if p.child.wait().is_ok() {
                        reaped += 1;
                    }
                }
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_terminate_all_reaps_everything() {
        let mut table = ProcessTable::new();
        let a = table.insert(HelperRole::VncServer, Command::new("sleep").arg("30").spawn().unwrap());
        let b = table.insert(HelperRole::AdbConnector, Command::new("sleep").arg("30").spawn().unwrap());
        assert_eq!(table.processes(), vec![(a, HelperRole::VncServer), (b, HelperRole::AdbConnector)]);

        assert_eq!(table.terminate_all(Duration::from_secs(5)), 2);
        assert!(table.is_empty());
        assert_eq!(kill(Pid::from_raw(a as i32), None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_terminate_all_escalates_to_sigkill() {
        let mut table = ProcessTable::new();
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg("trap '' TERM; while :; do sleep 1; done")
            .spawn()
            .unwrap();
        let pid = table.insert(HelperRole::UsbServer, child);
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(table.terminate_all(Duration::from_millis(200)), 1);
        assert_eq!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_grace_period_shared_by_all_helpers() {
        let mut table = ProcessTable::new();
        for role in [HelperRole::UsbServer, HelperRole::VncServer, HelperRole::AdbConnector] {
            let child = Command::new("/bin/sh")
                .arg("-c")
                .arg("trap '' TERM; while :; do sleep 1; done")
                .spawn()
                .unwrap();
            table.insert(role, child);
        }
        std::thread::sleep(Duration::from_millis(200));

        let grace = Duration::from_millis(500);
        let started = Instant::now();
        assert_eq!(table.terminate_all(grace), 3);
        assert!(started.elapsed() < grace * 2, "took {:?}", started.elapsed());
    }

    #[test]
    fn test_already_exited_helper_counts_as_reaped() {
        let mut table = ProcessTable::new();
        table.insert(HelperRole::IvServer, Command::new("true").spawn().unwrap());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(table.terminate_all(Duration::from_secs(1)), 1);
    }
}
