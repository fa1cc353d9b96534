//! Stop handling: tearing down every process of the instance.
//!
//! 1. Ask the VM backend to stop (best effort)
//! 2. Terminate and reap every helper in the process table
//! 3. SIGKILL anything else left in the launcher's process group
//!
//! Step 3 walks `/proc`. Without it, a disposable child moves into a fresh
//! group and kills the original one, the launcher included; the client then
//! sees the connection close without a response.

use super::ActionHandler;
use crate::spawn::ProcessTable;
use crate::vmm::VmManager;
use cvd_shared::{CvdError, CvdResult};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpgrp, getpid, setpgid};
use std::time::Duration;

const HELPER_GRACE: Duration = Duration::from_secs(2);

/// [`ActionHandler`] that owns the VM backend and the helper table.
pub struct InstanceTeardown {
    vm: Box<dyn VmManager>,
    helpers: ProcessTable,
    pgid: Pid,
    grace: Duration,
}

impl InstanceTeardown {
    /// Tear down the caller's own process group.
    pub fn new(vm: Box<dyn VmManager>, helpers: ProcessTable) -> Self {
        Self::for_group(vm, helpers, getpgrp())
    }

    pub fn for_group(vm: Box<dyn VmManager>, helpers: ProcessTable, pgid: Pid) -> Self {
        Self {
            vm,
            helpers,
            pgid,
            grace: HELPER_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl ActionHandler for InstanceTeardown {
    fn stop(&mut self) -> CvdResult<()> {
        if let Err(e) = self.vm.stop() {
            tracing::warn!("VM backend stop failed, continuing teardown: {}", e);
        }
        let reaped = self.helpers.terminate_all(self.grace);
        tracing::info!(reaped, "Terminated helpers");

        match sweep_process_group(self.pgid) {
            Ok(killed) => {
                tracing::info!(killed, pgid = self.pgid.as_raw(), "Process group swept");
                Ok(())
            }
            Err(CvdError::Unsupported(reason)) => {
                tracing::warn!("{}, signalling the whole group", reason);
                kill_group_from_new_group(self.pgid)
            }
            Err(e) => Err(e),
        }
    }
}

/// SIGKILL every process in `pgid` except the caller.
///
/// Returns how many processes were signalled, or
/// [`CvdError::Unsupported`] when the process list is unavailable.
#[cfg(target_os = "linux")]
pub fn sweep_process_group(pgid: Pid) -> CvdResult<usize> {
    let me = getpid().as_raw();
    let processes = procfs::process::all_processes()
        .map_err(|e| CvdError::Unsupported(format!("Cannot list processes: {}", e)))?;

    let mut killed = 0;
    let mut denied = Vec::new();
    for process in processes.flatten() {
        let Ok(stat) = process.stat() else {
            continue;
        };
        if stat.pgrp != pgid.as_raw() || stat.pid == me || stat.state == 'Z' {
            continue;
        }
        match kill(Pid::from_raw(stat.pid), Signal::SIGKILL) {
            Ok(()) => killed += 1,
            Err(Errno::ESRCH) => {}
            Err(e) => denied.push(format!("{} ({}): {}", stat.pid, stat.comm, e)),
        }
    }
    if !denied.is_empty() {
        return Err(CvdError::Signal(format!(
            "Failed to kill group members: {}",
            denied.join(", ")
        )));
    }
    Ok(killed)
}

#[cfg(not(target_os = "linux"))]
pub fn sweep_process_group(_pgid: Pid) -> CvdResult<usize> {
    Err(CvdError::Unsupported("No process list on this platform".into()))
}

/// Kill `pgid` from a disposable child placed in its own group.
///
/// When `pgid` is the caller's group a successful kill never returns here.
/// A wait that does return means the signal was not delivered.
pub fn kill_group_from_new_group(pgid: Pid) -> CvdResult<()> {
    // SAFETY: the child only makes async-signal-safe calls before _exit.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = kill_group_exit_code(setpgid(Pid::from_raw(0), Pid::from_raw(0)), pgid);
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            let status = waitpid(child, None)
                .map_err(|e| CvdError::Signal(format!("Failed to wait for kill helper: {}", e)))?;
            match status {
                WaitStatus::Exited(_, 0) if pgid != getpgrp() => Ok(()),
                WaitStatus::Exited(_, 0) => Err(CvdError::Signal(
                    "Process group kill returned, launcher survived".into(),
                )),
                WaitStatus::Exited(_, 2) => Err(CvdError::Signal(format!(
                    "Kill helper could neither leave nor kill process group {}",
                    pgid
                ))),
                other => Err(CvdError::Signal(format!(
                    "Failed to kill process group {}: {:?}",
                    pgid, other
                ))),
            }
        }
        Err(e) => Err(CvdError::Signal(format!("Failed to fork kill helper: {}", e))),
    }
}

/// Exit code of the disposable child. Async-signal-safe.
///
/// The kill is attempted even when the child could not leave the group; it
/// then dies along with it.
fn kill_group_exit_code(left_group: nix::Result<()>, pgid: Pid) -> i32 {
    match (killpg(pgid, Signal::SIGKILL), left_group) {
        (Ok(()), _) => 0,
        (Err(_), Ok(())) => 1,
        (Err(_), Err(_)) => 2,
    }
}
