//! Detaching the launcher from the invoking terminal.
//!
//! Two-phase startup: everything that can fail loudly runs attached, then
//! [`daemonize`] forks. The parent blocks on the boot event pipe and reports
//! the guest's outcome; the child becomes a session leader and keeps the
//! pipe's write end for the kernel log monitor.

use super::boot::{BootOutcome, monitor_boot_events};
use cvd_shared::{CvdError, CvdResult};
use nix::fcntl::OFlag;
use nix::unistd::{
    ForkResult, Pid, dup2_stderr, dup2_stdin, dup2_stdout, fork, getpid, getsid, pipe2, setpgid,
    setsid,
};
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::path::Path;

/// Which side of the fork the caller is on.
#[derive(Debug)]
pub enum DaemonFork {
    /// The invoking process, with the guest's boot outcome.
    ///
    /// `Err` is a framing failure on the pipe, distinct from a boot failure.
    Parent(CvdResult<BootOutcome>),
    /// The detached launcher, holding the only write end of the pipe.
    Child(OwnedFd),
}

/// Fork into a monitoring parent and a detached child.
///
/// Must be called while the process is single-threaded.
pub fn daemonize(log_path: &Path) -> CvdResult<DaemonFork> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| CvdError::Internal(format!("Failed to create boot event pipe: {}", e)))?;

    // SAFETY: the launcher has not started any threads at this point.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(write_end);
            tracing::info!(pid = child.as_raw(), "Launcher detached, waiting for boot events");
            let mut reader = File::from(read_end);
            Ok(DaemonFork::Parent(monitor_boot_events(&mut reader)))
        }
        Ok(ForkResult::Child) => {
            drop(read_end);
            redirect_standard_streams(log_path)?;
            setsid().map_err(|e| CvdError::Internal(format!("setsid failed: {}", e)))?;
            Ok(DaemonFork::Child(write_end))
        }
        Err(e) => Err(CvdError::Internal(format!("Failed to fork launcher: {}", e))),
    }
}

/// Point stdin at `/dev/null` and stdout/stderr at `log_path`.
fn redirect_standard_streams(log_path: &Path) -> CvdResult<()> {
    let null = File::open("/dev/null")
        .map_err(|e| CvdError::Storage(format!("Failed to open /dev/null: {}", e)))?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| CvdError::Storage(format!("Failed to open {}: {}", log_path.display(), e)))?;

    dup2_stdin(&null)
        .and_then(|_| dup2_stdout(&log))
        .and_then(|_| dup2_stderr(&log))
        .map_err(|e| CvdError::Internal(format!("Failed to redirect standard streams: {}", e)))
}

/// Move an attached launcher into its own process group.
///
/// A session leader already leads its group and is left alone.
pub fn ensure_own_process_group() -> CvdResult<()> {
    let sid = getsid(None).map_err(|e| CvdError::Signal(format!("getsid failed: {}", e)))?;
    if sid != getpid() {
        setpgid(Pid::from_raw(0), Pid::from_raw(0))
            .map_err(|e| CvdError::Signal(format!("Failed to create new process group: {}", e)))?;
    }
    Ok(())
}
