//! Descriptor handoff hook for helper processes.
//!
//! Runs after `fork()` and before `exec()` in the child:
//!
//! 1. **Mark inherited FDs close-on-exec** - nothing above stderr leaks into
//!    the helper by accident
//! 2. **Clear close-on-exec on handed FDs** - exactly the descriptors named on
//!    the helper's command line survive `exec()`
//!
//! # Safety
//!
//! The hook runs in a very restricted context:
//! - Only async-signal-safe syscalls are allowed
//! - No memory allocation (no Box, Vec, String)
//! - No logging (tracing, println)
//!
//! Inherited descriptors are marked rather than closed so the pipe `std`
//! uses to report `exec()` failures keeps working.

use std::os::fd::RawFd;
use std::process::Command;

const FIRST_FD: RawFd = 3;

#[cfg(target_os = "linux")]
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Mark every descriptor above stderr close-on-exec (async-signal-safe).
///
/// # Returns
///
/// * `Ok(())` - all descriptors marked
/// * `Err(errno)` - raw errno for io::Error conversion
pub fn mark_inherited_fds_cloexec_raw() -> Result<(), i32> {
    #[cfg(target_os = "linux")]
    {
        // close_range with CLOSE_RANGE_CLOEXEC (Linux 5.11+)
        let result = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                FIRST_FD as libc::c_uint,
                libc::c_uint::MAX,
                CLOSE_RANGE_CLOEXEC,
            )
        };
        if result == 0 {
            return Ok(());
        }
    }

    // Fallback: walk a bounded range
    for fd in FIRST_FD..1024 {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            continue;
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

/// Let `fd` survive `exec()` (async-signal-safe).
pub fn clear_cloexec_raw(fd: RawFd) -> Result<(), i32> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(last_errno());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Add the handoff hook to `cmd`, keeping exactly `keep` open across exec.
///
/// `keep` is allocated before the fork; the hook only reads it.
pub fn add_handoff_hook(cmd: &mut Command, keep: Vec<RawFd>) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the hook only uses async-signal-safe syscalls (fcntl, close_range).
    unsafe {
        cmd.pre_exec(move || {
            mark_inherited_fds_cloexec_raw().map_err(std::io::Error::from_raw_os_error)?;
            for fd in &keep {
                clear_cloexec_raw(*fd).map_err(std::io::Error::from_raw_os_error)?;
            }
            Ok(())
        });
    }
}
