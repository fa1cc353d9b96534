//! Spawning helper processes with descriptor handoff.
//!
//! Every handoff follows acquire, duplicate-to-child, close-in-parent:
//! [`HelperCommand::fd_arg`] duplicates the caller's descriptor and names its
//! number on the command line, the pre-exec hook lets exactly those numbers
//! survive `exec()`, and the parent's duplicates are dropped as soon as
//! `spawn()` returns.

pub mod pre_exec;
pub mod supervisor;

pub use supervisor::ProcessTable;

use cvd_shared::{CvdError, CvdResult};
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Descriptor value passed for an absent descriptor.
pub const INVALID_FD: RawFd = -1;

/// Helper processes the launcher knows how to start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HelperRole {
    KernelLogMonitor,
    UsbServer,
    IvServer,
    SocketForwardProxy,
    AdbConnector,
    VncServer,
}

impl HelperRole {
    /// Binary name under `<host_artifacts>/bin`.
    pub fn binary_name(&self) -> &'static str {
        match self {
            HelperRole::KernelLogMonitor => "kernel_log_monitor",
            HelperRole::UsbServer => "usbserver",
            HelperRole::IvServer => "ivserver",
            HelperRole::SocketForwardProxy => "socket_forward_proxy",
            HelperRole::AdbConnector => "adb_connector",
            HelperRole::VncServer => "vnc_server",
        }
    }
}

impl fmt::Display for HelperRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Invocation of one helper, including the descriptors it inherits.
#[derive(Debug)]
pub struct HelperCommand {
    role: HelperRole,
    program: PathBuf,
    args: Vec<String>,
    handed: Vec<OwnedFd>,
}

impl HelperCommand {
    pub fn new(role: HelperRole, program: impl Into<PathBuf>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            handed: Vec::new(),
        }
    }

    /// Append `--<flag>=<value>`.
    pub fn arg(&mut self, flag: &str, value: impl fmt::Display) -> &mut Self {
        self.args.push(format!("--{}={}", flag, value));
        self
    }

    /// Hand a duplicate of `fd` to the helper as `--<flag>=<number>`.
    ///
    /// `None` passes `-1`, which helpers treat as "no descriptor".
    pub fn fd_arg(&mut self, flag: &str, fd: Option<BorrowedFd<'_>>) -> CvdResult<&mut Self> {
        let number = match fd {
            Some(fd) => {
                let dup = fd.try_clone_to_owned().map_err(|e| {
                    CvdError::Storage(format!(
                        "Failed to duplicate descriptor for {} --{}: {}",
                        self.role, flag, e
                    ))
                })?;
                let number = dup.as_raw_fd();
                self.handed.push(dup);
                number
            }
            None => INVALID_FD,
        };
        Ok(self.arg(flag, number))
    }

    pub fn role(&self) -> HelperRole {
        self.role
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Descriptor numbers the helper will inherit.
    pub fn handed_fds(&self) -> Vec<RawFd> {
        self.handed.iter().map(|fd| fd.as_raw_fd()).collect()
    }

    /// Value of `--<flag>=` if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let prefix = format!("--{}=", flag);
        self.args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
    }
}

/// Starts helpers. The launcher is generic over this so bring-up can be
/// exercised without real binaries.
pub trait Spawner {
    /// Spawn `command`, returning the helper's pid.
    ///
    /// The command's descriptors are closed in this process before returning,
    /// whether or not the spawn succeeded.
    fn spawn(&mut self, command: HelperCommand) -> CvdResult<u32>;
}

/// Spawns real processes and tracks them in a [`ProcessTable`].
#[derive(Default)]
pub struct ProcessSpawner {
    table: ProcessTable,
}

impl ProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn into_table(self) -> ProcessTable {
        self.table
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&mut self, command: HelperCommand) -> CvdResult<u32> {
        let HelperCommand {
            role,
            program,
            args,
            handed,
        } = command;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        pre_exec::add_handoff_hook(&mut cmd, handed.iter().map(|fd| fd.as_raw_fd()).collect());

        let result = cmd.spawn();
        drop(handed);

        let child = result.map_err(|e| {
            let err_msg = format!("Failed to spawn {} at {}: {}", role, program.display(), e);
            tracing::error!("{}", err_msg);
            CvdError::Spawn(err_msg)
        })?;
        let pid = self.table.insert(role, child);
        tracing::info!(pid, %role, args = ?args, "Started helper");
        Ok(pid)
    }
}
