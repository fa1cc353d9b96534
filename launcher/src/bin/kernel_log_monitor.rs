//! `kernel_log_monitor`: record the guest kernel log and report boot
//! milestones to the launcher.
//!
//! The listening socket and the optional boot event pipe are inherited from
//! `launch_cvd` and passed by descriptor number.

use clap::Parser;
use cvd_launcher::InstanceConfig;
use cvd_launcher::monitor::KernelLogServer;
use cvd_launcher::spawn::INVALID_FD;
use cvd_shared::{CvdError, CvdResult};
use nix::fcntl::{FcntlArg, fcntl};
use std::fs::{File, OpenOptions};
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kernel_log_monitor", about = "Monitor the guest kernel log")]
struct Args {
    /// Instance configuration written by launch_cvd.
    #[arg(long = "config_file")]
    config_file: PathBuf,

    /// Inherited listening socket for the guest's kernel log stream.
    #[arg(long = "log_server_fd", allow_negative_numbers = true)]
    log_server_fd: RawFd,

    /// Inherited pipe that receives boot events, or -1.
    #[arg(long = "subscriber_fd", default_value_t = INVALID_FD, allow_negative_numbers = true)]
    subscriber_fd: RawFd,
}

/// Take ownership of an inherited descriptor after checking it is open.
fn adopt_fd(fd: RawFd, what: &str) -> CvdResult<OwnedFd> {
    if fd < 0 {
        return Err(CvdError::Config(format!("Invalid {} descriptor: {}", what, fd)));
    }
    // SAFETY: the borrow only lives for the F_GETFD probe.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    fcntl(borrowed, FcntlArg::F_GETFD).map_err(|e| {
        CvdError::Config(format!("{} descriptor {} is not open: {}", what, fd, e))
    })?;
    // SAFETY: the descriptor is open and was handed to this process
    // exclusively by the launcher.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn run(args: Args) -> CvdResult<()> {
    let listener = UnixListener::from(adopt_fd(args.log_server_fd, "log server")?);
    let subscriber = if args.subscriber_fd == INVALID_FD {
        None
    } else {
        Some(File::from(adopt_fd(args.subscriber_fd, "subscriber")?))
    };

    let config = InstanceConfig::load(&args.config_file)?;
    let log_path = config.kernel_log_path();
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| {
            CvdError::Storage(format!("Failed to open {}: {}", log_path.display(), e))
        })?;

    tracing::info!(
        instance = %config.instance_name,
        subscriber = subscriber.is_some(),
        "Kernel log monitor listening"
    );
    KernelLogServer::new(listener, log, subscriber).run()
}

fn main() {
    cvd_launcher::util::init_logging();
    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
