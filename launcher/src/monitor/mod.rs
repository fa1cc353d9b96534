//! Boot outcome reporting.
//!
//! The kernel log monitor helper turns guest log markers into
//! [`BootEvent`](cvd_shared::BootEvent) records; in daemon mode those records
//! travel over a pipe to the process that invoked the launcher.

pub mod boot;
pub mod daemon;
pub mod kernel_log;

pub use boot::{BootOutcome, monitor_boot_events, read_boot_event};
pub use daemon::{DaemonFork, daemonize, ensure_own_process_group};
pub use kernel_log::{BootMarkerScanner, KernelLogServer};
