//! Cuttlefish launcher shared code.
//!
//! Types used on both ends of the launcher's IPC channels: the error
//! taxonomy, the control socket and boot-event wire formats, and the
//! well-known file names every helper agrees on.

pub mod constants;
pub mod errors;
pub mod protocol;

pub use errors::{CvdError, CvdResult};
pub use protocol::{BootEvent, LauncherAction, LauncherResponse};
