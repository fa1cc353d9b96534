//! Host-side bring-up of a Cuttlefish virtual device.
//!
//! `launch_cvd` validates the host, prepares the instance directory and
//! shared memory, spawns the helper daemons with their listening sockets
//! already bound, starts the VM, and then serves the control socket until a
//! client asks it to stop.
//!
//! The crate is single-threaded: daemon mode forks, and helpers inherit
//! descriptors across `exec`.

pub mod config;
pub mod control;
pub mod launch;
pub mod monitor;
pub mod shm;
pub mod spawn;
pub mod util;
pub mod vmm;

pub use config::{InstanceConfig, LaunchArgs};
pub use launch::{LaunchFailure, LaunchOutcome, Launcher, run};
pub use vmm::{VmManager, VmmKind};
