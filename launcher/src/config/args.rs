//! Command-line flags for `launch_cvd`.

use clap::Parser;
use std::path::PathBuf;

/// Launch a Cuttlefish virtual device.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "launch_cvd",
    author,
    version,
    about = "Launch a Cuttlefish virtual device",
    args_override_self = true
)]
pub struct LaunchArgs {
    /// Instance number. Defaults to the number in a `vsoc-NN` user name, or 1.
    #[arg(long, env = "CUTTLEFISH_INSTANCE")]
    pub instance_num: Option<u32>,

    /// Home directory holding the global config link and env file
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Runtime directory of this instance [default: ~/cuttlefish_runtime.<n>]
    #[arg(long)]
    pub instance_dir: Option<PathBuf>,

    /// Directory with host binaries (bin/cf_qemu.sh, bin/ivserver, ...)
    #[arg(long, env = "ANDROID_HOST_OUT")]
    pub host_artifacts: Option<PathBuf>,

    /// Detach from the terminal and exit once the guest reports its boot outcome
    #[arg(long)]
    pub daemon: bool,

    /// Force a VM backend: qemu_cli or libvirt
    #[arg(long)]
    pub vm_manager: Option<String>,

    #[arg(long, default_value_t = 720)]
    pub x_res: u32,

    #[arg(long, default_value_t = 1280)]
    pub y_res: u32,

    #[arg(long, default_value_t = 160)]
    pub dpi: u32,

    #[arg(long, default_value_t = 60)]
    pub refresh_rate_hz: u32,

    /// Number of frame buffers in the screen region
    #[arg(long, default_value_t = 3)]
    pub num_screen_buffers: u32,

    #[arg(long, default_value_t = 2)]
    pub cpus: u32,

    #[arg(long, default_value_t = 2048)]
    pub memory_mb: u32,

    /// Comma separated adb modes: tunnel, usb
    #[arg(long, default_value = "tunnel")]
    pub adb_mode: String,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub run_adb_connector: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_vnc_server: bool,

    /// Kernel image [default: <host_artifacts>/kernel]
    #[arg(long)]
    pub kernel_path: Option<PathBuf>,

    /// Ramdisk image [default: <host_artifacts>/ramdisk.img]
    #[arg(long)]
    pub ramdisk_path: Option<PathBuf>,

    #[arg(long)]
    pub system_image_path: Option<PathBuf>,

    /// Extra arguments appended to the kernel command line
    #[arg(long, default_value = "")]
    pub extra_kernel_args: String,

    /// Shared memory backing file [default: /var/run/shm/cvd-<n>]
    #[arg(long)]
    pub mempath: Option<PathBuf>,

    #[arg(long, default_value = "/usr/bin/qemu-system-x86_64")]
    pub qemu_binary: PathBuf,
}

/// Parse the instance number out of a `vsoc-NN` user name.
pub(crate) fn instance_from_user(user: &str) -> Option<u32> {
    user.strip_prefix("vsoc-")?.parse().ok()
}
