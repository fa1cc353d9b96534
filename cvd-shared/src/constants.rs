//! Shared constants between the launcher, its helpers and the CLI.
//!
//! Helpers locate their sockets and files by these names, so both sides
//! must agree on them.

/// File names inside an instance directory.
pub mod files {
    /// Persisted instance configuration, read by every helper.
    pub const CONFIG: &str = "cuttlefish_config.json";

    /// Launcher log (daemon mode redirects stdout/stderr here).
    pub const LAUNCHER_LOG: &str = "launcher.log";

    /// Control socket served by the launcher.
    pub const LAUNCHER_MONITOR_SOCKET: &str = "launcher_monitor.sock";

    /// Guest kernel log captured by the kernel log monitor.
    pub const KERNEL_LOG: &str = "kernel.log";

    /// Socket the VM connects its kernel console to.
    pub const KERNEL_LOG_SOCKET: &str = "kernel-log";

    /// Shared memory server socket for the VM.
    pub const IVSHMEM_QEMU_SOCKET: &str = "ivshmem_socket_qemu";

    /// Shared memory server socket for host clients.
    pub const IVSHMEM_CLIENT_SOCKET: &str = "ivshmem_socket_client";

    pub const USB_V1_SOCKET: &str = "usb-v1";

    /// QMP monitor of the qemu backend.
    pub const QEMU_MONITOR_SOCKET: &str = "qemu_monitor.sock";

    pub const CONSOLE: &str = "console";
    pub const LOGCAT: &str = "logcat";
}

/// Files in the user's home directory.
pub mod home {
    /// Symlink to the active instance's configuration.
    pub const GLOBAL_CONFIG_LINK: &str = ".cuttlefish_config.json";

    /// Shell snippet exporting the active instance's environment.
    pub const ENV_FILE: &str = ".cuttlefish.sh";
}

/// Network ports. Each instance adds `instance_num - 1`.
pub mod ports {
    pub const HOST_ADB_BASE: u16 = 6520;
    pub const VNC_BASE: u16 = 6444;
    pub const GUEST_ADB: u16 = 5555;
}

/// Environment variables.
pub mod env {
    pub const INSTANCE: &str = "CUTTLEFISH_INSTANCE";
    pub const PER_INSTANCE_PATH: &str = "CUTTLEFISH_PER_INSTANCE_PATH";
    pub const ANDROID_SERIAL: &str = "ANDROID_SERIAL";
    pub const HOST_OUT: &str = "ANDROID_HOST_OUT";
}
