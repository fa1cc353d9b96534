//! Instance configuration.
//!
//! [`InstanceConfig`] is built once from [`LaunchArgs`], never mutated, and
//! handed to helpers only through its serialized file.

mod args;
mod persist;

pub use args::LaunchArgs;

use cvd_shared::constants::{files, home, ports};
use cvd_shared::{CvdError, CvdResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_KERNEL_ARGS: &str = "console=ttyS0 androidboot.console=ttyS1 androidboot.hardware=cutf_ivsh";

/// How adb reaches the guest. Any combination may be enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdbMode {
    /// Forward the guest's adb port through `socket_forward_proxy`.
    pub tunnel: bool,
    /// Expose adb as a virtual usb device through the usb server.
    pub usb: bool,
}

impl FromStr for AdbMode {
    type Err = CvdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mode = AdbMode::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry {
                "tunnel" => mode.tunnel = true,
                "usb" => mode.usb = true,
                other => tracing::warn!("Ignoring unknown adb mode '{}'", other),
            }
        }
        Ok(mode)
    }
}

/// Per-instance settings derived at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_num: u32,
    pub instance_name: String,
    pub instance_dir: PathBuf,
    pub home_dir: PathBuf,
    pub host_artifacts_dir: PathBuf,
    pub vm_manager: Option<String>,
    pub uuid: String,

    pub x_res: u32,
    pub y_res: u32,
    pub dpi: u32,
    pub refresh_rate_hz: u32,
    pub num_screen_buffers: u32,

    pub cpus: u32,
    pub memory_mb: u32,

    pub adb_mode: AdbMode,
    pub run_adb_connector: bool,
    pub start_vnc_server: bool,
    pub host_adb_port: u16,
    pub vnc_port: u16,

    pub wifi_tap_name: String,
    pub mobile_tap_name: String,

    pub kernel_image_path: PathBuf,
    pub ramdisk_image_path: PathBuf,
    pub system_image_path: PathBuf,
    pub kernel_args: String,

    pub mempath: PathBuf,
    pub qemu_binary: PathBuf,
}

impl InstanceConfig {
    /// Derive the configuration of one instance from the command line.
    pub fn from_args(args: &LaunchArgs) -> CvdResult<Self> {
        let instance_num = args.instance_num.unwrap_or_else(default_instance_num);
        if instance_num == 0 {
            return Err(CvdError::Config("Instance number must be at least 1".into()));
        }
        if args.x_res == 0 || args.y_res == 0 {
            return Err(CvdError::Config(format!(
                "Invalid screen resolution {}x{}",
                args.x_res, args.y_res
            )));
        }
        if args.num_screen_buffers == 0 {
            return Err(CvdError::Config("At least one screen buffer is required".into()));
        }
        let offset = u16::try_from(instance_num - 1)
            .ok()
            .filter(|o| *o <= u16::MAX - ports::HOST_ADB_BASE)
            .ok_or_else(|| CvdError::Config(format!("Instance number {} is too large", instance_num)))?;

        let home_dir = match &args.home {
            Some(home) => home.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| CvdError::Config("Cannot determine home directory".into()))?,
        };
        let host_artifacts_dir = args
            .host_artifacts
            .clone()
            .unwrap_or_else(|| home_dir.join("host_out"));
        let instance_dir = args
            .instance_dir
            .clone()
            .unwrap_or_else(|| home_dir.join(format!("cuttlefish_runtime.{}", instance_num)));
        let mempath = args
            .mempath
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/var/run/shm/cvd-{}", instance_num)));

        let mut kernel_args = format!(
            "{} androidboot.serialno={} androidboot.lcd_density={}",
            DEFAULT_KERNEL_ARGS,
            serial_number(instance_num),
            args.dpi
        );
        if !args.extra_kernel_args.is_empty() {
            kernel_args.push(' ');
            kernel_args.push_str(&args.extra_kernel_args);
        }

        Ok(Self {
            instance_num,
            instance_name: format!("cvd-{:02}", instance_num),
            uuid: format!("699acfc4-c8c4-11e7-882b-5065f31dc1{:02}", instance_num),
            vm_manager: args.vm_manager.clone(),
            x_res: args.x_res,
            y_res: args.y_res,
            dpi: args.dpi,
            refresh_rate_hz: args.refresh_rate_hz,
            num_screen_buffers: args.num_screen_buffers,
            cpus: args.cpus,
            memory_mb: args.memory_mb,
            adb_mode: args.adb_mode.parse()?,
            run_adb_connector: args.run_adb_connector,
            start_vnc_server: args.start_vnc_server,
            host_adb_port: ports::HOST_ADB_BASE + offset,
            vnc_port: ports::VNC_BASE + offset,
            wifi_tap_name: format!("cvd-wtap-{:02}", instance_num),
            mobile_tap_name: format!("cvd-mtap-{:02}", instance_num),
            kernel_image_path: args
                .kernel_path
                .clone()
                .unwrap_or_else(|| host_artifacts_dir.join("kernel")),
            ramdisk_image_path: args
                .ramdisk_path
                .clone()
                .unwrap_or_else(|| host_artifacts_dir.join("ramdisk.img")),
            system_image_path: args
                .system_image_path
                .clone()
                .unwrap_or_else(|| host_artifacts_dir.join("system.img")),
            kernel_args,
            mempath,
            qemu_binary: args.qemu_binary.clone(),
            home_dir,
            host_artifacts_dir,
            instance_dir,
        })
    }

    /// Path of `name` inside the instance directory.
    pub fn per_instance_path(&self, name: &str) -> PathBuf {
        self.instance_dir.join(name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.per_instance_path(files::CONFIG)
    }

    pub fn launcher_log_path(&self) -> PathBuf {
        self.per_instance_path(files::LAUNCHER_LOG)
    }

    pub fn launcher_monitor_path(&self) -> PathBuf {
        self.per_instance_path(files::LAUNCHER_MONITOR_SOCKET)
    }

    pub fn kernel_log_path(&self) -> PathBuf {
        self.per_instance_path(files::KERNEL_LOG)
    }

    pub fn kernel_log_socket_path(&self) -> PathBuf {
        self.per_instance_path(files::KERNEL_LOG_SOCKET)
    }

    pub fn ivshmem_qemu_socket_path(&self) -> PathBuf {
        self.per_instance_path(files::IVSHMEM_QEMU_SOCKET)
    }

    pub fn ivshmem_client_socket_path(&self) -> PathBuf {
        self.per_instance_path(files::IVSHMEM_CLIENT_SOCKET)
    }

    pub fn usb_v1_socket_path(&self) -> PathBuf {
        self.per_instance_path(files::USB_V1_SOCKET)
    }

    pub fn qemu_monitor_path(&self) -> PathBuf {
        self.per_instance_path(files::QEMU_MONITOR_SOCKET)
    }

    pub fn console_path(&self) -> PathBuf {
        self.per_instance_path(files::CONSOLE)
    }

    pub fn logcat_path(&self) -> PathBuf {
        self.per_instance_path(files::LOGCAT)
    }

    pub fn global_config_link(&self) -> PathBuf {
        self.home_dir.join(home::GLOBAL_CONFIG_LINK)
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.home_dir.join(home::ENV_FILE)
    }

    /// Path of a host binary, e.g. `bin/ivserver`.
    pub fn host_binary(&self, name: &str) -> PathBuf {
        self.host_artifacts_dir.join("bin").join(name)
    }

    /// Serial adb clients use to reach the guest through the tunnel.
    /// Device serial as the host adb server sees it.
    ///
    /// Over virtual usb that is the guest's own serial number, otherwise the
    /// tunnelled TCP endpoint.
    pub fn adb_serial(&self) -> String {
        if self.adb_mode.usb {
            serial_number(self.instance_num)
        } else {
            format!("127.0.0.1:{}", self.host_adb_port)
        }
    }
}

fn serial_number(instance_num: u32) -> String {
    format!("CUTTLEFISHCVD{:02}", instance_num)
}

fn default_instance_num() -> u32 {
    std::env::var("USER")
        .ok()
        .as_deref()
        .and_then(args::instance_from_user)
        .unwrap_or(1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use clap::Parser;
    use std::path::Path;

    /// Build a config rooted in `dir` with extra flags.
    pub(crate) fn test_config(dir: &Path, extra: &[&str]) -> InstanceConfig {
        let home = dir.join("home");
        let instance = dir.join("instance");
        let artifacts = dir.join("artifacts");
        let mempath = dir.join("shm");
        let mut argv = vec![
            "launch_cvd".to_string(),
            "--instance-num=1".to_string(),
            format!("--home={}", home.display()),
            format!("--instance-dir={}", instance.display()),
            format!("--host-artifacts={}", artifacts.display()),
            format!("--mempath={}", mempath.display()),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        let args = LaunchArgs::try_parse_from(argv).unwrap();
        InstanceConfig::from_args(&args).unwrap()
    }

    #[test]
    fn test_adb_mode_parse() {
        let mode: AdbMode = "usb,tunnel".parse().unwrap();
        assert!(mode.usb && mode.tunnel);

        let mode: AdbMode = "usb".parse().unwrap();
        assert!(mode.usb && !mode.tunnel);

        let mode: AdbMode = " tunnel , bogus ".parse().unwrap();
        assert!(mode.tunnel && !mode.usb);

        assert_eq!("".parse::<AdbMode>().unwrap(), AdbMode::default());
    }

    #[test]
    fn test_derived_fields() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &["--instance-num=3"]);
        assert_eq!(config.instance_name, "cvd-03");
        assert_eq!(config.host_adb_port, 6522);
        assert_eq!(config.vnc_port, 6446);
        assert_eq!(config.adb_serial(), "127.0.0.1:6522");
        assert_eq!(config.wifi_tap_name, "cvd-wtap-03");
        assert!(config.uuid.ends_with("c103"));
        assert!(config.kernel_args.contains("androidboot.lcd_density=160"));
        assert!(config.kernel_args.contains("androidboot.serialno=CUTTLEFISHCVD03"));
    }

    #[test]
    fn test_adb_serial_follows_adb_mode() {
        let dir = tempfile::tempdir().unwrap();
        let usb = test_config(dir.path(), &["--instance-num=2", "--adb-mode=usb"]);
        assert_eq!(usb.adb_serial(), "CUTTLEFISHCVD02");

        let both = test_config(dir.path(), &["--instance-num=2", "--adb-mode=usb,tunnel"]);
        assert_eq!(both.adb_serial(), "CUTTLEFISHCVD02");

        let tunnel = test_config(dir.path(), &["--instance-num=2", "--adb-mode=tunnel"]);
        assert_eq!(tunnel.adb_serial(), "127.0.0.1:6521");
    }

    #[test]
    fn test_per_instance_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &[]);
        assert_eq!(
            config.config_path(),
            dir.path().join("instance/cuttlefish_config.json")
        );
        assert_eq!(
            config.launcher_monitor_path(),
            dir.path().join("instance/launcher_monitor.sock")
        );
        assert_eq!(
            config.host_binary("ivserver"),
            dir.path().join("artifacts/bin/ivserver")
        );
    }

    #[test]
    fn test_rejects_zero_buffers() {
        let args = LaunchArgs::try_parse_from([
            "launch_cvd",
            "--home=/tmp",
            "--num-screen-buffers=0",
        ])
        .unwrap();
        assert!(matches!(
            InstanceConfig::from_args(&args),
            Err(CvdError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_instance_zero() {
        let args =
            LaunchArgs::try_parse_from(["launch_cvd", "--home=/tmp", "--instance-num=0"]).unwrap();
        assert!(InstanceConfig::from_args(&args).is_err());
    }
}
