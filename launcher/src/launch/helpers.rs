//! One launch step per helper, in bring-up order.
//!
//! Each step owns the descriptors it creates; they are dropped when the
//! step returns, right after the helper inherited its duplicates.

use super::LaunchFailure;
use crate::config::InstanceConfig;
use crate::shm::SharedMemoryLayout;
use crate::spawn::{HelperCommand, HelperRole, Spawner};
use cvd_shared::constants::ports;
use cvd_shared::{CvdError, CvdResult};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixListener;
use std::path::Path;

/// Bind a listening socket for a helper, replacing a stale socket file.
pub fn bind_helper_socket(path: &Path) -> CvdResult<UnixListener> {
    if path.symlink_metadata().is_ok() {
        std::fs::remove_file(path).map_err(|e| {
            CvdError::Storage(format!("Failed to remove stale {}: {}", path.display(), e))
        })?;
    }
    UnixListener::bind(path)
        .map_err(|e| CvdError::Storage(format!("Failed to bind {}: {}", path.display(), e)))
}

fn helper(config: &InstanceConfig, role: HelperRole) -> HelperCommand {
    let mut cmd = HelperCommand::new(role, config.host_binary(role.binary_name()));
    cmd.arg("config_file", config.config_path().display());
    cmd
}

fn spawn<S: Spawner>(spawner: &mut S, cmd: HelperCommand) -> Result<u32, LaunchFailure> {
    spawner.spawn(cmd).map_err(LaunchFailure::SubprocessSpawn)
}

/// Start the kernel log monitor.
///
/// `boot_events` is the daemon pipe's write end; without it the monitor
/// gets `-1` and reports events to nobody.
pub fn launch_kernel_log_monitor<S: Spawner>(
    config: &InstanceConfig,
    spawner: &mut S,
    boot_events: Option<BorrowedFd<'_>>,
) -> Result<u32, LaunchFailure> {
    let listener = bind_helper_socket(&config.kernel_log_socket_path())
        .map_err(LaunchFailure::MonitorCreationFailed)?;

    let mut cmd = helper(config, HelperRole::KernelLogMonitor);
    cmd.fd_arg("log_server_fd", Some(listener.as_fd()))
        .and_then(|cmd| cmd.fd_arg("subscriber_fd", boot_events))
        .map_err(LaunchFailure::MonitorCreationFailed)?;
    spawn(spawner, cmd)
}

/// Start the usb server when adb runs over virtual usb.
pub fn launch_usb_server_if_enabled<S: Spawner>(
    config: &InstanceConfig,
    spawner: &mut S,
) -> Result<Option<u32>, LaunchFailure> {
    if !config.adb_mode.usb {
        return Ok(None);
    }
    let listener =
        bind_helper_socket(&config.usb_v1_socket_path()).map_err(LaunchFailure::UsbV1Socket)?;

    let mut cmd = helper(config, HelperRole::UsbServer);
    cmd.fd_arg("usb_v1_fd", Some(listener.as_fd()))
        .map_err(LaunchFailure::UsbV1Socket)?;
    spawn(spawner, cmd).map(Some)
}

/// Create the shared memory file and start the shared memory server.
pub fn launch_ivserver<S: Spawner>(
    config: &InstanceConfig,
    spawner: &mut S,
) -> Result<u32, LaunchFailure> {
    let layout =
        SharedMemoryLayout::for_config(config).map_err(LaunchFailure::SharedMemoryCreation)?;
    layout
        .create_backing_file(&config.mempath)
        .map_err(LaunchFailure::SharedMemoryCreation)?;

    let qemu_socket = bind_helper_socket(&config.ivshmem_qemu_socket_path())
        .map_err(LaunchFailure::SharedMemoryCreation)?;
    let client_socket = bind_helper_socket(&config.ivshmem_client_socket_path())
        .map_err(LaunchFailure::SharedMemoryCreation)?;

    let mut cmd = helper(config, HelperRole::IvServer);
    cmd.arg("mempath", config.mempath.display())
        .arg("vector_count", layout.vector_count());
    cmd.fd_arg("qemu_socket_fd", Some(qemu_socket.as_fd()))
        .and_then(|cmd| cmd.fd_arg("client_socket_fd", Some(client_socket.as_fd())))
        .map_err(LaunchFailure::SharedMemoryCreation)?;
    spawn(spawner, cmd)
}

/// Forward the guest's adb port to the host when tunnelling.
pub fn launch_socket_forward_proxy_if_enabled<S: Spawner>(
    config: &InstanceConfig,
    spawner: &mut S,
) -> Result<Option<u32>, LaunchFailure> {
    if !config.adb_mode.tunnel {
        return Ok(None);
    }
    let mut cmd = helper(config, HelperRole::SocketForwardProxy);
    cmd.arg("guest_ports", ports::GUEST_ADB)
        .arg("host_ports", config.host_adb_port);
    spawn(spawner, cmd).map(Some)
}

/// Keep the host adb server connected to the tunnelled port.
pub fn launch_adb_connector_if_enabled<S: Spawner>(
    config: &InstanceConfig,
    spawner: &mut S,
) -> Result<Option<u32>, LaunchFailure> {
    if !(config.run_adb_connector && config.adb_mode.tunnel) {
        return Ok(None);
    }
    let mut cmd = helper(config, HelperRole::AdbConnector);
    cmd.arg("ports", config.host_adb_port);
    spawn(spawner, cmd).map(Some)
}

pub fn launch_vnc_server_if_enabled<S: Spawner>(
    config: &InstanceConfig,
    spawner: &mut S,
) -> Result<Option<u32>, LaunchFailure> {
    if !config.start_vnc_server {
        return Ok(None);
    }
    let mut cmd = helper(config, HelperRole::VncServer);
    cmd.arg("port", config.vnc_port);
    spawn(spawner, cmd).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::spawn::tests::RecordingSpawner;

    fn instance(extra: &[&str]) -> (tempfile::TempDir, InstanceConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), extra);
        std::fs::create_dir_all(&config.instance_dir).unwrap();
        (dir, config)
    }

    #[test]
    fn test_kernel_log_monitor_without_subscriber() {
        let (_dir, config) = instance(&[]);
        let mut spawner = RecordingSpawner::default();
        launch_kernel_log_monitor(&config, &mut spawner, None).unwrap();

        let cmd = spawner.command(HelperRole::KernelLogMonitor).unwrap();
        assert_eq!(cmd.flag_value("subscriber_fd"), Some("-1"));
        assert_eq!(cmd.handed_fds().len(), 1);
        assert_eq!(
            cmd.flag_value("config_file"),
            Some(config.config_path().display().to_string().as_str())
        );
        assert!(config.kernel_log_socket_path().exists());
    }

    #[test]
    fn test_kernel_log_monitor_with_subscriber() {
        let (_dir, config) = instance(&[]);
        let (_read, write) = nix::unistd::pipe().unwrap();
        let mut spawner = RecordingSpawner::default();
        launch_kernel_log_monitor(&config, &mut spawner, Some(write.as_fd())).unwrap();

        let cmd = spawner.command(HelperRole::KernelLogMonitor).unwrap();
        assert_eq!(cmd.handed_fds().len(), 2);
        assert_ne!(cmd.flag_value("subscriber_fd"), Some("-1"));
    }

    #[test]
    fn test_ivserver_creates_memory_before_spawn() {
        let (_dir, config) = instance(&[]);
        let mut spawner = RecordingSpawner::default();
        launch_ivserver(&config, &mut spawner).unwrap();

        assert!(config.mempath.exists());
        let cmd = spawner.command(HelperRole::IvServer).unwrap();
        assert_eq!(cmd.handed_fds().len(), 2);
        assert_eq!(cmd.flag_value("vector_count"), Some("4"));
        assert!(cmd.flag_value("qemu_socket_fd").is_some());
        assert!(cmd.flag_value("client_socket_fd").is_some());
    }

    #[test]
    fn test_ivserver_existing_memory_file_fails() {
        let (_dir, config) = instance(&[]);
        std::fs::write(&config.mempath, b"leftover").unwrap();
        let mut spawner = RecordingSpawner::default();
        let err = launch_ivserver(&config, &mut spawner).unwrap_err();
        assert!(matches!(err, LaunchFailure::SharedMemoryCreation(_)));
        assert!(spawner.commands.is_empty());
    }

    #[test]
    fn test_usb_server_skipped_without_usb_mode() {
        let (_dir, config) = instance(&["--adb-mode=tunnel"]);
        let mut spawner = RecordingSpawner::default();
        assert_eq!(launch_usb_server_if_enabled(&config, &mut spawner).unwrap(), None);
        assert!(!config.usb_v1_socket_path().exists());
    }

    #[test]
    fn test_usb_socket_failure_maps_to_usb_exit() {
        let dir = tempfile::tempdir().unwrap();
        // instance dir never created, so bind fails
        let config = test_config(dir.path(), &["--adb-mode=usb"]);
        let mut spawner = RecordingSpawner::default();
        let err = launch_usb_server_if_enabled(&config, &mut spawner).unwrap_err();
        assert!(matches!(err, LaunchFailure::UsbV1Socket(_)));
    }

    #[test]
    fn test_network_helper_flags() {
        let (_dir, config) = instance(&["--instance-num=2"]);
        let mut spawner = RecordingSpawner::default();
        launch_socket_forward_proxy_if_enabled(&config, &mut spawner).unwrap();
        launch_adb_connector_if_enabled(&config, &mut spawner).unwrap();
        launch_vnc_server_if_enabled(&config, &mut spawner).unwrap();

        let proxy = spawner.command(HelperRole::SocketForwardProxy).unwrap();
        assert_eq!(proxy.flag_value("guest_ports"), Some("5555"));
        assert_eq!(proxy.flag_value("host_ports"), Some("6521"));
        let connector = spawner.command(HelperRole::AdbConnector).unwrap();
        assert_eq!(connector.flag_value("ports"), Some("6521"));
        let vnc = spawner.command(HelperRole::VncServer).unwrap();
        assert_eq!(vnc.flag_value("port"), Some("6445"));
    }

    #[test]
    fn test_adb_connector_needs_tunnel() {
        let (_dir, config) = instance(&["--adb-mode=usb"]);
        let mut spawner = RecordingSpawner::default();
        assert_eq!(launch_adb_connector_if_enabled(&config, &mut spawner).unwrap(), None);
    }
}
