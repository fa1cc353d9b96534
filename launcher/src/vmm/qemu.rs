//! qemu backend driven through the `cf_qemu.sh` wrapper.
//!
//! The wrapper builds the qemu command line from environment variables.
//! Stop goes through the QMP monitor socket.

use super::{VmManager, VmmKind, common, host_check};
use crate::config::InstanceConfig;
use crate::spawn::pre_exec::add_handoff_hook;
use crate::util::wait_timeout;
use cvd_shared::{CvdError, CvdResult};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Wrapper script under `<host_artifacts>/bin`.
pub const QEMU_WRAPPER: &str = "cf_qemu.sh";

const REQUIRED_GROUPS: &[&str] = &["kvm", "cvdnetwork"];
const QMP_QUIT: &[u8] = br#"{"execute":"qmp_capabilities"}{"execute":"quit"}"#;
const MONITOR_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct QemuManager {
    config: InstanceConfig,
    child: Option<Child>,
}

impl QemuManager {
    pub fn new(config: InstanceConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    /// Environment `cf_qemu.sh` reads its settings from.
    pub fn wrapper_env(&self) -> Vec<(&'static str, String)> {
        let c = &self.config;
        vec![
            ("qemu_binary", c.qemu_binary.display().to_string()),
            ("instance_name", c.instance_name.clone()),
            ("memory_mb", c.memory_mb.to_string()),
            ("cpus", c.cpus.to_string()),
            ("uuid", c.uuid.clone()),
            ("monitor_path", c.qemu_monitor_path().display().to_string()),
            ("kernel_image_path", c.kernel_image_path.display().to_string()),
            ("ramdisk_image_path", c.ramdisk_image_path.display().to_string()),
            ("kernel_args", c.kernel_args.clone()),
            ("system_image_path", c.system_image_path.display().to_string()),
            ("wifi_tap_name", c.wifi_tap_name.clone()),
            ("mobile_tap_name", c.mobile_tap_name.clone()),
            ("kernel_log_socket_name", c.kernel_log_socket_path().display().to_string()),
            ("console_path", c.console_path().display().to_string()),
            ("logcat_path", c.logcat_path().display().to_string()),
            (
                "ivshmem_qemu_socket_path",
                c.ivshmem_qemu_socket_path().display().to_string(),
            ),
            (
                "ivshmem_vector_count",
                crate::shm::INSTANCE_REGION_COUNT.to_string(),
            ),
            ("usb_v1_socket_name", c.usb_v1_socket_path().display().to_string()),
        ]
    }

    fn send_quit(&self) -> CvdResult<()> {
        let path = self.config.qemu_monitor_path();
        let mut stream = UnixStream::connect(&path).map_err(|e| {
            CvdError::Engine(format!(
                "Error connecting to qemu monitor {}: {}",
                path.display(),
                e
            ))
        })?;
        stream.set_read_timeout(Some(MONITOR_TIMEOUT))?;
        stream
            .write_all(QMP_QUIT)
            .map_err(|e| CvdError::Engine(format!("Error writing to qemu monitor: {}", e)))?;

        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => tracing::info!("From qemu monitor: {}", String::from_utf8_lossy(&buf[..n])),
                Err(e) => {
                    tracing::debug!("qemu monitor read ended: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl VmManager for QemuManager {
    fn kind(&self) -> VmmKind {
        VmmKind::QemuCli
    }

    fn validate_host_configuration(&self) -> CvdResult<()> {
        let mut commands = host_check::missing_group_commands(REQUIRED_GROUPS, host_check::user_in_group);
        let mut reason = Vec::new();
        if !commands.is_empty() {
            reason.push(format!("user must be a member of: {}", REQUIRED_GROUPS.join(", ")));
        }
        if let Err(kvm) = host_check::check_kvm() {
            reason.push(kvm);
            commands.push("# Load the kvm module for your CPU:".to_string());
            commands.push("sudo modprobe kvm_intel || sudo modprobe kvm_amd".to_string());
        }
        if commands.is_empty() {
            return Ok(());
        }
        Err(CvdError::HostValidation {
            reason: reason.join("; "),
            commands,
        })
    }

    fn ensure_instance_dir_exists(&self) -> CvdResult<()> {
        common::ensure_instance_dir(&self.config.instance_dir)
    }

    fn clean_prior_files(&self) -> CvdResult<()> {
        common::clean_prior_files(&self.config)
    }

    fn start(&mut self) -> CvdResult<()> {
        if self.child.is_some() {
            return Err(CvdError::Engine("qemu is already running".into()));
        }
        let wrapper = self.config.host_binary(QEMU_WRAPPER);
        let mut cmd = Command::new(&wrapper);
        for (key, value) in self.wrapper_env() {
            tracing::info!("{}={}", key, value);
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        add_handoff_hook(&mut cmd, Vec::new());

        let child = cmd.spawn().map_err(|e| {
            CvdError::Engine(format!("Failed to start {}: {}", wrapper.display(), e))
        })?;
        tracing::info!(pid = child.id(), "Started qemu");
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> CvdResult<()> {
        let quit = self.send_quit();
        if let Some(mut child) = self.child.take() {
            match wait_timeout(&mut child, EXIT_TIMEOUT)? {
                Some(status) => tracing::info!(%status, "qemu exited"),
                None => {
                    tracing::warn!("qemu did not exit after quit, killing");
                    child.kill()?;
                    child.wait()?;
                }
            }
        }
        quit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_wrapper_env_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = QemuManager::new(test_config(dir.path(), &["--memory-mb=4096"]));
        let env = manager.wrapper_env();
        let get = |k: &str| env.iter().find(|(key, _)| *key == k).map(|(_, v)| v.clone());

        assert_eq!(get("memory_mb").as_deref(), Some("4096"));
        assert_eq!(get("instance_name").as_deref(), Some("cvd-01"));
        assert!(get("monitor_path").unwrap().ends_with("qemu_monitor.sock"));
        assert!(get("ivshmem_qemu_socket_path").unwrap().ends_with("ivshmem_socket_qemu"));
        assert_eq!(env.len(), 18);
    }

    #[test]
    fn test_start_without_wrapper_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = QemuManager::new(test_config(dir.path(), &[]));
        assert!(matches!(manager.start(), Err(CvdError::Engine(_))));
    }

    #[test]
    fn test_stop_sends_qmp_quit() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &[]);
        std::fs::create_dir_all(&config.instance_dir).unwrap();
        let listener = UnixListener::bind(config.qemu_monitor_path()).unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut got = vec![0u8; QMP_QUIT.len()];
            conn.read_exact(&mut got).unwrap();
            conn.write_all(br#"{"return": {}}"#).unwrap();
            got
        });

        let mut manager = QemuManager::new(config);
        manager.stop().unwrap();
        assert_eq!(server.join().unwrap(), QMP_QUIT);
    }

    #[test]
    fn test_stop_without_monitor_is_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = QemuManager::new(test_config(dir.path(), &[]));
        assert!(matches!(manager.stop(), Err(CvdError::Engine(_))));
    }

    #[test]
    fn test_start_and_stop_reaps_wrapper() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &[]);
        let wrapper = config.host_binary(QEMU_WRAPPER);
        std::fs::create_dir_all(wrapper.parent().unwrap()).unwrap();
        std::fs::write(&wrapper, "#!/bin/sh\ntest -n \"$uuid\" || exit 3\nexec sleep 1\n").unwrap();
        std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut manager = QemuManager::new(config);
        manager.start().unwrap();
        assert!(manager.start().is_err());
        // no monitor socket: quit fails, but the child is still reaped
        assert!(manager.stop().is_err());
        assert!(manager.child.is_none());
    }
}
