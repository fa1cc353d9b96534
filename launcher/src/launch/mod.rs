//! Launcher sequencer.
//!
//! Orders every bring-up stage and turns the first failure into a
//! [`LaunchFailure`], which `main` maps to the process exit code. No stage
//! exits the process itself.
//!
//! ```text
//! prepare:  validate host -> instance dir -> clean prior files -> boot images
//!           -> env file -> save config + global link
//! detach:   control socket -> daemonize | own process group
//! bring_up: kernel log monitor -> usb server -> shared memory + ivserver
//!           -> VM start -> socket forward proxy -> adb connector -> vnc server
//! serve:    control loop until a Stop succeeds
//! ```

mod boot_image;
mod helpers;

pub use boot_image::verify_boot_images;
pub use helpers::bind_helper_socket;

use crate::config::{InstanceConfig, LaunchArgs};
use crate::control::{ControlServer, InstanceTeardown};
use crate::monitor::{BootOutcome, DaemonFork, daemonize, ensure_own_process_group};
use crate::spawn::{ProcessSpawner, Spawner};
use crate::vmm::{HostCapabilities, VmManager, create_vm_manager, select_vmm_kind};
use cvd_shared::CvdError;
use std::os::fd::{AsFd, BorrowedFd};
use thiserror::Error;

/// How a launcher process ends successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A control client stopped the instance.
    Stopped,
    /// Daemon mode: the guest reported a completed boot.
    BootCompleted,
}

/// First failed stage of a launch.
#[derive(Debug, Error)]
pub enum LaunchFailure {
    #[error("failed to parse arguments: {0}")]
    ArgumentParsing(String),

    #[error("invalid host configuration: {0}")]
    InvalidHostConfiguration(#[source] CvdError),

    #[error("failed to initialize configuration: {0}")]
    ConfigInit(#[source] CvdError),

    #[error("failed to create instance directory: {0}")]
    InstanceDirCreation(#[source] CvdError),

    #[error("failed to clean prior files: {0}")]
    PriorFilesCleanup(#[source] CvdError),

    #[error("failed to prepare boot image: {0}")]
    BootImageUnpack(#[source] CvdError),

    #[error("failed to save configuration: {0}")]
    ConfigSave(#[source] CvdError),

    #[error("failed to daemonize: {0}")]
    Daemonization(#[source] CvdError),

    #[error("failed to start the virtual machine: {0}")]
    VmCreation(#[source] CvdError),

    #[error("boot event pipe failed: {0}")]
    PipeIo(#[source] CvdError),

    #[error("virtual device failed to boot")]
    VirtualDeviceBootFailed,

    #[error("failed to set up process group: {0}")]
    ProcessGroup(#[source] CvdError),

    #[error("failed to create monitor: {0}")]
    MonitorCreationFailed(#[source] CvdError),

    #[error("control server exited unexpectedly: {0}")]
    ServerError(#[source] CvdError),

    #[error("failed to create usb v1 socket: {0}")]
    UsbV1Socket(#[source] CvdError),

    #[error("failed to spawn helper: {0}")]
    SubprocessSpawn(#[source] CvdError),

    #[error("failed to create shared memory: {0}")]
    SharedMemoryCreation(#[source] CvdError),
}

impl LaunchFailure {
    /// Process exit code for this failure. Success is 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchFailure::ArgumentParsing(_) => 1,
            LaunchFailure::InvalidHostConfiguration(_) => 2,
            LaunchFailure::ConfigInit(_) => 3,
            LaunchFailure::InstanceDirCreation(_) => 4,
            LaunchFailure::PriorFilesCleanup(_) => 5,
            LaunchFailure::BootImageUnpack(_) => 6,
            LaunchFailure::ConfigSave(_) => 7,
            LaunchFailure::Daemonization(_) => 8,
            LaunchFailure::VmCreation(_) => 9,
            LaunchFailure::PipeIo(_) => 10,
            LaunchFailure::VirtualDeviceBootFailed => 11,
            LaunchFailure::ProcessGroup(_) => 12,
            LaunchFailure::MonitorCreationFailed(_) => 13,
            LaunchFailure::ServerError(_) => 14,
            LaunchFailure::UsbV1Socket(_) => 15,
            LaunchFailure::SubprocessSpawn(_) => 16,
            LaunchFailure::SharedMemoryCreation(_) => 17,
        }
    }
}

/// Map the daemon parent's view of the boot to the launch result.
pub fn boot_result(outcome: Result<BootOutcome, CvdError>) -> Result<LaunchOutcome, LaunchFailure> {
    match outcome {
        Ok(BootOutcome::Completed) => Ok(LaunchOutcome::BootCompleted),
        Ok(BootOutcome::Failed) => Err(LaunchFailure::VirtualDeviceBootFailed),
        Err(e) => Err(LaunchFailure::PipeIo(e)),
    }
}

/// Bring-up of one instance.
pub struct Launcher<S: Spawner> {
    config: InstanceConfig,
    vm: Box<dyn VmManager>,
    spawner: S,
    prepared: bool,
}

impl<S: Spawner> Launcher<S> {
    pub fn new(config: InstanceConfig, vm: Box<dyn VmManager>, spawner: S) -> Self {
        Self {
            config,
            vm,
            spawner,
            prepared: false,
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Everything that must succeed before any helper is spawned.
    pub fn prepare(&mut self) -> Result<(), LaunchFailure> {
        if let Err(e) = self.vm.validate_host_configuration() {
            print_remediation(&e);
            return Err(LaunchFailure::InvalidHostConfiguration(e));
        }
        self.vm
            .ensure_instance_dir_exists()
            .map_err(LaunchFailure::InstanceDirCreation)?;
        self.vm
            .clean_prior_files()
            .map_err(LaunchFailure::PriorFilesCleanup)?;
        verify_boot_images(&self.config).map_err(LaunchFailure::BootImageUnpack)?;

        if let Err(e) = self.config.write_env_file() {
            tracing::warn!("Unable to write cuttlefish environment file: {}", e);
        }
        self.config.save().map_err(LaunchFailure::ConfigSave)?;
        self.config
            .link_global_config()
            .map_err(LaunchFailure::ConfigSave)?;

        tracing::info!(
            "The following files contain useful debugging information:\n  \
             Launcher log: {}\n  Kernel log: {}\n  Instance configuration: {}\n  \
             Instance environment: {}",
            self.config.launcher_log_path().display(),
            self.config.kernel_log_path().display(),
            self.config.config_path().display(),
            self.config.env_file_path().display()
        );
        self.prepared = true;
        Ok(())
    }

    /// Spawn the helpers and start the VM, in dependency order.
    pub fn bring_up(&mut self, boot_events: Option<BorrowedFd<'_>>) -> Result<(), LaunchFailure> {
        if !self.prepared {
            return Err(LaunchFailure::VmCreation(CvdError::Internal(
                "bring-up requested before the host was validated".into(),
            )));
        }
        let config = &self.config;
        let spawner = &mut self.spawner;

        helpers::launch_kernel_log_monitor(config, spawner, boot_events)?;
        helpers::launch_usb_server_if_enabled(config, spawner)?;
        helpers::launch_ivserver(config, spawner)?;

        tracing::info!("Starting {} virtual machine", self.vm.kind());
        self.vm.start().map_err(LaunchFailure::VmCreation)?;

        helpers::launch_socket_forward_proxy_if_enabled(config, spawner)?;
        helpers::launch_adb_connector_if_enabled(config, spawner)?;
        helpers::launch_vnc_server_if_enabled(config, spawner)?;
        Ok(())
    }

    pub fn into_parts(self) -> (Box<dyn VmManager>, S) {
        (self.vm, self.spawner)
    }
}

fn print_remediation(err: &CvdError) {
    tracing::error!("{}", err);
    let commands = err.remediation();
    if commands.is_empty() {
        return;
    }
    eprintln!("Execute the following to correctly configure:");
    for command in commands {
        eprintln!("  {}", command);
    }
}

/// Run `launch_cvd` to completion.
///
/// Returns in the daemon's invoking process once the guest reports its boot
/// outcome, and in the launcher itself once a Stop succeeds.
pub fn run(args: &LaunchArgs) -> Result<LaunchOutcome, LaunchFailure> {
    let config = InstanceConfig::from_args(args).map_err(LaunchFailure::ConfigInit)?;
    let kind = select_vmm_kind(HostCapabilities::probe(&config), config.vm_manager.as_deref())
        .map_err(LaunchFailure::ConfigInit)?;
    tracing::info!(instance = %config.instance_name, vm_manager = %kind, "Launching instance");

    let vm = create_vm_manager(kind, &config);
    let mut launcher = Launcher::new(config, vm, ProcessSpawner::new());
    launcher.prepare()?;

    let server = ControlServer::bind(&launcher.config().launcher_monitor_path())
        .map_err(LaunchFailure::MonitorCreationFailed)?;

    // Held until the launcher exits so the kernel log monitor's subscriber
    // never sees the pipe close while the instance runs.
    let boot_events = if args.daemon {
        match daemonize(&launcher.config().launcher_log_path()).map_err(LaunchFailure::Daemonization)? {
            DaemonFork::Parent(outcome) => return boot_result(outcome),
            DaemonFork::Child(write_end) => Some(write_end),
        }
    } else {
        ensure_own_process_group().map_err(LaunchFailure::ProcessGroup)?;
        None
    };

    launcher.bring_up(boot_events.as_ref().map(|fd| fd.as_fd()))?;

    let (vm, spawner) = launcher.into_parts();
    let mut teardown = InstanceTeardown::new(vm, spawner.into_table());
    server
        .serve(&mut teardown)
        .map_err(LaunchFailure::ServerError)?;
    tracing::info!("Instance stopped");
    Ok(LaunchOutcome::Stopped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::spawn::HelperRole;
    use crate::spawn::tests::RecordingSpawner;
    use crate::vmm::VmmKind;
    use cvd_shared::CvdResult;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        log: Vec<&'static str>,
    }

    struct MockVm {
        calls: Rc<RefCell<Calls>>,
        fail: Option<&'static str>,
    }

    impl MockVm {
        fn record(&self, call: &'static str) -> CvdResult<()> {
            self.calls.borrow_mut().log.push(call);
            if self.fail == Some(call) {
                return Err(CvdError::HostValidation {
                    reason: format!("{} failed", call),
                    commands: vec!["sudo usermod -aG kvm $USER".into()],
                });
            }
            Ok(())
        }
    }

    impl VmManager for MockVm {
        fn kind(&self) -> VmmKind {
            VmmKind::QemuCli
        }
        fn validate_host_configuration(&self) -> CvdResult<()> {
            self.record("validate")
        }
        fn ensure_instance_dir_exists(&self) -> CvdResult<()> {
            self.record("ensure")
        }
        fn clean_prior_files(&self) -> CvdResult<()> {
            self.record("clean")
        }
        fn start(&mut self) -> CvdResult<()> {
            self.record("start")
        }
        fn stop(&mut self) -> CvdResult<()> {
            self.record("stop")
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        calls: Rc<RefCell<Calls>>,
        launcher: Launcher<RecordingSpawner>,
    }

    fn fixture(extra: &[&str], fail: Option<&'static str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), extra);
        std::fs::create_dir_all(&config.instance_dir).unwrap();
        std::fs::create_dir_all(&config.home_dir).unwrap();
        std::fs::create_dir_all(&config.host_artifacts_dir).unwrap();
        std::fs::write(&config.kernel_image_path, b"kernel").unwrap();
        std::fs::write(&config.ramdisk_image_path, b"ramdisk").unwrap();

        let calls = Rc::new(RefCell::new(Calls::default()));
        let vm = MockVm {
            calls: calls.clone(),
            fail,
        };
        Fixture {
            _dir: dir,
            calls,
            launcher: Launcher::new(config, Box::new(vm), RecordingSpawner::default()),
        }
    }

    impl Fixture {
        fn launch(&mut self) -> Result<(), LaunchFailure> {
            self.launcher.prepare()?;
            self.launcher.bring_up(None)
        }

        fn roles(&self) -> Vec<HelperRole> {
            self.launcher.spawner.roles()
        }
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let e = || CvdError::Internal(String::new());
        let failures = [
            LaunchFailure::ArgumentParsing(String::new()),
            LaunchFailure::InvalidHostConfiguration(e()),
            LaunchFailure::ConfigInit(e()),
            LaunchFailure::InstanceDirCreation(e()),
            LaunchFailure::PriorFilesCleanup(e()),
            LaunchFailure::BootImageUnpack(e()),
            LaunchFailure::ConfigSave(e()),
            LaunchFailure::Daemonization(e()),
            LaunchFailure::VmCreation(e()),
            LaunchFailure::PipeIo(e()),
            LaunchFailure::VirtualDeviceBootFailed,
            LaunchFailure::ProcessGroup(e()),
            LaunchFailure::MonitorCreationFailed(e()),
            LaunchFailure::ServerError(e()),
            LaunchFailure::UsbV1Socket(e()),
            LaunchFailure::SubprocessSpawn(e()),
            LaunchFailure::SharedMemoryCreation(e()),
        ];
        let mut codes: Vec<i32> = failures.iter().map(|f| f.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), failures.len());
    }

    #[test]
    fn test_boot_result_mapping() {
        assert_eq!(
            boot_result(Ok(BootOutcome::Completed)).unwrap(),
            LaunchOutcome::BootCompleted
        );
        assert_eq!(
            boot_result(Ok(BootOutcome::Failed)).unwrap_err().exit_code(),
            11
        );
        assert_eq!(
            boot_result(Err(CvdError::Protocol("short read".into())))
                .unwrap_err()
                .exit_code(),
            10
        );
    }

    #[test]
    fn test_usb_tunnel_vnc_spawns_every_helper() {
        let mut f = fixture(&["--adb-mode=usb,tunnel", "--start-vnc-server=true"], None);
        f.launch().unwrap();
        assert_eq!(
            f.roles(),
            vec![
                HelperRole::KernelLogMonitor,
                HelperRole::UsbServer,
                HelperRole::IvServer,
                HelperRole::SocketForwardProxy,
                HelperRole::AdbConnector,
                HelperRole::VncServer,
            ]
        );
        assert_eq!(
            f.calls.borrow().log,
            vec!["validate", "ensure", "clean", "start"]
        );
    }

    #[test]
    fn test_usb_only_without_vnc_spawns_no_network_helpers() {
        let mut f = fixture(&["--adb-mode=usb", "--start-vnc-server=false"], None);
        f.launch().unwrap();
        assert_eq!(
            f.roles(),
            vec![
                HelperRole::KernelLogMonitor,
                HelperRole::UsbServer,
                HelperRole::IvServer,
            ]
        );
    }

    #[test]
    fn test_invalid_host_spawns_nothing() {
        let mut f = fixture(&[], Some("validate"));
        let err = f.launch().unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(f.roles().is_empty());
        assert!(!f.launcher.config().mempath.exists());
        assert!(!f.launcher.config().config_path().exists());
        assert_eq!(f.calls.borrow().log, vec!["validate"]);
    }

    #[test]
    fn test_start_requires_instance_dir() {
        let mut f = fixture(&[], Some("ensure"));
        let err = f.launch().unwrap_err();
        assert!(matches!(err, LaunchFailure::InstanceDirCreation(_)));
        assert!(!f.calls.borrow().log.contains(&"start"));
        assert!(f.roles().is_empty());
    }

    #[test]
    fn test_bring_up_refused_before_prepare() {
        let mut f = fixture(&[], None);
        assert!(f.launcher.bring_up(None).is_err());
        assert!(f.calls.borrow().log.is_empty());
        assert!(f.roles().is_empty());
    }

    #[test]
    fn test_vm_start_failure_stops_before_network_helpers() {
        let mut f = fixture(&["--adb-mode=tunnel"], Some("start"));
        let err = f.launch().unwrap_err();
        assert_eq!(err.exit_code(), 9);
        assert_eq!(
            f.roles(),
            vec![HelperRole::KernelLogMonitor, HelperRole::IvServer]
        );
    }

    #[test]
    fn test_spawn_failure_aborts_sequence() {
        let mut f = fixture(&["--adb-mode=tunnel"], None);
        f.launcher.spawner.fail_role = Some(HelperRole::IvServer);
        let err = f.launch().unwrap_err();
        assert!(matches!(err, LaunchFailure::SubprocessSpawn(_)));
        assert_eq!(f.roles(), vec![HelperRole::KernelLogMonitor]);
        assert!(!f.calls.borrow().log.contains(&"start"));
    }

    #[test]
    fn test_missing_boot_image() {
        let mut f = fixture(&[], None);
        std::fs::remove_file(&f.launcher.config().kernel_image_path).unwrap();
        let err = f.launch().unwrap_err();
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_prepare_persists_config() {
        let mut f = fixture(&[], None);
        f.launcher.prepare().unwrap();
        let config = f.launcher.config();
        assert!(config.config_path().is_file());
        assert_eq!(
            std::fs::read_link(config.global_config_link()).unwrap(),
            config.config_path()
        );
        assert!(config.env_file_path().is_file());
    }
}
