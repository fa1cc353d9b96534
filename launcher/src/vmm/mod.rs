//! VM backend abstraction.
//!
//! Exactly one backend is selected per instance, by a pure function of the
//! host capability probe and an optional override, and never changes.

pub mod common;
pub mod host_check;
pub mod libvirt;
pub mod qemu;

use crate::config::InstanceConfig;
use cvd_shared::{CvdError, CvdResult};
use std::path::Path;
use std::str::FromStr;

pub use libvirt::LibvirtManager;
pub use qemu::QemuManager;

/// Contract every VM backend implements.
///
/// Any method returning an error aborts the launch with a stage-specific
/// exit code.
pub trait VmManager {
    fn kind(&self) -> VmmKind;

    /// Check the host can run this backend.
    ///
    /// Failures are [`CvdError::HostValidation`] carrying remediation commands.
    fn validate_host_configuration(&self) -> CvdResult<()>;

    fn ensure_instance_dir_exists(&self) -> CvdResult<()>;

    /// Remove run files left behind by a previous launch.
    fn clean_prior_files(&self) -> CvdResult<()>;

    /// Start the virtual machine. Returns once the backend process exists.
    fn start(&mut self) -> CvdResult<()>;

    /// Ask the virtual machine to shut down and reap it.
    fn stop(&mut self) -> CvdResult<()>;
}

/// Available VM backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum VmmKind {
    /// qemu driven directly through `cf_qemu.sh`, requires KVM.
    QemuCli,
    /// Generic virtualization through libvirt.
    Libvirt,
}

impl VmmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmmKind::QemuCli => "qemu_cli",
            VmmKind::Libvirt => "libvirt",
        }
    }
}

impl std::fmt::Display for VmmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmmKind {
    type Err = CvdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qemu_cli" => Ok(VmmKind::QemuCli),
            "libvirt" => Ok(VmmKind::Libvirt),
            _ => Err(CvdError::Config(format!(
                "Unknown VM manager: '{}'. Supported: qemu_cli, libvirt",
                s
            ))),
        }
    }
}

/// Static facts about the host used to pick a backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    /// `/dev/kvm` is present.
    pub kvm: bool,
    /// The host package ships the `cf_qemu.sh` wrapper.
    pub qemu_cli: bool,
}

impl HostCapabilities {
    pub fn probe(config: &InstanceConfig) -> Self {
        let caps = Self {
            kvm: Path::new(host_check::KVM_DEVICE).exists(),
            qemu_cli: config.host_binary(qemu::QEMU_WRAPPER).is_file(),
        };
        tracing::debug!(?caps, "Probed host capabilities");
        caps
    }
}

/// Pick the backend for this instance.
///
/// An explicit override always wins; an unknown override name is a
/// configuration error.
pub fn select_vmm_kind(caps: HostCapabilities, override_name: Option<&str>) -> CvdResult<VmmKind> {
    if let Some(name) = override_name {
        return name.parse();
    }
    if caps.kvm && caps.qemu_cli {
        Ok(VmmKind::QemuCli)
    } else {
        Ok(VmmKind::Libvirt)
    }
}

/// Construct the backend for `kind`.
pub fn create_vm_manager(kind: VmmKind, config: &InstanceConfig) -> Box<dyn VmManager> {
    match kind {
        VmmKind::QemuCli => Box::new(QemuManager::new(config.clone())),
        VmmKind::Libvirt => Box::new(LibvirtManager::new(config.clone())),
    }
}
