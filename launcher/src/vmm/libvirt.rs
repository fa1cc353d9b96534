//! libvirt backend, for hosts without the qemu wrapper or KVM access.

use super::{VmManager, VmmKind, common, host_check};
use crate::config::InstanceConfig;
use cvd_shared::{CvdError, CvdResult};
use std::path::PathBuf;
use std::process::{Command, Stdio};

const REQUIRED_GROUPS: &[&str] = &["libvirt", "cvdnetwork"];
const LIBVIRT_URI: &str = "qemu:///system";
const DOMAIN_FILE: &str = "cuttlefish_domain.xml";

pub struct LibvirtManager {
    config: InstanceConfig,
}

impl LibvirtManager {
    pub fn new(config: InstanceConfig) -> Self {
        Self { config }
    }

    fn domain_path(&self) -> PathBuf {
        self.config.per_instance_path(DOMAIN_FILE)
    }

    /// Domain definition handed to `virsh create`.
    pub fn domain_xml(&self) -> String {
        let c = &self.config;
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <uuid>{uuid}</uuid>
  <memory unit='MiB'>{memory}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <kernel>{kernel}</kernel>
    <initrd>{ramdisk}</initrd>
    <cmdline>{cmdline}</cmdline>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw'/>
      <source file='{system}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <serial type='unix'>
      <source mode='connect' path='{kernel_log}'/>
      <target port='0'/>
    </serial>
    <serial type='file'>
      <source path='{console}'/>
      <target port='1'/>
    </serial>
    <interface type='ethernet'>
      <target dev='{wifi_tap}'/>
      <model type='virtio'/>
    </interface>
    <interface type='ethernet'>
      <target dev='{mobile_tap}'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>
"#,
            name = xml_escape(&c.instance_name),
            uuid = c.uuid,
            memory = c.memory_mb,
            cpus = c.cpus,
            kernel = xml_escape(&c.kernel_image_path.display().to_string()),
            ramdisk = xml_escape(&c.ramdisk_image_path.display().to_string()),
            cmdline = xml_escape(&c.kernel_args),
            system = xml_escape(&c.system_image_path.display().to_string()),
            kernel_log = xml_escape(&c.kernel_log_socket_path().display().to_string()),
            console = xml_escape(&c.console_path().display().to_string()),
            wifi_tap = xml_escape(&c.wifi_tap_name),
            mobile_tap = xml_escape(&c.mobile_tap_name),
        )
    }

    fn virsh(&self, args: &[&str]) -> CvdResult<()> {
        let output = Command::new("virsh")
            .arg("-c")
            .arg(LIBVIRT_URI)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CvdError::Engine(format!("Failed to run virsh: {}", e)))?;
        if !output.status.success() {
            return Err(CvdError::Engine(format!(
                "virsh {} failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
}

impl VmManager for LibvirtManager {
    fn kind(&self) -> VmmKind {
        VmmKind::Libvirt
    }

    fn validate_host_configuration(&self) -> CvdResult<()> {
        host_check::validate_groups(REQUIRED_GROUPS)
    }

    fn ensure_instance_dir_exists(&self) -> CvdResult<()> {
        common::ensure_instance_dir(&self.config.instance_dir)
    }

    fn clean_prior_files(&self) -> CvdResult<()> {
        common::clean_prior_files(&self.config)
    }

    fn start(&mut self) -> CvdResult<()> {
        let path = self.domain_path();
        std::fs::write(&path, self.domain_xml()).map_err(|e| {
            CvdError::Storage(format!("Failed to write {}: {}", path.display(), e))
        })?;
        let path = path.display().to_string();
        self.virsh(&["create", &path])?;
        tracing::info!("Created libvirt domain {}", self.config.instance_name);
        Ok(())
    }

    fn stop(&mut self) -> CvdResult<()> {
        self.virsh(&["destroy", &self.config.instance_name])
    }
}
