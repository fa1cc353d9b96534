//! Host configuration checks shared by the VM backends.
//!
//! Failures come back as [`CvdError::HostValidation`] with literal shell
//! commands the user can paste to fix the host.

use cvd_shared::{CvdError, CvdResult};
use nix::unistd::{Gid, Group, getegid, getgroups};
use std::path::Path;

pub const KVM_DEVICE: &str = "/dev/kvm";

/// Whether the invoking user belongs to `group`.
///
/// Membership is taken from the process credentials, so a group added
/// since login does not count until the user logs in again.
pub fn user_in_group(group: &str) -> bool {
    let gid = match Group::from_name(group) {
        Ok(Some(g)) => g.gid,
        Ok(None) => {
            tracing::debug!("Group {} does not exist on this host", group);
            return false;
        }
        Err(e) => {
            tracing::warn!("Failed to look up group {}: {}", group, e);
            return false;
        }
    };
    process_has_gid(gid)
}

fn process_has_gid(gid: Gid) -> bool {
    if getegid() == gid {
        return true;
    }
    getgroups().map(|groups| groups.contains(&gid)).unwrap_or(false)
}

/// Remediation commands for every group in `groups` the user is missing.
///
/// Every group is checked, even after the first miss.
pub fn missing_group_commands<F>(groups: &[&str], is_member: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    let mut commands = Vec::new();
    for group in groups {
        if !is_member(group) {
            tracing::error!("User must be a member of {}", group);
            commands.push(format!("# Add your user to the {} group:", group));
            commands.push(format!("sudo usermod -aG {} $USER", group));
        }
    }
    commands
}

/// Check `/dev/kvm` exists and is usable by this user.
pub fn check_kvm() -> Result<(), String> {
    let kvm_path = Path::new(KVM_DEVICE);

    if !kvm_path.exists() {
        return Err(format!(
            "{} does not exist\n\n\
             Suggestions:\n\
             - Enable virtualization in your BIOS/UEFI settings (VT-x for Intel, AMD-V for AMD)\n\
             - Check if the kvm module is loaded: lsmod | grep kvm\n\
             - Try: sudo modprobe kvm_intel  # Intel\n\
                    sudo modprobe kvm_amd    # AMD",
            KVM_DEVICE
        ));
    }

    match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(kvm_path)
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(format!(
            "{} exists but access denied (permissions)\n\n\
             Suggestions:\n\
             - Log out and log back in after joining the kvm group\n\
             - Check permissions: ls -l {}",
            KVM_DEVICE, KVM_DEVICE
        )),
        Err(e) => Err(format!("{} exists but couldn't be accessed: {}", KVM_DEVICE, e)),
    }
}

/// Validate group membership for a backend.
pub fn validate_groups(groups: &[&str]) -> CvdResult<()> {
    let commands = missing_group_commands(groups, user_in_group);
    if commands.is_empty() {
        return Ok(());
    }
    Err(CvdError::HostValidation {
        reason: format!("user must be a member of: {}", groups.join(", ")),
        commands,
    })
}
