//! Boot image checks.

use crate::config::InstanceConfig;
use cvd_shared::{CvdError, CvdResult};
use std::path::Path;

/// Verify the kernel and ramdisk named by the configuration are present.
pub fn verify_boot_images(config: &InstanceConfig) -> CvdResult<()> {
    for (what, path) in [
        ("kernel", &config.kernel_image_path),
        ("ramdisk", &config.ramdisk_image_path),
    ] {
        check_image(what, path)?;
    }
    Ok(())
}

fn check_image(what: &str, path: &Path) -> CvdResult<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(CvdError::Config(format!(
            "{} image {} is not a regular file",
            what,
            path.display()
        ))),
        Err(e) => Err(CvdError::Config(format!(
            "{} image {} unavailable: {}",
            what,
            path.display(),
            e
        ))),
    }
}
