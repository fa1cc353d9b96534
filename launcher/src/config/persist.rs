//! Persisting the instance configuration for helper processes.

use super::InstanceConfig;
use cvd_shared::constants::{env, home};
use cvd_shared::{CvdError, CvdResult};
use std::path::Path;

impl InstanceConfig {
    /// Write the configuration to its per-instance file.
    pub fn save(&self) -> CvdResult<()> {
        let path = self.config_path();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| {
            CvdError::Storage(format!("Failed to write config {}: {}", path.display(), e))
        })?;
        tracing::debug!("Saved instance config to {}", path.display());
        Ok(())
    }

    /// Read a configuration written by [`InstanceConfig::save`].
    pub fn load(path: &Path) -> CvdResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CvdError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CvdError::Config(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Load the active instance through the global link in `home_dir`.
    pub fn load_global(home_dir: &Path) -> CvdResult<Self> {
        Self::load(&home_dir.join(home::GLOBAL_CONFIG_LINK))
    }

    /// Point the global config link at this instance's file.
    ///
    /// A stale link from an earlier instance is replaced.
    pub fn link_global_config(&self) -> CvdResult<()> {
        let link = self.global_config_link();
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link).map_err(|e| {
                CvdError::Storage(format!("Failed to remove {}: {}", link.display(), e))
            })?;
        }
        std::os::unix::fs::symlink(self.config_path(), &link).map_err(|e| {
            CvdError::Storage(format!(
                "Failed to link {} -> {}: {}",
                link.display(),
                self.config_path().display(),
                e
            ))
        })
    }

    /// Write the shell snippet exporting this instance's environment.
    pub fn write_env_file(&self) -> CvdResult<()> {
        let path = self.env_file_path();
        let content = format!(
            "export {}={}\nexport {}={}\n",
            env::PER_INSTANCE_PATH,
            self.instance_dir.display(),
            env::ANDROID_SERIAL,
            self.adb_serial()
        );
        std::fs::write(&path, content).map_err(|e| {
            CvdError::Storage(format!("Failed to write {}: {}", path.display(), e))
        })
    }
}
