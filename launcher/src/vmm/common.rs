//! Instance directory handling shared by both backends.

use crate::config::InstanceConfig;
use cvd_shared::{CvdError, CvdResult};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Create the instance directory if it does not exist yet.
pub fn ensure_instance_dir(dir: &Path) -> CvdResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    tracing::info!("Setting up {}", dir.display());
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o775)
        .create(dir)
        .map_err(|e| CvdError::Storage(format!("Unable to create {}: {}", dir.display(), e)))
}

/// Files a previous launch of this instance may have left behind.
pub fn prior_run_files(config: &InstanceConfig) -> CvdResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    if config.instance_dir.is_dir() {
        let entries = std::fs::read_dir(&config.instance_dir).map_err(|e| {
            CvdError::Storage(format!(
                "Failed to list {}: {}",
                config.instance_dir.display(),
                e
            ))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| CvdError::Storage(e.to_string()))?;
            files.push(entry.path());
        }
    }
    for path in [config.mempath.clone(), config.env_file_path()] {
        if path.symlink_metadata().is_ok() {
            files.push(path);
        }
    }
    Ok(files)
}

/// Remove run files from a previous launch.
///
/// Refuses to clean while any of them is held open by another process,
/// which usually means the instance is still running.
pub fn clean_prior_files(config: &InstanceConfig) -> CvdResult<()> {
    let files = prior_run_files(config)?;
    if files.is_empty() {
        return Ok(());
    }
    tracing::info!("Assuming run files of {:?}", files);

    if files_in_use(&files)? {
        return Err(CvdError::Storage(
            "Clean aborted: files are in use".to_string(),
        ));
    }

    for path in &files {
        let result = match path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
            Ok(_) => std::fs::remove_file(path),
            Err(_) => continue,
        };
        result.map_err(|e| {
            CvdError::Storage(format!("Failed to remove {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

/// Ask `fuser` whether any process has one of `files` open.
///
/// Hosts without `fuser` skip the check.
fn files_in_use(files: &[PathBuf]) -> CvdResult<bool> {
    let status = Command::new("fuser")
        .args(files)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        // fuser exits 0 when at least one file is open
        Ok(status) => Ok(status.success()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("fuser not found, skipping open file check");
            Ok(false)
        }
        Err(e) => Err(CvdError::Storage(format!("Failed to run fuser: {}", e))),
    }
}
