//! Control-plane server.
//!
//! Once bring-up completes the launcher blocks here for the rest of its life,
//! answering one response byte per action byte. A connection may carry
//! several actions before closing.

pub mod client;
pub mod teardown;

pub use client::{StopReply, stop_instance};
pub use teardown::InstanceTeardown;

use cvd_shared::{CvdError, CvdResult, LauncherAction, LauncherResponse};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

/// Executes control actions on behalf of the server.
pub trait ActionHandler {
    /// Tear down the instance.
    ///
    /// `Ok` means every process of the instance is gone and the launcher
    /// should exit after acknowledging.
    fn stop(&mut self) -> CvdResult<()>;
}

/// Why a client session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection.
    Disconnected,
    /// A Stop succeeded and was acknowledged.
    Stopped,
}

/// Serve one client until it disconnects or a Stop succeeds.
pub fn handle_client<S, H>(stream: &mut S, handler: &mut H) -> CvdResult<SessionEnd>
where
    S: Read + Write,
    H: ActionHandler + ?Sized,
{
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => return Ok(SessionEnd::Disconnected),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(CvdError::Protocol(format!(
                    "Failed to read control action: {}",
                    e
                )));
            }
        }

        let response = match LauncherAction::from_byte(byte[0]) {
            Some(LauncherAction::Stop) => {
                tracing::info!("Received stop request");
                match handler.stop() {
                    Ok(()) => {
                        // The instance is gone; the launcher exits either way.
                        if let Err(e) = respond(stream, LauncherResponse::Success) {
                            tracing::warn!("Instance stopped but the client missed the reply: {}", e);
                        }
                        return Ok(SessionEnd::Stopped);
                    }
                    Err(e) => {
                        tracing::error!("Failed to stop instance: {}", e);
                        LauncherResponse::Error
                    }
                }
            }
            None => {
                tracing::error!("Unrecognized launcher action: {:#04x}", byte[0]);
                LauncherResponse::Error
            }
        };
        respond(stream, response)?;
    }
}

fn respond<S: Write>(stream: &mut S, response: LauncherResponse) -> CvdResult<()> {
    stream
        .write_all(&[response.as_byte()])
        .and_then(|_| stream.flush())
        .map_err(|e| CvdError::Protocol(format!("Failed to write control response: {}", e)))
}

/// Listening control socket of a launcher.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one.
    pub fn bind(path: &Path) -> CvdResult<Self> {
        if path.symlink_metadata().is_ok() {
            std::fs::remove_file(path).map_err(|e| {
                CvdError::Storage(format!("Failed to remove stale {}: {}", path.display(), e))
            })?;
        }
        let listener = UnixListener::bind(path).map_err(|e| {
            CvdError::Storage(format!(
                "Failed to create launcher monitor socket {}: {}",
                path.display(),
                e
            ))
        })?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept clients until a Stop succeeds.
    ///
    /// Failed sessions are logged and do not end the loop.
    pub fn serve<H: ActionHandler + ?Sized>(&self, handler: &mut H) -> CvdResult<()> {
        tracing::info!("Serving control requests on {}", self.path.display());
        for conn in self.listener.incoming() {
            let mut stream = match conn {
                Ok(stream) => stream,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(CvdError::Storage(format!(
                        "Failed to accept control connection: {}",
                        e
                    )));
                }
            };
            match handle_client(&mut stream, handler) {
                Ok(SessionEnd::Stopped) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {}
                Err(e) => tracing::warn!("Control session failed: {}", e),
            }
        }
        Err(CvdError::Internal("Control socket closed".into()))
    }
}
