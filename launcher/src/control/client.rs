//! Client side of the control protocol.

use cvd_shared::{CvdError, CvdResult, LauncherAction, LauncherResponse};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// What the launcher answered to a Stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReply {
    /// The launcher tore the instance down and said so.
    Acknowledged,
    /// The launcher reported a failed teardown and is still running.
    Refused,
    /// The connection closed without a response. The launcher's group was
    /// killed before it could answer, which counts as stopped.
    ConnectionClosed,
}

/// Ask the launcher listening on `socket_path` to stop its instance.
pub fn stop_instance(socket_path: &Path) -> CvdResult<StopReply> {
    let mut stream = UnixStream::connect(socket_path).map_err(|e| {
        CvdError::Storage(format!(
            "Unable to connect to launcher monitor at {}: {}",
            socket_path.display(),
            e
        ))
    })?;
    stream
        .write_all(&[LauncherAction::Stop.as_byte()])
        .map_err(|e| CvdError::Protocol(format!("Failed to send stop request: {}", e)))?;

    let mut byte = [0u8; 1];
    let read = loop {
        match stream.read(&mut byte) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => break other,
        }
    };
    match read {
        Ok(0) => Ok(StopReply::ConnectionClosed),
        Ok(_) => match LauncherResponse::from_byte(byte[0]) {
            Some(LauncherResponse::Success) => Ok(StopReply::Acknowledged),
            Some(LauncherResponse::Error) => Ok(StopReply::Refused),
            None => Err(CvdError::Protocol(format!(
                "Unexpected launcher response {:#04x}",
                byte[0]
            ))),
        },
        Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(StopReply::ConnectionClosed),
        Err(e) => Err(CvdError::Protocol(format!(
            "Failed to read launcher response: {}",
            e
        ))),
    }
}
