//! Reading boot event records from the monitor pipe.

use cvd_shared::{BootEvent, CvdError, CvdResult};
use std::io::{ErrorKind, Read};

/// Terminal outcome reported by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Completed,
    Failed,
}

/// Read one raw record code.
///
/// Anything shorter than a full record, including a closed pipe, is a
/// [`CvdError::Protocol`] error: the reader cannot tell what happened to the
/// guest.
pub fn read_boot_event<R: Read>(reader: &mut R) -> CvdResult<u32> {
    let mut record = [0u8; BootEvent::RECORD_SIZE];
    let mut filled = 0;
    while filled < record.len() {
        match reader.read(&mut record[filled..]) {
            Ok(0) => {
                return Err(CvdError::Protocol(format!(
                    "Short read on boot event pipe: got {} of {} bytes",
                    filled,
                    record.len()
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(CvdError::Protocol(format!(
                    "Failed to read boot event pipe: {}",
                    e
                )));
            }
        }
    }
    Ok(u32::from_ne_bytes(record))
}

/// Block until the guest reports BootCompleted or BootFailed.
///
/// Non-terminal and unknown records are logged and skipped.
pub fn monitor_boot_events<R: Read>(reader: &mut R) -> CvdResult<BootOutcome> {
    loop {
        let code = read_boot_event(reader)?;
        match BootEvent::from_code(code) {
            Some(BootEvent::BootCompleted) => {
                tracing::info!("Virtual device booted successfully");
                return Ok(BootOutcome::Completed);
            }
            Some(BootEvent::BootFailed) => {
                tracing::error!("Virtual device failed to boot");
                return Ok(BootOutcome::Failed);
            }
            Some(event) => tracing::debug!(?event, "Ignoring boot event"),
            None => tracing::debug!(code, "Ignoring unknown boot event"),
        }
    }
}
