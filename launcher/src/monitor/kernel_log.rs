//! Guest kernel log capture and boot marker detection.
//!
//! Backs the `kernel_log_monitor` helper: the VM connects its serial console
//! to the inherited listener, the bytes are appended to the kernel log file,
//! and lines carrying a `VIRTUAL_DEVICE_*` marker become boot events on the
//! subscriber descriptor.

use cvd_shared::protocol::write_boot_event;
use cvd_shared::{BootEvent, CvdError, CvdResult};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixListener;

const READ_CHUNK: usize = 256;
/// Longest partial line kept while waiting for a newline.
const MAX_LINE: usize = 4096;

const MARKERS: &[(&str, BootEvent)] = &[
    ("VIRTUAL_DEVICE_BOOT_STARTED", BootEvent::BootStarted),
    ("VIRTUAL_DEVICE_BOOT_COMPLETED", BootEvent::BootCompleted),
    ("VIRTUAL_DEVICE_BOOT_FAILED", BootEvent::BootFailed),
    (
        "VIRTUAL_DEVICE_NETWORK_MOBILE_CONNECTED",
        BootEvent::MobileNetworkConnected,
    ),
    (
        "VIRTUAL_DEVICE_NETWORK_WIFI_CONNECTED",
        BootEvent::WifiNetworkConnected,
    ),
];

/// Splits a byte stream into lines and reports the markers each line holds.
#[derive(Debug, Default)]
pub struct BootMarkerScanner {
    line: Vec<u8>,
}

impl BootMarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning events for every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<BootEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                events.extend(scan_line(&self.line));
                self.line.clear();
                continue;
            }
            self.line.push(byte);
        }
        if self.line.len() > MAX_LINE {
            let excess = self.line.len() - MAX_LINE;
            self.line.drain(..excess);
        }
        events
    }
}

fn scan_line(line: &[u8]) -> impl Iterator<Item = BootEvent> + '_ {
    let text = String::from_utf8_lossy(line).into_owned();
    MARKERS.iter().filter_map(move |(marker, event)| {
        if text.contains(marker) {
            tracing::info!("{}", marker);
            Some(*event)
        } else {
            None
        }
    })
}

/// Server side of the kernel log monitor.
pub struct KernelLogServer {
    listener: UnixListener,
    log: File,
    subscriber: Option<File>,
    scanner: BootMarkerScanner,
}

impl KernelLogServer {
    pub fn new(listener: UnixListener, log: File, subscriber: Option<File>) -> Self {
        Self {
            listener,
            log,
            subscriber,
            scanner: BootMarkerScanner::new(),
        }
    }

    /// Accept guest connections one at a time, forever.
    pub fn run(&mut self) -> CvdResult<()> {
        loop {
            let (conn, _) = self.listener.accept().map_err(|e| {
                CvdError::Storage(format!("Failed to accept kernel log connection: {}", e))
            })?;
            tracing::info!("Kernel log client connected");
            if let Err(e) = self.serve_connection(conn) {
                tracing::error!("Kernel log connection failed: {}", e);
            }
        }
    }

    /// Copy one connection's bytes to the log until it closes.
    pub fn serve_connection<R: Read>(&mut self, mut conn: R) -> CvdResult<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = match conn.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(CvdError::Protocol(format!(
                        "Could not read from kernel log client: {}",
                        e
                    )));
                }
            };
            self.log.write_all(&buf[..n]).map_err(|e| {
                CvdError::Storage(format!("Could not write kernel log to file: {}", e))
            })?;
            for event in self.scanner.feed(&buf[..n]) {
                self.notify(event);
            }
        }
    }

    /// Deliver `event` to the subscriber, cancelling the subscription when
    /// the other end is gone.
    fn notify(&mut self, event: BootEvent) {
        let Some(subscriber) = self.subscriber.as_mut() else {
            return;
        };
        if let Err(e) = write_boot_event(subscriber, event) {
            tracing::warn!(?event, "Dropping boot event subscriber: {}", e);
            self.subscriber = None;
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.is_some()
    }
}
