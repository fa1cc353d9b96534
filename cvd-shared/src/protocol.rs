//! Wire formats for the launcher's two IPC channels.
//!
//! - Control socket: one byte per action, one byte per response.
//! - Boot monitor pipe: fixed-size records, one native-endian `u32` each.

use std::io::{self, Write};

/// Action a control client can request from a running launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherAction {
    /// Tear down the whole instance.
    Stop,
}

impl LauncherAction {
    pub const fn as_byte(self) -> u8 {
        match self {
            LauncherAction::Stop => b'X',
        }
    }

    /// Decode an action byte. Unknown codes yield `None`.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'X' => Some(LauncherAction::Stop),
            _ => None,
        }
    }
}

/// Response written by the launcher for each action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherResponse {
    Success,
    Error,
}

impl LauncherResponse {
    pub const fn as_byte(self) -> u8 {
        match self {
            LauncherResponse::Success => b'S',
            LauncherResponse::Error => b'E',
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'S' => Some(LauncherResponse::Success),
            b'E' => Some(LauncherResponse::Error),
            _ => None,
        }
    }
}

/// Guest boot milestone, as recognized in the kernel log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BootEvent {
    BootStarted = 0,
    BootCompleted = 1,
    BootFailed = 2,
    WifiNetworkConnected = 3,
    MobileNetworkConnected = 4,
}

impl BootEvent {
    /// Size in bytes of one record on the boot monitor pipe.
    pub const RECORD_SIZE: usize = std::mem::size_of::<u32>();

    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Decode a record's code. Codes this build doesn't know yield `None`.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(BootEvent::BootStarted),
            1 => Some(BootEvent::BootCompleted),
            2 => Some(BootEvent::BootFailed),
            3 => Some(BootEvent::WifiNetworkConnected),
            4 => Some(BootEvent::MobileNetworkConnected),
            _ => None,
        }
    }

    pub fn to_record(self) -> [u8; Self::RECORD_SIZE] {
        self.code().to_ne_bytes()
    }

    /// Whether this event ends the boot monitor's wait.
    pub const fn is_terminal(self) -> bool {
        matches!(self, BootEvent::BootCompleted | BootEvent::BootFailed)
    }
}

/// Write one boot event record.
///
/// The record is small enough that a pipe write of it is atomic.
pub fn write_boot_event<W: Write>(writer: &mut W, event: BootEvent) -> io::Result<()> {
    writer.write_all(&event.to_record())
}
