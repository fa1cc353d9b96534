//! Shared memory bootstrap.
//!
//! Sizes the IPC regions and creates the backing file before any process
//! that maps it is spawned. The file starts with a one-page header
//! describing the regions:
//!
//! ```text
//! offset 0   magic "VSOC" | version u32 | region count u32
//! offset 12  per region: name [u8; 16] | offset u64 | size u64   (little endian)
//! ```
//!
//! Regions follow the header, page aligned, separated by guard pages.

use crate::config::InstanceConfig;
use cvd_shared::{CvdError, CvdResult};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

pub const PAGE_SIZE: u64 = 4096;
pub const GUARD_PAGE_SIZE: u64 = PAGE_SIZE;
pub const BYTES_PER_PIXEL: u64 = 4;
/// Extra bytes after each frame buffer.
pub const SCREEN_BUFFER_PADDING: u64 = 16;

/// Single-page regions laid out after the screen region.
const SMALL_REGIONS: [&str; 3] = ["input_events", "e2e_test", "wifi_exchange"];

/// Number of regions in every instance's layout.
pub const INSTANCE_REGION_COUNT: usize = 1 + SMALL_REGIONS.len();

const MAGIC: &[u8; 4] = b"VSOC";
const LAYOUT_VERSION: u32 = 1;
const NAME_LEN: usize = 16;
const HEADER_FIXED_LEN: usize = 12;
const RECORD_LEN: usize = NAME_LEN + 16;

/// Round `value` up to a multiple of `2^exponent`.
pub fn align_to_power_of_2(value: u64, exponent: u32) -> u64 {
    let mask = (1u64 << exponent) - 1;
    (value + mask) & !mask
}

pub fn align_to_page_size(value: u64) -> u64 {
    align_to_power_of_2(value, PAGE_SIZE.trailing_zeros())
}

/// Bytes per screen line, aligned to 16.
pub fn screen_line_stride(x_res: u32) -> u64 {
    align_to_power_of_2(x_res as u64 * BYTES_PER_PIXEL, 4)
}

/// Page-aligned size of one frame buffer.
pub fn screen_buffer_size(x_res: u32, y_res: u32) -> u64 {
    align_to_page_size(screen_line_stride(x_res) * y_res as u64 + SCREEN_BUFFER_PADDING)
}

/// Size of the screen region: every buffer plus a guard page between
/// consecutive buffers.
pub fn screen_region_size(x_res: u32, y_res: u32, buffers: u32) -> u64 {
    let buffers = buffers as u64;
    screen_buffer_size(x_res, y_res) * buffers + GUARD_PAGE_SIZE * buffers.saturating_sub(1)
}

/// One named region of the shared memory file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub offset: u64,
    pub size: u64,
}

/// Fixed layout of an instance's shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryLayout {
    regions: Vec<Region>,
    total_size: u64,
}

impl SharedMemoryLayout {
    /// Lay out `(name, size)` regions after the header page.
    pub fn new(specs: &[(&'static str, u64)]) -> CvdResult<Self> {
        if HEADER_FIXED_LEN + specs.len() * RECORD_LEN > PAGE_SIZE as usize {
            return Err(CvdError::Config(format!(
                "Too many shared memory regions: {}",
                specs.len()
            )));
        }
        let mut regions = Vec::with_capacity(specs.len());
        let mut offset = PAGE_SIZE;
        for (i, (name, size)) in specs.iter().enumerate() {
            if name.len() > NAME_LEN {
                return Err(CvdError::Config(format!("Region name too long: {}", name)));
            }
            if i > 0 {
                offset += GUARD_PAGE_SIZE;
            }
            regions.push(Region {
                name,
                offset,
                size: *size,
            });
            offset = align_to_page_size(offset + size);
        }
        Ok(Self {
            regions,
            total_size: offset,
        })
    }

    /// Regions every instance shares with the guest.
    pub fn for_config(config: &InstanceConfig) -> CvdResult<Self> {
        let screen = screen_region_size(config.x_res, config.y_res, config.num_screen_buffers);
        let mut specs = vec![("screen", screen)];
        specs.extend(SMALL_REGIONS.iter().map(|name| (*name, PAGE_SIZE)));
        Self::new(&specs)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// One interrupt vector per region.
    pub fn vector_count(&self) -> usize {
        self.regions.len()
    }

    pub fn encode_header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_FIXED_LEN + self.regions.len() * RECORD_LEN);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
        header.extend_from_slice(&(self.regions.len() as u32).to_le_bytes());
        for region in &self.regions {
            let mut name = [0u8; NAME_LEN];
            name[..region.name.len()].copy_from_slice(region.name.as_bytes());
            header.extend_from_slice(&name);
            header.extend_from_slice(&region.offset.to_le_bytes());
            header.extend_from_slice(&region.size.to_le_bytes());
        }
        header
    }

    /// Create the backing file at `path`.
    ///
    /// The file must not exist: a leftover from an earlier launch is removed
    /// by prior file cleanup, and anything else is a conflict.
    pub fn create_backing_file(&self, path: &Path) -> CvdResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CvdError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o660)
            .open(path)
            .map_err(|e| {
                CvdError::Storage(format!(
                    "Failed to create shared memory file {}: {}",
                    path.display(),
                    e
                ))
            })?;
        file.set_len(self.total_size).map_err(|e| {
            CvdError::Storage(format!("Failed to size {}: {}", path.display(), e))
        })?;
        file.write_all_at(&self.encode_header(), 0).map_err(|e| {
            CvdError::Storage(format!("Failed to write header to {}: {}", path.display(), e))
        })?;
        tracing::info!(
            path = %path.display(),
            size = self.total_size,
            regions = self.regions.len(),
            "Created shared memory file"
        );
        Ok(())
    }
}
