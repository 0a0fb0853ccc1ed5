//! Spare-device layout: the front metadata region plus the allocatable data
//! region that backs remapped sectors. The layout is bit-exact and
//! normative.

use crate::device::SECTOR_SIZE;
use crate::error::{Error, Result};

/// Size of one on-device metadata header, in bytes.
pub const HEADER_BYTES: u64 = 4096;

/// Size of one on-device metadata entry, in bytes.
pub const ENTRY_BYTES: u64 = 24;

/// Number of redundant metadata copies written on every save.
pub const COPY_COUNT: usize = 2;

/// Sectors occupied by the fixed 4 KiB header block.
pub const HEADER_SECTORS: u64 = HEADER_BYTES / SECTOR_SIZE;

/// Describes where a single device's spare geometry puts its metadata region
/// and its allocatable data region.
#[derive(Debug, Clone, Copy)]
pub struct SpareGeometry {
    /// Number of sectors reserved for the metadata region at the front of
    /// the spare. Must cover at least `COPY_COUNT` copies of
    /// `copy_sectors(entry_capacity)`.
    pub meta_region_sectors: u64,
    /// First sector of the allocatable data region.
    pub data_region_start: u64,
    /// Number of sectors in the allocatable data region.
    pub data_region_len: u64,
    /// Maximum number of entries a single on-device copy can hold.
    pub entry_capacity: u32,
}

impl SpareGeometry {
    /// Derive a geometry for a metadata region of `meta_region_sectors`,
    /// sizing `entry_capacity` to the largest value that still lets
    /// `COPY_COUNT` copies fit. The activation interface takes only the
    /// region's sector count, not an explicit capacity.
    pub fn for_region(
        meta_region_sectors: u64,
        data_region_start: u64,
        data_region_len: u64,
    ) -> Result<Self> {
        let per_copy_sectors = meta_region_sectors / COPY_COUNT as u64;
        let entry_sector_budget = per_copy_sectors.saturating_sub(HEADER_SECTORS);
        let entry_capacity = ((entry_sector_budget * SECTOR_SIZE) / ENTRY_BYTES) as u32;
        let geometry = Self {
            meta_region_sectors,
            data_region_start,
            data_region_len,
            entry_capacity,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Sectors occupied by one full copy (header + entry table, rounded up).
    pub fn copy_sectors(entry_capacity: u32) -> u64 {
        let entry_bytes = entry_capacity as u64 * ENTRY_BYTES;
        let entry_sectors = entry_bytes.div_ceil(SECTOR_SIZE);
        HEADER_SECTORS + entry_sectors
    }

    /// Byte offset of copy `index` (0-based) within the spare device.
    pub fn copy_offset_sectors(&self, index: usize) -> u64 {
        index as u64 * Self::copy_sectors(self.entry_capacity)
    }

    /// Validate that `meta_region_sectors` actually fits `COPY_COUNT` copies,
    /// returning `NoSpace` otherwise.
    pub fn validate(&self) -> Result<()> {
        let needed = COPY_COUNT as u64 * Self::copy_sectors(self.entry_capacity);
        if self.meta_region_sectors < needed {
            return Err(Error::NoSpace {
                entry_capacity: self.entry_capacity,
                needed,
                have: self.meta_region_sectors,
            });
        }
        Ok(())
    }

    /// Whether `sector` (a spare-device sector) falls inside the reserved
    /// metadata region and must never be handed out as a remap target.
    pub fn is_reserved(&self, sector: u64) -> bool {
        sector < self.meta_region_sectors
    }

    /// Whether `sector` lies inside the allocatable data region.
    pub fn is_in_data_region(&self, sector: u64) -> bool {
        sector >= self.data_region_start
            && sector < self.data_region_start + self.data_region_len
    }

    /// Total size of the spare device this geometry describes, in sectors.
    pub fn spare_size_sectors(&self) -> u64 {
        self.data_region_start + self.data_region_len
    }
}
