//! C3: reads and writes the metadata region on the spare device. Writes
//! redundant copies in a fixed order with a durability barrier after each
//! full copy, so a crash mid-write leaves the previously-complete copy with
//! the highest sequence still readable.

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::geometry::{SpareGeometry, COPY_COUNT, HEADER_SECTORS};
use crate::metadata::codec::{self, MetadataHeader};
use crate::table::RemapEntry;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Trips a simulated crash at a named point when built with
/// `--features fault-injection` and `SPAREMAP_CRASH_AT` is set to match.
/// Lets crash-recovery paths be exercised from an ordinary test process.
#[cfg(feature = "fault-injection")]
fn maybe_crash_at(point: &str) {
    if let Ok(v) = std::env::var("SPAREMAP_CRASH_AT") {
        if v == point {
            panic!("FAULT INJECTION: simulated crash at '{point}'");
        }
    }
}

#[cfg(not(feature = "fault-injection"))]
#[inline(always)]
fn maybe_crash_at(_point: &str) {}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One copy as read back from the spare, with its validation outcome kept
/// alongside so `RecoveryEngine` can report per-copy warnings.
pub struct StoredCopy {
    pub index: usize,
    pub result: Result<(MetadataHeader, Vec<RemapEntry>)>,
}

pub struct MetadataStore {
    spare: Arc<dyn BlockDevice>,
    geometry: SpareGeometry,
    created_time: u64,
}

impl MetadataStore {
    pub fn new(spare: Arc<dyn BlockDevice>, geometry: SpareGeometry) -> Result<Self> {
        geometry.validate()?;
        Ok(Self {
            spare,
            geometry,
            created_time: now_secs(),
        })
    }

    pub fn geometry(&self) -> &SpareGeometry {
        &self.geometry
    }

    /// Read all redundant copies, each validated independently. Never fails
    /// outright — callers (RecoveryEngine) inspect each `StoredCopy` to
    /// decide whether any copy is usable.
    pub fn read_all_copies(&self) -> Result<Vec<StoredCopy>> {
        let mut out = Vec::with_capacity(COPY_COUNT);
        for index in 0..COPY_COUNT {
            let offset = self.geometry.copy_offset_sectors(index);
            let result = self.read_copy(offset);
            out.push(StoredCopy { index, result });
        }
        Ok(out)
    }

    fn read_copy(&self, offset_sectors: u64) -> Result<(MetadataHeader, Vec<RemapEntry>)> {
        let header_bytes = self.spare.read_sectors(offset_sectors, HEADER_SECTORS as u32)?;
        let entry_sectors =
            crate::geometry::SpareGeometry::copy_sectors(self.geometry.entry_capacity) - HEADER_SECTORS;
        let entry_bytes = self
            .spare
            .read_sectors(offset_sectors + HEADER_SECTORS, entry_sectors as u32)?;
        codec::decode(&header_bytes, &entry_bytes)
    }

    /// Encode `entries` and write every redundant copy in fixed ascending
    /// order, flushing after each copy. Returns the sequence number that
    /// was stamped on this save.
    pub fn write_all_copies(
        &self,
        entries: &[RemapEntry],
        prior_sequence: u64,
        primary_size_sectors: u64,
    ) -> Result<u64> {
        let updated_time = now_secs();
        let (header, table) = codec::encode(
            entries,
            prior_sequence,
            self.geometry.entry_capacity,
            primary_size_sectors,
            self.geometry.spare_size_sectors(),
            self.created_time,
            updated_time,
        )?;

        for index in 0..COPY_COUNT {
            let offset = self.geometry.copy_offset_sectors(index);
            self.spare.write_sectors(offset, &header)?;
            self.spare.write_sectors(offset + HEADER_SECTORS, &table)?;
            self.spare.flush()?;
            log::trace!("wrote metadata copy {index} at sector {offset}");
            maybe_crash_at(&format!("after_copy_{index}"));
        }
        Ok(prior_sequence + 1)
    }

    /// Whether any copy in the region has a valid magic — used to
    /// distinguish a genuinely blank spare (first activation) from a
    /// corrupted one.
    pub fn has_any_magic(&self) -> Result<bool> {
        for index in 0..COPY_COUNT {
            let offset = self.geometry.copy_offset_sectors(index);
            let header_bytes = self.spare.read_sectors(offset, HEADER_SECTORS as u32)?;
            if header_bytes[0..8] == codec::MAGIC {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::table::EntryFlags;

    // entry_capacity 16 needs 9 sectors per copy (8 header + 1 entry-table);
    // two redundant copies need 18 sectors, so the region must be at least
    // that large.
    fn store() -> MetadataStore {
        let geometry = SpareGeometry {
            meta_region_sectors: 18,
            data_region_start: 18,
            data_region_len: 10_000,
            entry_capacity: 16,
        };
        let spare = Arc::new(MemBlockDevice::new(10_018));
        MetadataStore::new(spare, geometry).unwrap()
    }

    #[test]
    fn blank_spare_has_no_magic() {
        let s = store();
        assert!(!s.has_any_magic().unwrap());
    }

    #[test]
    fn write_then_read_back_roundtrips() {
        let s = store();
        let entries = vec![RemapEntry {
            primary_sector: 100,
            spare_sector: 5000,
            length_sectors: 1,
            flags: EntryFlags::Manual,
        }];
        let seq = s.write_all_copies(&entries, 0, 20_000_000).unwrap();
        assert_eq!(seq, 1);
        assert!(s.has_any_magic().unwrap());

        let copies = s.read_all_copies().unwrap();
        assert_eq!(copies.len(), 2);
        for copy in copies {
            let (header, decoded) = copy.result.unwrap();
            assert_eq!(header.sequence, 1);
            assert_eq!(decoded, entries);
        }
    }

    #[test]
    fn torn_copy_is_reported_per_copy() {
        let s = store();
        let entries = vec![];
        s.write_all_copies(&entries, 0, 1).unwrap();

        // Corrupt copy 0's header CRC directly on the backing device.
        let offset = s.geometry().copy_offset_sectors(0);
        let mut header = s.spare.read_sectors(offset, HEADER_SECTORS as u32).unwrap();
        header[16] ^= 0xFF;
        s.spare.write_sectors(offset, &header).unwrap();

        let copies = s.read_all_copies().unwrap();
        assert!(copies[0].result.is_err());
        assert!(copies[1].result.is_ok());
    }
}
