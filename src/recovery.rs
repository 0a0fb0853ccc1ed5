//! C5: turns whatever is (or isn't) on the spare device's metadata region
//! into a live `RemapTable` at activation time, and re-runs the same logic
//! for the management `restore` operation.

use crate::error::{Error, Result};
use crate::geometry::SpareGeometry;
use crate::metadata::MetadataStore;
use crate::table::RemapTable;

/// Outcome of one recovery pass, surfaced to callers (and to `status`) so an
/// operator can see whether anything was dropped.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub first_activation: bool,
    pub sequence: u64,
    pub entries_recovered: usize,
    pub entries_dropped: usize,
    pub copies_valid: usize,
    pub copies_total: usize,
}

pub struct RecoveryEngine;

impl RecoveryEngine {
    /// Run the activation sequence: on a blank spare, build an empty table
    /// and write the first image. Otherwise, read every redundant copy,
    /// keep the one with the highest sequence (ties broken by updated_time,
    /// then lowest copy index), drop any entry that no longer fits the
    /// current geometry, and write a fresh image bumping the sequence
    ///.
    pub fn recover(
        store: &MetadataStore,
        geometry: &SpareGeometry,
        primary_size_sectors: u64,
    ) -> Result<(RemapTable, RecoveryReport)> {
        if !store.has_any_magic()? {
            let table = RemapTable::new(
                geometry.meta_region_sectors,
                geometry.data_region_start,
                geometry.spare_size_sectors(),
            );
            store.write_all_copies(&[], 0, primary_size_sectors)?;
            return Ok((
                table,
                RecoveryReport {
                    first_activation: true,
                    sequence: 1,
                    entries_recovered: 0,
                    entries_dropped: 0,
                    copies_valid: 0,
                    copies_total: 0,
                },
            ));
        }

        let copies = store.read_all_copies()?;
        let copies_total = copies.len();
        let best = copies
            .iter()
            .filter_map(|c| c.result.as_ref().ok().map(|(h, e)| (c.index, h, e)))
            .max_by(|(ia, ha, _), (ib, hb, _)| {
                ha.sequence
                    .cmp(&hb.sequence)
                    .then(ha.updated_time.cmp(&hb.updated_time))
                    .then(ib.cmp(ia)) // lower copy index wins a tie
            });
        let copies_valid = copies.iter().filter(|c| c.result.is_ok()).count();

        let Some((_, header, entries)) = best else {
            return Err(Error::NoValidCopy);
        };

        if header.primary_size_sectors != primary_size_sectors {
            log::warn!(
                "recovered metadata was written against a primary device of {} sectors, \
                 current device has {} sectors",
                header.primary_size_sectors,
                primary_size_sectors
            );
        }

        let mut table = RemapTable::new(
            geometry.meta_region_sectors,
            geometry.data_region_start,
            geometry.spare_size_sectors(),
        );
        let mut dropped = 0usize;
        for entry in entries {
            if let Err(e) = table.insert(*entry) {
                log::warn!(
                    "dropping remap entry for primary sector {} during recovery: {e}",
                    entry.primary_sector
                );
                dropped += 1;
            }
        }

        let new_sequence = store.write_all_copies(&table.snapshot(), header.sequence, primary_size_sectors)?;

        Ok((
            table,
            RecoveryReport {
                first_activation: false,
                sequence: new_sequence,
                entries_recovered: entries.len() - dropped,
                entries_dropped: dropped,
                copies_valid,
                copies_total,
            },
        ))
    }
}
