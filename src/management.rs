//! Management operations, callable directly as methods on `Dispatcher`
//! rather than behind any parsed command grammar — these plain methods are
//! the whole surface.

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::recovery::{RecoveryEngine, RecoveryReport};
use crate::table::{EntryFlags, RemapEntry};
use std::sync::atomic::Ordering;

/// A point-in-time snapshot of everything an operator would want to see
#[derive(Debug, Clone)]
pub struct Status {
    pub entries_total: usize,
    pub entries_manual: usize,
    pub entries_auto: usize,
    pub resize_count: u64,
    pub resize_failures: u64,
    pub save_successes: u64,
    pub save_failures: u64,
    pub last_save_time: u64,
    pub autosave_interval_seconds: u32,
    pub autoremap_queue_len: usize,
    pub autoremap_jobs_installed: u64,
    pub autoremap_jobs_dropped: u64,
    pub spare_exhausted_count: u64,
    pub overall_health: u8,
    pub sequence: u64,
    pub dirty: bool,
}

impl Dispatcher {
    /// Install a Manual remap for `primary_sector`, auto-allocating the next
    /// free spare sector.
    pub fn remap(&self, primary_sector: u64) -> Result<()> {
        let mut table = self.table().write();
        let spare_sector = table
            .find_free_spare_run(1, self.geometry.data_region_start)
            .ok_or(Error::NoSpareCapacity)?;
        table.insert(RemapEntry {
            primary_sector,
            spare_sector,
            length_sectors: 1,
            flags: EntryFlags::Manual,
        })?;
        drop(table);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Install a Manual remap to an operator-chosen spare location, possibly
    /// spanning multiple sectors.
    pub fn remap_to(&self, primary_sector: u64, spare_sector: u64, length_sectors: u32) -> Result<()> {
        self.table().write().insert(RemapEntry {
            primary_sector,
            spare_sector,
            length_sectors,
            flags: EntryFlags::Manual,
        })?;
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Force an immediate metadata save, independent of the autosave timer
    pub fn save(&self) -> Result<()> {
        self.autosave.save_now()
    }

    /// Re-run the activation recovery sequence against the current spare
    /// metadata region, replacing the live table with whatever it yields.
    /// Idempotent: calling it twice in a row with no intervening writes
    /// reproduces the same table.
    pub fn restore(&self) -> Result<RecoveryReport> {
        let (recovered, report) =
            RecoveryEngine::recover(&self.store, &self.geometry, self.primary_size_sectors)?;
        *self.table().write() = recovered;
        self.sequence.store(report.sequence, Ordering::Relaxed);
        self.dirty.store(false, Ordering::Relaxed);
        Ok(report)
    }

    /// Liveness check: both backing devices still answer basic queries
    pub fn ping(&self) -> bool {
        self.primary_size_sectors > 0 && self.geometry.spare_size_sectors() > 0
    }

    /// Point-in-time operational snapshot.
    pub fn status(&self) -> Status {
        let table = self.table().read();
        Status {
            entries_total: table.entries_count(),
            entries_manual: table.manual_count(),
            entries_auto: table.auto_count(),
            resize_count: table.resize_count(),
            resize_failures: table.resize_failures(),
            save_successes: self.autosave.save_successes(),
            save_failures: self.autosave.save_failures(),
            last_save_time: self.autosave.last_save_time(),
            autosave_interval_seconds: self.config.autosave_interval_seconds,
            autoremap_queue_len: self.autoremap.queue_len(),
            autoremap_jobs_installed: self.autoremap.jobs_installed(),
            autoremap_jobs_dropped: self.autoremap.jobs_dropped(),
            spare_exhausted_count: self.autoremap.spare_exhausted_count(),
            overall_health: self.analyzer.overall_health(),
            sequence: self.sequence.load(Ordering::Relaxed),
            dirty: self.dirty.load(Ordering::Relaxed),
        }
    }
}
