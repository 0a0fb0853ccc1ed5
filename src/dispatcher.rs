//! C6: the I/O dispatch path. Every read/write against the remapped device
//! passes through here: look up remaps, split the request at remap
//! boundaries, forward each piece to the right backing device, and feed
//! completions into the error analyzer.

use crate::autoremap::AutoRemapWorker;
use crate::autosave::AutoSaveScheduler;
use crate::config::Config;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::error_analyzer::{ErrorAnalyzer, Severity};
use crate::geometry::SpareGeometry;
use crate::metadata::MetadataStore;
use crate::recovery::{RecoveryEngine, RecoveryReport};
use crate::table::RemapTable;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Primary,
    Spare,
}

/// One contiguous run of a request that lands entirely on one backing
/// device. `primary_sector` is always the identity used for error
/// accounting, whether the run is served from the primary device directly
/// or redirected to the spare.
#[derive(Debug, Clone, Copy)]
struct Segment {
    target: Target,
    device_start: u64,
    primary_sector: u64,
    length: u32,
}

/// Owns the live remap table, both backing devices, and the background
/// workers, built by `activate` from whatever the spare device's metadata
/// region holds (or doesn't).
pub struct Dispatcher {
    table: Arc<RwLock<RemapTable>>,
    primary: Arc<dyn BlockDevice>,
    spare: Arc<dyn BlockDevice>,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) geometry: SpareGeometry,
    pub(crate) analyzer: Arc<ErrorAnalyzer>,
    pub(crate) dirty: Arc<AtomicBool>,
    pub(crate) sequence: Arc<AtomicU64>,
    pub(crate) primary_size_sectors: u64,
    pub(crate) config: Config,
    pub(crate) autosave: AutoSaveScheduler,
    pub(crate) autoremap: AutoRemapWorker,
    pub(crate) activation_report: RecoveryReport,
}

impl Dispatcher {
    /// Bring a remap layer up over `primary`/`spare`, recovering (or
    /// creating) the metadata region described by the three spare-device
    /// geometry parameters.
    pub fn activate(
        primary: Arc<dyn BlockDevice>,
        spare: Arc<dyn BlockDevice>,
        spare_metadata_region_sectors: u64,
        spare_data_region_start: u64,
        spare_data_region_length: u64,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        let geometry = SpareGeometry::for_region(
            spare_metadata_region_sectors,
            spare_data_region_start,
            spare_data_region_length,
        )?;
        let store = Arc::new(MetadataStore::new(Arc::clone(&spare), geometry)?);
        let primary_size_sectors = primary.total_sectors();
        let (table, report) = RecoveryEngine::recover(&store, &geometry, primary_size_sectors)?;
        log::info!(
            "sparemap activated: first_activation={} recovered={} dropped={} sequence={}",
            report.first_activation,
            report.entries_recovered,
            report.entries_dropped,
            report.sequence
        );

        let table = Arc::new(RwLock::new(table));
        let analyzer = Arc::new(ErrorAnalyzer::new(config.thresholds));
        let dirty = Arc::new(AtomicBool::new(false));
        let sequence = Arc::new(AtomicU64::new(report.sequence));

        let autoremap = AutoRemapWorker::spawn(
            Arc::clone(&table),
            Arc::clone(&primary),
            Arc::clone(&spare),
            Arc::clone(&analyzer),
            Arc::clone(&dirty),
            geometry.data_region_start,
            config.autoremap_queue_bound,
        );

        let autosave_table = Arc::clone(&table);
        let autosave_store = Arc::clone(&store);
        let autosave_sequence = Arc::clone(&sequence);
        let autosave = AutoSaveScheduler::spawn(
            config.autosave_interval_seconds,
            Arc::clone(&dirty),
            move || {
                let snapshot = autosave_table.read().snapshot();
                let prior = autosave_sequence.load(Ordering::Relaxed);
                let new_seq = autosave_store.write_all_copies(&snapshot, prior, primary_size_sectors)?;
                autosave_sequence.store(new_seq, Ordering::Relaxed);
                Ok(())
            },
        );

        Ok(Self {
            table,
            primary,
            spare,
            store,
            geometry,
            analyzer,
            dirty,
            sequence,
            primary_size_sectors,
            config,
            autosave,
            autoremap,
            activation_report: report,
        })
    }

    fn device_for(&self, target: Target) -> &Arc<dyn BlockDevice> {
        match target {
            Target::Primary => &self.primary,
            Target::Spare => &self.spare,
        }
    }

    /// Break `[start, start+len)` into runs that each land on exactly one
    /// backing device, in ascending order.
    fn plan_segments(&self, start: u64, len: u32) -> Vec<Segment> {
        let end = start + len as u64;
        let table = self.table.read();
        let entries = table.overlapping(start, len);
        let mut segments = Vec::with_capacity(entries.len() * 2 + 1);
        let mut cursor = start;
        for e in entries {
            let e_start = e.primary_sector.max(start);
            let e_end = e.primary_end().min(end);
            if cursor < e_start {
                segments.push(Segment {
                    target: Target::Primary,
                    device_start: cursor,
                    primary_sector: cursor,
                    length: (e_start - cursor) as u32,
                });
            }
            segments.push(Segment {
                target: Target::Spare,
                device_start: e.translate(e_start),
                primary_sector: e_start,
                length: (e_end - e_start) as u32,
            });
            cursor = e_end;
        }
        if cursor < end {
            segments.push(Segment {
                target: Target::Primary,
                device_start: cursor,
                primary_sector: cursor,
                length: (end - cursor) as u32,
            });
        }
        segments
    }

    /// Read `len` sectors starting at primary sector `start`, transparently
    /// redirected through any installed remaps.
    pub fn read(&self, start: u64, len: u32) -> Result<Vec<u8>> {
        let segments = self.plan_segments(start, len);
        let mut buf = vec![0u8; len as usize * SECTOR_SIZE as usize];
        let mut first_err: Option<Error> = None;

        for seg in &segments {
            let device = self.device_for(seg.target);
            match device.read_sectors(seg.device_start, seg.length) {
                Ok(data) => {
                    for i in 0..seg.length as u64 {
                        self.analyzer.record_success(seg.primary_sector + i);
                    }
                    let off = ((seg.primary_sector - start) as usize) * SECTOR_SIZE as usize;
                    buf[off..off + data.len()].copy_from_slice(&data);
                }
                Err(_) => {
                    if let Some(e) = self.retry_read_sector_by_sector(seg, device, &mut buf, start)
                    {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(buf),
        }
    }

    /// Write `data` (exactly `len(data)/SECTOR_SIZE` sectors) starting at
    /// primary sector `start`.
    pub fn write(&self, start: u64, data: &[u8]) -> Result<()> {
        let len = (data.len() as u64 / SECTOR_SIZE) as u32;
        let segments = self.plan_segments(start, len);
        let mut first_err: Option<Error> = None;

        for seg in &segments {
            let device = self.device_for(seg.target);
            let off = ((seg.primary_sector - start) as usize) * SECTOR_SIZE as usize;
            let seg_len = seg.length as usize * SECTOR_SIZE as usize;
            let slice = &data[off..off + seg_len];
            match device.write_sectors(seg.device_start, slice) {
                Ok(()) => {
                    for i in 0..seg.length as u64 {
                        self.analyzer.record_success(seg.primary_sector + i);
                    }
                }
                Err(_) => {
                    if let Some(e) = self.retry_write_sector_by_sector(seg, device, slice) {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A bulk segment read failed. Retry one sector at a time so the error
    /// analyzer (and a possible auto-remap) can be driven per exact sector,
    /// rather than blaming the whole run. Fills `buf` for every sector that
    /// individually succeeds; returns the first error encountered, if any.
    fn retry_read_sector_by_sector(
        &self,
        seg: &Segment,
        device: &Arc<dyn BlockDevice>,
        buf: &mut [u8],
        request_start: u64,
    ) -> Option<Error> {
        let mut first_err = None;
        for i in 0..seg.length as u64 {
            let device_sector = seg.device_start + i;
            let primary_sector = seg.primary_sector + i;
            match device.read_sector(device_sector) {
                Ok(data) => {
                    self.analyzer.record_success(primary_sector);
                    let off = ((primary_sector - request_start) as usize) * SECTOR_SIZE as usize;
                    buf[off..off + data.len()].copy_from_slice(&data);
                }
                Err(e) => {
                    self.on_sector_error(seg.target, primary_sector, false);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err
    }

    fn retry_write_sector_by_sector(
        &self,
        seg: &Segment,
        device: &Arc<dyn BlockDevice>,
        data: &[u8],
    ) -> Option<Error> {
        let mut first_err = None;
        for i in 0..seg.length as u64 {
            let device_sector = seg.device_start + i;
            let primary_sector = seg.primary_sector + i;
            let off = i as usize * SECTOR_SIZE as usize;
            let sector_data = &data[off..off + SECTOR_SIZE as usize];
            match device.write_sector(device_sector, sector_data) {
                Ok(()) => self.analyzer.record_success(primary_sector),
                Err(e) => {
                    self.on_sector_error(seg.target, primary_sector, true);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err
    }

    fn on_sector_error(&self, target: Target, primary_sector: u64, is_write: bool) {
        let severity = self.analyzer.record_error(primary_sector, is_write);
        log::debug!("sector {primary_sector} error, severity={severity:?}");
        if target == Target::Primary && severity >= Severity::Actionable {
            self.autoremap.enqueue(primary_sector, severity);
        }
    }

    pub fn primary_size_sectors(&self) -> u64 {
        self.primary_size_sectors
    }

    pub fn geometry(&self) -> &SpareGeometry {
        &self.geometry
    }

    pub(crate) fn table(&self) -> &Arc<RwLock<RemapTable>> {
        &self.table
    }

    /// Stop background workers, flushing a pending dirty table first (spec
    /// §4.4, §4.8).
    pub fn shutdown(self) {
        self.autoremap.shutdown();
        self.autosave.shutdown();
    }
}
