//! C8: background worker that turns "this sector is actionable" signals
//! into installed Auto remap entries, off the I/O completion path
//!.

use crate::device::BlockDevice;
use crate::error_analyzer::ErrorAnalyzer;
use crate::table::{EntryFlags, RemapEntry, RemapTable};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error_analyzer::Severity;

#[derive(Debug, Clone, Copy)]
struct Job {
    primary_sector: u64,
    severity: Severity,
}

struct QueueState {
    jobs: VecDeque<Job>,
    queued: HashSet<u64>,
}

struct Shared {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    shutdown: AtomicBool,
    queue_bound: usize,
    table: Arc<RwLock<RemapTable>>,
    primary: Arc<dyn BlockDevice>,
    spare: Arc<dyn BlockDevice>,
    analyzer: Arc<ErrorAnalyzer>,
    dirty: Arc<AtomicBool>,
    cursor: AtomicU64,
    jobs_installed: AtomicU64,
    jobs_dropped: AtomicU64,
    spare_exhausted: AtomicU64,
}

/// Owns the background thread that drains the auto-remap queue. Dropping
/// this does not stop the thread; call `shutdown` explicitly so in-flight
/// jobs finish cleanly.
pub struct AutoRemapWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl AutoRemapWorker {
    pub fn spawn(
        table: Arc<RwLock<RemapTable>>,
        primary: Arc<dyn BlockDevice>,
        spare: Arc<dyn BlockDevice>,
        analyzer: Arc<ErrorAnalyzer>,
        dirty: Arc<AtomicBool>,
        spare_data_start: u64,
        queue_bound: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                queued: HashSet::new(),
            }),
            not_empty: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_bound: queue_bound.max(1),
            table,
            primary,
            spare,
            analyzer,
            dirty,
            cursor: AtomicU64::new(spare_data_start),
            jobs_installed: AtomicU64::new(0),
            jobs_dropped: AtomicU64::new(0),
            spare_exhausted: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("sparemap-autoremap".into())
            .spawn(move || run(worker_shared))
            .expect("spawn autoremap worker thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Enqueue a remap request for `primary_sector`. Deduplicates against
    /// jobs already queued. If the queue is at capacity, the oldest Benign
    /// job is evicted to make room; if none is evictable the request is
    /// dropped and counted. Queue overflow drops the oldest benign entries
    /// first.
    pub fn enqueue(&self, primary_sector: u64, severity: Severity) {
        let mut state = self.shared.state.lock();
        if state.queued.contains(&primary_sector) {
            return;
        }
        if state.jobs.len() >= self.shared.queue_bound {
            let evict = state
                .jobs
                .iter()
                .position(|j| j.severity == Severity::Benign);
            match evict {
                Some(pos) => {
                    let evicted = state.jobs.remove(pos).unwrap();
                    state.queued.remove(&evicted.primary_sector);
                    self.shared.jobs_dropped.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    self.shared.jobs_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
        state.queued.insert(primary_sector);
        state.jobs.push_back(Job {
            primary_sector,
            severity,
        });
        self.shared.not_empty.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn jobs_installed(&self) -> u64 {
        self.shared.jobs_installed.load(Ordering::Relaxed)
    }

    pub fn jobs_dropped(&self) -> u64 {
        self.shared.jobs_dropped.load(Ordering::Relaxed)
    }

    pub fn spare_exhausted_count(&self) -> u64 {
        self.shared.spare_exhausted.load(Ordering::Relaxed)
    }

    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.not_empty.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.queued.remove(&job.primary_sector);
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                shared.not_empty.wait(&mut state);
            }
        };
        let Some(job) = job else { break };
        process_job(&shared, job.primary_sector);
    }
}

fn process_job(shared: &Shared, primary_sector: u64) {
    if shared.table.read().lookup(primary_sector).is_some() {
        return;
    }

    let cursor = shared.cursor.load(Ordering::Relaxed);
    let spare_sector = {
        let table = shared.table.read();
        table.find_free_spare_run(1, cursor)
    };
    let Some(spare_sector) = spare_sector else {
        shared.spare_exhausted.fetch_add(1, Ordering::Relaxed);
        log::warn!("auto-remap: spare device exhausted, cannot remap sector {primary_sector}");
        return;
    };
    shared.cursor.store(spare_sector + 1, Ordering::Relaxed);

    if let Ok(content) = shared.primary.read_sectors(primary_sector, 1) {
        if let Err(e) = shared.spare.write_sectors(spare_sector, &content) {
            log::warn!(
                "auto-remap: best-effort content copy to spare sector {spare_sector} failed: {e}"
            );
        }
    } else {
        log::warn!(
            "auto-remap: could not read primary sector {primary_sector} to preserve content; \
             installing remap with unspecified spare contents"
        );
    }

    let entry = RemapEntry {
        primary_sector,
        spare_sector,
        length_sectors: 1,
        flags: EntryFlags::Auto,
    };
    match shared.table.write().insert(entry) {
        Ok(()) => {
            shared.dirty.store(true, Ordering::Relaxed);
            shared.analyzer.mark_remap_attempted(primary_sector);
            shared.jobs_installed.fetch_add(1, Ordering::Relaxed);
            log::info!("auto-remapped primary sector {primary_sector} -> spare {spare_sector}");
        }
        Err(e) => {
            log::error!("auto-remap: failed to install entry for sector {primary_sector}: {e}");
        }
    }
}
