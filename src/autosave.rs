//! C4: periodically flushes a dirty remap table to the metadata region in
//! the background, and exposes a synchronous `save_now` for the management
//! `save` operation. The two are mutually exclusive via a dedicated lock so
//! a manual save and a timer tick never race each other onto the spare
//! device.

use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

type SaveFn = dyn Fn() -> Result<()> + Send + Sync;

struct Shared {
    save_lock: Mutex<()>,
    save_fn: Arc<SaveFn>,
    dirty: Arc<AtomicBool>,
    interval: Duration,
    shutdown_mutex: Mutex<bool>,
    shutdown_cv: Condvar,
    last_save_time: AtomicU64,
    save_successes: AtomicU64,
    save_failures: AtomicU64,
}

/// Owns the background autosave thread. `save_fn` performs the actual
/// snapshot-and-write; it is supplied by the dispatcher, which is the only
/// component that can see both the table and the metadata store.
pub struct AutoSaveScheduler {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl AutoSaveScheduler {
    pub fn spawn<F>(interval_seconds: u32, dirty: Arc<AtomicBool>, save_fn: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            save_lock: Mutex::new(()),
            save_fn: Arc::new(save_fn),
            dirty,
            interval: Duration::from_secs(interval_seconds as u64),
            shutdown_mutex: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            last_save_time: AtomicU64::new(0),
            save_successes: AtomicU64::new(0),
            save_failures: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("sparemap-autosave".into())
            .spawn(move || run(worker_shared))
            .expect("spawn autosave worker thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Force a save right now, regardless of the dirty flag, mutually
    /// exclusive with any concurrent timer tick. Used by the management
    /// `save` operation.
    pub fn save_now(&self) -> Result<()> {
        let _guard = self.shared.save_lock.lock();
        let result = (self.shared.save_fn)();
        record_outcome(&self.shared, &result);
        result
    }

    pub fn last_save_time(&self) -> u64 {
        self.shared.last_save_time.load(Ordering::Relaxed)
    }

    pub fn save_successes(&self) -> u64 {
        self.shared.save_successes.load(Ordering::Relaxed)
    }

    pub fn save_failures(&self) -> u64 {
        self.shared.save_failures.load(Ordering::Relaxed)
    }

    /// Stop the background thread, performing one last save if the table is
    /// still dirty, so a clean shutdown never loses a pending change to the
    /// timer alone.
    pub fn shutdown(mut self) {
        *self.shared.shutdown_mutex.lock() = true;
        self.shared.shutdown_cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if self.shared.dirty.load(Ordering::Relaxed) {
            let _ = self.save_now();
        }
    }
}

fn record_outcome(shared: &Shared, result: &Result<()>) {
    match result {
        Ok(()) => {
            shared.last_save_time.store(now_secs(), Ordering::Relaxed);
            shared.save_successes.fetch_add(1, Ordering::Relaxed);
            shared.dirty.store(false, Ordering::Relaxed);
        }
        Err(e) => {
            shared.save_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("autosave tick failed: {e}");
        }
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let mut shutdown = shared.shutdown_mutex.lock();
        let timed_out = shared
            .shutdown_cv
            .wait_for(&mut shutdown, shared.interval)
            .timed_out();
        if *shutdown {
            break;
        }
        drop(shutdown);
        if timed_out && shared.dirty.load(Ordering::Relaxed) {
            let _guard = shared.save_lock.lock();
            // Re-check after acquiring the lock: a concurrent save_now may
            // have just cleared it.
            if shared.dirty.load(Ordering::Relaxed) {
                let result = (shared.save_fn)();
                record_outcome(&shared, &result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn save_now_clears_dirty_and_counts_success() {
        let dirty = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let scheduler = AutoSaveScheduler::spawn(3600, Arc::clone(&dirty), move || {
            calls2.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        scheduler.save_now().unwrap();

        assert_eq!(scheduler.save_successes(), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(!dirty.load(Ordering::Relaxed));
        scheduler.shutdown();
    }

    #[test]
    fn save_now_propagates_and_counts_failure() {
        let dirty = Arc::new(AtomicBool::new(false));
        let scheduler = AutoSaveScheduler::spawn(3600, Arc::clone(&dirty), || Err(Error::Busy));

        let err = scheduler.save_now().unwrap_err();
        assert!(matches!(err, Error::Busy));
        assert_eq!(scheduler.save_failures(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_flushes_if_still_dirty() {
        let dirty = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let scheduler = AutoSaveScheduler::spawn(3600, Arc::clone(&dirty), move || {
            calls2.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        scheduler.shutdown();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
