//! Tunable parameters, held per-dispatcher-instance rather than as a
//! process-wide singleton, so that multiple concurrently active devices
//! stay independent of one another.

use crate::error::{Error, Result};

/// Error-rate thresholds driving `ErrorAnalyzer` severity classification.
#[derive(Debug, Clone, Copy)]
pub struct ErrorThresholds {
    /// Rolling window, in seconds, over which `window_limit` is counted.
    pub window_seconds: u64,
    /// Errors within the window that escalate a sector to Warning.
    pub window_limit: u32,
    /// Consecutive errors that escalate a sector to Warning.
    pub consecutive_warning: u32,
    /// Consecutive errors that escalate a sector to Actionable (enqueue
    /// auto-remap).
    pub consecutive_actionable: u32,
}

impl Default for ErrorThresholds {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            window_limit: 5,
            consecutive_warning: 2,
            consecutive_actionable: 3,
        }
    }
}

/// Per-dispatcher configuration: autosave cadence, error thresholds, and
/// the bound on the auto-remap job queue.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub autosave_interval_seconds: u32,
    pub thresholds: ErrorThresholds,
    pub autoremap_queue_bound: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            autosave_interval_seconds: 60,
            thresholds: ErrorThresholds::default(),
            autoremap_queue_bound: 256,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(1..=3600).contains(&self.autosave_interval_seconds) {
            return Err(Error::InvalidConfig(format!(
                "autosave_interval_seconds {} out of range 1..=3600",
                self.autosave_interval_seconds
            )));
        }
        if self.thresholds.consecutive_actionable == 0 {
            return Err(Error::InvalidConfig(
                "consecutive_actionable must be >= 1".into(),
            ));
        }
        if self.thresholds.consecutive_warning > self.thresholds.consecutive_actionable {
            return Err(Error::InvalidConfig(
                "consecutive_warning must not exceed consecutive_actionable".into(),
            ));
        }
        if self.autoremap_queue_bound == 0 {
            return Err(Error::InvalidConfig(
                "autoremap_queue_bound must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
