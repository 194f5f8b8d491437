//! Host load tracking for scrub admission.
//!
//! [`LoadTracker`] answers one question: is the host calm enough to start an
//! ordinary scrub? It compares the per-CPU 1-minute load average against the
//! configured threshold and, failing that, accepts a load that is trending
//! down (below both the smoothed daily average and the 15-minute average).
//!
//! Every read failure fails closed: if the load cannot be read, scrubbing is
//! treated as not permitted. The failure is never propagated to the caller.
//!
//! # Logging
//!
//! - **TRACE** `scrubd::sched::load`: `load_below_threshold` / `load_trending_down` — admission granted
//! - **DEBUG** `scrubd::sched::load`: `load_too_high` — admission denied
//! - **DEBUG** `scrubd::sched::load`: `loadavg_unreadable` — read failed, admission denied
//! - **ERROR** `scrubd::sched::load`: `loadavg_unreadable_at_init` — daily average seeded with 1.0

use scrubd_error::{Result, ScrubError};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, error, trace};

const SECONDS_PER_DAY: u64 = 86_400;
const DEFAULT_DAILY_LOADAVG: f64 = 1.0;

/// Provider of host load samples.
pub trait LoadSource: Send + Sync {
    /// The 1, 5 and 15 minute load averages, in that order.
    fn load_averages(&self) -> Result<[f64; 3]>;

    /// Number of online CPUs, if known.
    fn online_cpus(&self) -> Option<NonZeroUsize>;
}

/// Load source backed by the host's `getloadavg` figures, via `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostLoad;

impl HostLoad {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl LoadSource for HostLoad {
    fn load_averages(&self) -> Result<[f64; 3]> {
        let loadavg = System::load_average();
        checked_loadavgs([loadavg.one, loadavg.five, loadavg.fifteen])
    }

    fn online_cpus(&self) -> Option<NonZeroUsize> {
        std::thread::available_parallelism().ok()
    }
}

/// Reject samples that are negative or not finite.
fn checked_loadavgs(samples: [f64; 3]) -> Result<[f64; 3]> {
    for (idx, value) in samples.iter().enumerate() {
        if !value.is_finite() || *value < 0.0 {
            return Err(ScrubError::LoadAverage(format!(
                "sample {idx} out of range: {value}"
            )));
        }
    }
    Ok(samples)
}

/// Tracks host load and a smoothed daily load average.
pub struct LoadTracker {
    source: Arc<dyn LoadSource>,
    daily_loadavg: f64,
}

impl fmt::Debug for LoadTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadTracker")
            .field("daily_loadavg", &self.daily_loadavg)
            .finish_non_exhaustive()
    }
}

impl LoadTracker {
    /// Create a tracker, seeding the daily average from the current
    /// 15-minute load (or `1.0` when it cannot be read).
    pub fn new(source: Arc<dyn LoadSource>) -> Self {
        let daily_loadavg = match source.load_averages() {
            Ok(loadavgs) => loadavgs[2],
            Err(err) => {
                error!(
                    target: "scrubd::sched::load",
                    error = %err,
                    seed = DEFAULT_DAILY_LOADAVG,
                    "loadavg_unreadable_at_init"
                );
                DEFAULT_DAILY_LOADAVG
            }
        };
        Self {
            source,
            daily_loadavg,
        }
    }

    #[must_use]
    pub fn daily_loadavg(&self) -> f64 {
        self.daily_loadavg
    }

    /// Fold the current 1-minute load into the daily average.
    ///
    /// The smoothing window is one day's worth of heartbeats:
    /// `n = max(86400 / heartbeat_interval_secs, 1)`. Returns the
    /// instantaneous load as a percentage, or `None` when it cannot be read.
    pub fn update_load_average(&mut self, heartbeat_interval_secs: u64) -> Option<f64> {
        let n_samples = (SECONDS_PER_DAY / heartbeat_interval_secs.max(1)).max(1);
        #[allow(clippy::cast_precision_loss)]
        let n = n_samples as f64;

        let loadavg = self.source.load_averages().ok()?[0];
        self.daily_loadavg = (self.daily_loadavg * (n - 1.0) + loadavg) / n;
        Some(100.0 * loadavg)
    }

    /// Whether the host load permits starting an ordinary scrub.
    #[must_use]
    pub fn scrub_load_below_threshold(&self, threshold: f64) -> bool {
        let loadavgs = match self.source.load_averages() {
            Ok(loadavgs) => loadavgs,
            Err(err) => {
                debug!(target: "scrubd::sched::load", error = %err, "loadavg_unreadable");
                return false;
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let loadavg_per_cpu = self
            .source
            .online_cpus()
            .map_or(loadavgs[0], |cpus| loadavgs[0] / cpus.get() as f64);
        if loadavg_per_cpu < threshold {
            trace!(
                target: "scrubd::sched::load",
                loadavg_per_cpu,
                threshold,
                "load_below_threshold"
            );
            return true;
        }

        if loadavgs[0] < self.daily_loadavg && loadavgs[0] < loadavgs[2] {
            trace!(
                target: "scrubd::sched::load",
                loadavg = loadavgs[0],
                daily_loadavg = self.daily_loadavg,
                loadavg_15m = loadavgs[2],
                "load_trending_down"
            );
            return true;
        }

        debug!(
            target: "scrubd::sched::load",
            loadavg = loadavgs[0],
            threshold,
            daily_loadavg = self.daily_loadavg,
            loadavg_15m = loadavgs[2],
            "load_too_high"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FixedLoad {
        samples: Mutex<Option<[f64; 3]>>,
        cpus: Option<NonZeroUsize>,
    }

    impl FixedLoad {
        fn new(samples: Option<[f64; 3]>, cpus: usize) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(samples),
                cpus: NonZeroUsize::new(cpus),
            })
        }

        fn set(&self, samples: Option<[f64; 3]>) {
            *self.samples.lock() = samples;
        }
    }

    impl LoadSource for FixedLoad {
        fn load_averages(&self) -> Result<[f64; 3]> {
            (*self.samples.lock()).ok_or_else(|| ScrubError::LoadAverage("unavailable".into()))
        }

        fn online_cpus(&self) -> Option<NonZeroUsize> {
            self.cpus
        }
    }

    #[test]
    fn host_load_reports_sane_samples() {
        let source = HostLoad::new();
        let samples = source.load_averages().unwrap();
        assert!(samples.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(source.online_cpus().is_some());
    }

    #[test]
    fn out_of_range_samples_are_rejected() {
        assert!(checked_loadavgs([0.5, 0.4, 0.3]).is_ok());
        assert!(checked_loadavgs([f64::NAN, 0.0, 0.0]).is_err());
        assert!(checked_loadavgs([0.0, f64::INFINITY, 0.0]).is_err());
        assert!(checked_loadavgs([0.0, 0.0, -1.0]).is_err());
    }

    #[test]
    fn init_seeds_daily_average_from_15_minute_sample() {
        let tracker = LoadTracker::new(FixedLoad::new(Some([3.0, 2.0, 1.5]), 4));
        assert!((tracker.daily_loadavg() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn init_falls_back_when_unreadable() {
        let tracker = LoadTracker::new(FixedLoad::new(None, 4));
        assert!((tracker.daily_loadavg() - DEFAULT_DAILY_LOADAVG).abs() < f64::EPSILON);
    }

    #[test]
    fn unreadable_load_denies_scrubbing() {
        let source = FixedLoad::new(Some([0.0, 0.0, 0.0]), 8);
        let tracker = LoadTracker::new(source.clone());
        source.set(None);
        assert!(!tracker.scrub_load_below_threshold(f64::MAX));
    }

    #[test]
    fn per_cpu_load_below_threshold_permits() {
        // 6.0 over 8 CPUs is 0.75 per CPU.
        let tracker = LoadTracker::new(FixedLoad::new(Some([6.0, 6.0, 6.0]), 8));
        assert!(tracker.scrub_load_below_threshold(1.0));
        assert!(!tracker.scrub_load_below_threshold(0.5));
    }

    #[test]
    fn raw_load_used_when_cpu_count_unknown() {
        let tracker = LoadTracker::new(FixedLoad::new(Some([6.0, 6.0, 6.0]), 0));
        assert!(!tracker.scrub_load_below_threshold(1.0));
        assert!(tracker.scrub_load_below_threshold(6.5));
    }

    #[test]
    fn decreasing_trend_permits_above_threshold() {
        let source = FixedLoad::new(Some([5.0, 5.0, 5.0]), 1);
        let tracker = LoadTracker::new(source.clone());
        // daily = 5.0; now the 1-minute load dropped below both references.
        source.set(Some([4.0, 4.5, 4.8]));
        assert!(tracker.scrub_load_below_threshold(1.0));

        // Rising again: above the 15-minute sample.
        source.set(Some([4.9, 4.5, 4.8]));
        assert!(!tracker.scrub_load_below_threshold(1.0));
    }

    #[test]
    fn update_smooths_over_a_day_of_heartbeats() {
        let source = FixedLoad::new(Some([2.0, 2.0, 2.0]), 1);
        let mut tracker = LoadTracker::new(source.clone());

        source.set(Some([4.0, 2.0, 2.0]));
        // 86400 / 43200 = 2 samples: daily = (2.0 * 1 + 4.0) / 2.
        let pct = tracker.update_load_average(43_200).unwrap();
        assert!((pct - 400.0).abs() < 1e-9);
        assert!((tracker.daily_loadavg() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn update_with_huge_interval_uses_single_sample() {
        let source = FixedLoad::new(Some([2.0, 2.0, 2.0]), 1);
        let mut tracker = LoadTracker::new(source.clone());
        source.set(Some([7.0, 2.0, 2.0]));
        tracker.update_load_average(1_000_000).unwrap();
        assert!((tracker.daily_loadavg() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn update_reports_none_and_keeps_average_on_failure() {
        let source = FixedLoad::new(Some([2.0, 2.0, 2.0]), 1);
        let mut tracker = LoadTracker::new(source.clone());
        source.set(None);
        assert_eq!(tracker.update_load_average(6), None);
        assert!((tracker.daily_loadavg() - 2.0).abs() < f64::EPSILON);
    }
}
