//! Scheduler configuration and live configuration snapshots.
//!
//! [`ScrubConfig`] holds every operator knob the scheduler reads. It is
//! published through a [`ConfigCell`], an [`ArcSwap`]-backed cell: a
//! scheduling pass loads one snapshot and uses it throughout, while an
//! operator update atomically publishes a new snapshot for the next pass.
//!
//! Loading configuration from a cluster store is not this crate's concern;
//! callers build a `ScrubConfig` (or parse one with
//! [`ScrubConfig::from_json`]) and hand it to [`ConfigCell::update`], then
//! call `OsdScrub::on_config_change` so registered jobs re-plan.
//!
//! # Logging
//!
//! - **DEBUG** `scrubd::sched::config`: `config_cell_update` — a validated snapshot was published
//! - **WARN**  `scrubd::sched::config`: `config_update_rejected` — validation failed, old snapshot kept

use arc_swap::ArcSwap;
use scrubd_error::{Result, ScrubError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Operator-tunable scrub scheduling parameters.
///
/// Missing fields take their [`Default`] values when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    /// Probability in `[0, 1]` that a pass backs off without doing anything.
    pub scrub_backoff_ratio: f64,
    /// Maximum concurrent scrubs this node runs as primary.
    pub max_scrubs_local: u32,
    /// Maximum concurrent scrubs this node participates in as a replica.
    pub max_scrubs_remote: u32,
    /// Allow ordinary scrubs while recovery is active.
    pub scrub_during_recovery: bool,
    /// Allow operator-requested repairs while recovery is active.
    pub repair_during_recovery: bool,
    /// First permitted weekday (0 = Sunday).
    pub begin_week_day: u8,
    /// End of the weekday window (exclusive). Equal to `begin_week_day`
    /// means every day.
    pub end_week_day: u8,
    /// First permitted local hour.
    pub begin_hour: u8,
    /// End of the hour window (exclusive). Equal to `begin_hour` means every
    /// hour.
    pub end_hour: u8,
    /// Per-CPU load average below which ordinary scrubs may start.
    pub load_threshold: f64,
    /// Sleep between scrub chunks, in seconds.
    pub scrub_sleep_secs: f64,
    /// Sleep between chunks once a scrub has run into forbidden hours.
    pub scrub_extended_sleep_secs: f64,
    /// Interval of the external tick driving the scheduler, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Default minimum time between periodic scrubs of a PG, in seconds.
    pub scrub_min_interval_secs: f64,
    /// Default time after which a periodic scrub is overdue. Non-positive
    /// values disable deadlines.
    pub scrub_max_interval_secs: f64,
    /// Random spread added to the minimum interval, as a fraction of it.
    pub interval_randomize_ratio: f64,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            scrub_backoff_ratio: 0.66,
            max_scrubs_local: 3,
            max_scrubs_remote: 3,
            scrub_during_recovery: false,
            repair_during_recovery: false,
            begin_week_day: 0,
            end_week_day: 0,
            begin_hour: 0,
            end_hour: 0,
            load_threshold: 10.0,
            scrub_sleep_secs: 0.0,
            scrub_extended_sleep_secs: 0.0,
            heartbeat_interval_secs: 6,
            scrub_min_interval_secs: 86_400.0,
            scrub_max_interval_secs: 7.0 * 86_400.0,
            interval_randomize_ratio: 0.5,
        }
    }
}

impl ScrubConfig {
    /// Parse a JSON document and validate the result.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| ScrubError::Json(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its permitted range.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.scrub_backoff_ratio) {
            return Err(ScrubError::invalid_config(
                "scrub_backoff_ratio",
                format!("must be in [0, 1], got {}", self.scrub_backoff_ratio),
            ));
        }
        check_max("begin_week_day", self.begin_week_day, 6)?;
        check_max("end_week_day", self.end_week_day, 6)?;
        check_max("begin_hour", self.begin_hour, 23)?;
        check_max("end_hour", self.end_hour, 23)?;
        check_non_negative("load_threshold", self.load_threshold)?;
        check_non_negative("scrub_sleep_secs", self.scrub_sleep_secs)?;
        check_non_negative("scrub_extended_sleep_secs", self.scrub_extended_sleep_secs)?;
        check_non_negative("scrub_min_interval_secs", self.scrub_min_interval_secs)?;
        check_non_negative("interval_randomize_ratio", self.interval_randomize_ratio)?;
        if !self.scrub_max_interval_secs.is_finite() {
            return Err(ScrubError::invalid_config(
                "scrub_max_interval_secs",
                "must be finite",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn scrub_sleep(&self) -> Duration {
        secs_to_duration(self.scrub_sleep_secs)
    }

    #[must_use]
    pub fn scrub_extended_sleep(&self) -> Duration {
        secs_to_duration(self.scrub_extended_sleep_secs)
    }
}

fn check_max(field: &'static str, value: u8, max: u8) -> Result<()> {
    if value > max {
        return Err(ScrubError::invalid_config(
            field,
            format!("must be in 0..={max}, got {value}"),
        ));
    }
    Ok(())
}

fn check_non_negative(field: &'static str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ScrubError::invalid_config(
            field,
            format!("must be finite and >= 0, got {value}"),
        ));
    }
    Ok(())
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

// ── ConfigCell ──────────────────────────────────────────────────────────────

/// Atomically replaceable configuration snapshot.
///
/// Readers call [`load`](Self::load) and never block; writers publish a new
/// snapshot with [`update`](Self::update), which rejects invalid configs and
/// leaves the current snapshot in place.
pub struct ConfigCell {
    inner: ArcSwap<ScrubConfig>,
    update_count: AtomicU64,
}

impl fmt::Debug for ConfigCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigCell")
            .field("config", &*self.load_full())
            .field("update_count", &self.update_count())
            .finish()
    }
}

impl Default for ConfigCell {
    fn default() -> Self {
        Self {
            inner: ArcSwap::from_pointee(ScrubConfig::default()),
            update_count: AtomicU64::new(0),
        }
    }
}

impl ConfigCell {
    /// Create a cell holding a validated configuration.
    pub fn new(config: ScrubConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: ArcSwap::from_pointee(config),
            update_count: AtomicU64::new(0),
        })
    }

    /// Borrow the current snapshot. Keep the guard short-lived.
    #[inline]
    pub fn load(&self) -> arc_swap::Guard<Arc<ScrubConfig>> {
        self.inner.load()
    }

    /// Clone the current snapshot's `Arc`.
    #[inline]
    pub fn load_full(&self) -> Arc<ScrubConfig> {
        self.inner.load_full()
    }

    /// Validate and publish a new snapshot.
    pub fn update(&self, config: ScrubConfig) -> Result<()> {
        if let Err(err) = config.validate() {
            warn!(target: "scrubd::sched::config", error = %err, "config_update_rejected");
            return Err(err);
        }
        self.inner.store(Arc::new(config));
        let count = self.update_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(target: "scrubd::sched::config", update_count = count, "config_cell_update");
        Ok(())
    }

    /// Number of snapshots published since creation.
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}
