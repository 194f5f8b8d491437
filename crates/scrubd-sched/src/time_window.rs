//! Operator time windows for scrubbing.
//!
//! Windows are half-open ranges on a ring (weekdays `0..7` with Sunday = 0,
//! hours `0..24`). A window whose end precedes its start wraps around, so
//! `begin_hour = 22, end_hour = 6` permits the night. Equal bounds mean
//! "always".
//!
//! # Logging
//!
//! - **TRACE** `scrubd::sched::time_window`: `time_permit` — window verdict with bounds and the tested value
//! - **TRACE** `scrubd::sched::time_window`: `extended_sleep` — scrub running in forbidden hours is throttled

use jiff::Zoned;
use std::time::Duration;
use tracing::trace;

use crate::config::ScrubConfig;

/// Is `point` inside `[from, till)` on a ring?
///
/// `from == till` is defined as the full ring.
#[inline]
#[must_use]
pub fn isbetween_modulo(from: i64, till: i64, point: i64) -> bool {
    (till == from) || ((till >= from) ^ (point >= from) ^ (point < till))
}

/// Whether `now` falls inside both the weekday and the hour window.
#[must_use]
pub fn scrub_time_permit(config: &ScrubConfig, now: &Zoned) -> bool {
    let week_day = i64::from(now.weekday().to_sunday_zero_offset());
    let day_permits = isbetween_modulo(
        i64::from(config.begin_week_day),
        i64::from(config.end_week_day),
        week_day,
    );
    if !day_permits {
        trace!(
            target: "scrubd::sched::time_window",
            begin = config.begin_week_day,
            end = config.end_week_day,
            week_day,
            permitted = false,
            "time_permit"
        );
        return false;
    }

    let hour = i64::from(now.hour());
    let hour_permits = isbetween_modulo(
        i64::from(config.begin_hour),
        i64::from(config.end_hour),
        hour,
    );
    trace!(
        target: "scrubd::sched::time_window",
        begin = config.begin_hour,
        end = config.end_hour,
        hour,
        permitted = hour_permits,
        "time_permit"
    );
    hour_permits
}

/// Pause between scrub chunks.
///
/// High-priority scrubs, and any scrub inside the permitted window, use the
/// regular sleep. A scrub that started in the window but ran past its end is
/// throttled with the extended sleep (never shorter than the regular one)
/// instead of being aborted.
#[must_use]
pub fn scrub_sleep_time(config: &ScrubConfig, now: &Zoned, high_priority: bool) -> Duration {
    let regular = config.scrub_sleep();
    if high_priority || scrub_time_permit(config, now) {
        return regular;
    }

    let extended = config.scrub_extended_sleep();
    trace!(
        target: "scrubd::sched::time_window",
        regular_ms = regular.as_millis(),
        extended_ms = extended.as_millis(),
        "extended_sleep"
    );
    extended.max(regular)
}
