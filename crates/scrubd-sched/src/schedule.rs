//! Turning PG history and requests into a concrete scrub schedule.
//!
//! Two steps, both pure:
//!
//! 1. [`determine_scrub_time`] is the PG's view. It picks the base time and
//!    interval overrides, and decides whether the scrub is mandatory.
//! 2. [`compute_schedule`] is the node's view. It applies configured
//!    intervals and random spread to produce `scheduled_at` and `deadline`.

use jiff::{SignedDuration, Timestamp};
use scrubd_types::{
    MustScrub, PgScrubInfo, PoolScrubOptions, RequestedScrub, SchedParams, ScrubSchedule,
};

use crate::config::ScrubConfig;

/// Scheduling input for a PG.
///
/// Any pending request (operator scrub, deep scrub, repair, automatic
/// follow-up) makes the scrub mandatory starting `now`. Otherwise the next
/// periodic scrub is based on the last scrub stamp with the pool's interval
/// overrides.
#[must_use]
pub fn determine_scrub_time(
    request: &RequestedScrub,
    info: &PgScrubInfo,
    pool: &PoolScrubOptions,
    now: Timestamp,
) -> SchedParams {
    if request.is_mandatory() {
        return SchedParams::mandatory(now);
    }
    SchedParams {
        proposed_time: info.last_scrub_stamp,
        min_interval: pool.scrub_min_interval,
        max_interval: pool.scrub_max_interval,
        is_must: MustScrub::NotMandatory,
    }
}

/// Schedule for `params` under `config`.
///
/// `spread` is a uniform sample in `[0, 1)`; it scales the configured
/// randomize ratio so that PGs scrubbed together drift apart. Mandatory
/// scrubs are due (and overdue) immediately at their proposed time.
#[must_use]
pub fn compute_schedule(config: &ScrubConfig, params: &SchedParams, spread: f64) -> ScrubSchedule {
    if params.is_must == MustScrub::Mandatory {
        return ScrubSchedule {
            scheduled_at: params.proposed_time,
            deadline: Some(params.proposed_time),
        };
    }

    let min_interval = params
        .min_interval
        .filter(|secs| *secs > 0.0)
        .unwrap_or(config.scrub_min_interval_secs);
    let max_interval = params
        .max_interval
        .filter(|secs| *secs > 0.0)
        .unwrap_or(config.scrub_max_interval_secs);

    let jitter = spread.clamp(0.0, 1.0) * config.interval_randomize_ratio * min_interval;
    let scheduled_at = add_secs(params.proposed_time, min_interval + jitter);
    let deadline = (max_interval > 0.0).then(|| add_secs(params.proposed_time, max_interval));

    ScrubSchedule {
        scheduled_at,
        deadline,
    }
}

/// `base + secs`, saturating at the end of the representable range.
fn add_secs(base: Timestamp, secs: f64) -> Timestamp {
    SignedDuration::try_from_secs_f64(secs)
        .ok()
        .and_then(|offset| base.checked_add(offset).ok())
        .unwrap_or(Timestamp::MAX)
}
