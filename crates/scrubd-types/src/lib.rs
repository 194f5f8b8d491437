#![forbid(unsafe_code)]
//! Value types for the scrub scheduling core.
//!
//! Everything here is plain data: identifiers, scheduling parameters, the
//! per-pass [`OsdRestrictions`] snapshot and the closed set of initiation
//! outcomes ([`ScheduleResult`]). Behaviour lives in `scrubd-sched`.

use jiff::Timestamp;
use scrubd_error::ScrubError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OsdId(pub u32);

impl fmt::Display for OsdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "osd.{}", self.0)
    }
}

/// Placement-group identifier: pool, placement seed and optional shard.
///
/// Rendered as `<pool>.<seed-hex>` with an `s<shard>` suffix for sharded
/// (erasure-coded) groups, e.g. `1.2a` or `7.1fs2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PgId {
    pub pool: u64,
    pub seed: u32,
    pub shard: Option<u8>,
}

impl PgId {
    #[must_use]
    pub fn new(pool: u64, seed: u32) -> Self {
        Self {
            pool,
            seed,
            shard: None,
        }
    }

    #[must_use]
    pub fn with_shard(self, shard: u8) -> Self {
        Self {
            shard: Some(shard),
            ..self
        }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)?;
        if let Some(shard) = self.shard {
            write!(f, "s{shard}")?;
        }
        Ok(())
    }
}

impl FromStr for PgId {
    type Err = ScrubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScrubError::InvalidPgId(s.to_owned());

        let (pool, rest) = s.split_once('.').ok_or_else(invalid)?;
        let (seed, shard) = match rest.split_once('s') {
            Some((seed, shard)) => (seed, Some(shard)),
            None => (rest, None),
        };

        let pool = pool.parse::<u64>().map_err(|_| invalid())?;
        let seed = u32::from_str_radix(seed, 16).map_err(|_| invalid())?;
        let shard = shard
            .map(str::parse::<u8>)
            .transpose()
            .map_err(|_| invalid())?;

        Ok(Self { pool, seed, shard })
    }
}

impl From<PgId> for String {
    fn from(pgid: PgId) -> Self {
        pgid.to_string()
    }
}

impl TryFrom<String> for PgId {
    type Error = ScrubError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ── Scheduling parameters ───────────────────────────────────────────────────

/// Whether a scrub was explicitly demanded (operator request, repair, or an
/// automatic trigger) and so bypasses the periodic interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MustScrub {
    #[default]
    NotMandatory,
    Mandatory,
}

/// Scheduling input for one PG, as suggested by the PG to the queue.
///
/// Interval overrides are in seconds; `None` means "use the node-wide
/// configured interval".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedParams {
    /// Base time: the last scrub stamp for periodic scrubs, or "now" for
    /// mandatory ones.
    pub proposed_time: Timestamp,
    pub min_interval: Option<f64>,
    pub max_interval: Option<f64>,
    pub is_must: MustScrub,
}

impl SchedParams {
    /// Parameters for an urgent scrub starting at `now`.
    #[must_use]
    pub fn mandatory(now: Timestamp) -> Self {
        Self {
            proposed_time: now,
            min_interval: None,
            max_interval: None,
            is_must: MustScrub::Mandatory,
        }
    }
}

/// Concrete schedule computed for a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubSchedule {
    /// Earliest time the job is eligible ("ripe").
    pub scheduled_at: Timestamp,
    /// Time after which the job is overdue and exempt from load/time
    /// suppression. `None` means the job never becomes overdue.
    pub deadline: Option<Timestamp>,
}

impl ScrubSchedule {
    #[must_use]
    pub fn is_ripe(&self, now: Timestamp) -> bool {
        self.scheduled_at <= now
    }

    #[must_use]
    pub fn is_deadlined(&self, now: Timestamp) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Scrub the PG has been asked to perform next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestedScrub {
    /// Operator-requested scrub.
    pub must_scrub: bool,
    /// Operator-requested deep scrub.
    pub must_deep_scrub: bool,
    /// Operator-requested repair. The only kind allowed while recovery
    /// restricts scrubbing to repairs.
    pub must_repair: bool,
    /// Automatic follow-up scrub (e.g. after a repair).
    pub need_auto: bool,
}

impl RequestedScrub {
    #[must_use]
    pub fn is_mandatory(&self) -> bool {
        self.must_scrub || self.must_deep_scrub || self.must_repair || self.need_auto
    }
}

/// The subset of PG history the scheduler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgScrubInfo {
    pub last_scrub_stamp: Timestamp,
    pub last_deep_scrub_stamp: Timestamp,
}

impl PgScrubInfo {
    #[must_use]
    pub fn scrubbed_at(stamp: Timestamp) -> Self {
        Self {
            last_scrub_stamp: stamp,
            last_deep_scrub_stamp: stamp,
        }
    }
}

/// Per-pool interval overrides, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoolScrubOptions {
    pub scrub_min_interval: Option<f64>,
    pub scrub_max_interval: Option<f64>,
}

// ── Per-pass restrictions ───────────────────────────────────────────────────

/// Node-wide restrictions computed at the start of a scheduling pass.
///
/// Invariant: `only_deadlined == !(time_permit && load_is_low)`. The fields
/// are private and the value is only built through [`OsdRestrictions::new`],
/// so the invariant cannot be broken by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OsdRestrictions {
    time_permit: bool,
    load_is_low: bool,
    only_deadlined: bool,
    allow_requested_repair_only: bool,
}

impl OsdRestrictions {
    #[must_use]
    pub fn new(time_permit: bool, load_is_low: bool) -> Self {
        Self {
            time_permit,
            load_is_low,
            only_deadlined: !(time_permit && load_is_low),
            allow_requested_repair_only: false,
        }
    }

    /// Narrow these restrictions to operator-requested repairs only.
    #[must_use]
    pub fn with_requested_repair_only(self) -> Self {
        Self {
            allow_requested_repair_only: true,
            ..self
        }
    }

    #[must_use]
    pub fn time_permit(&self) -> bool {
        self.time_permit
    }

    #[must_use]
    pub fn load_is_low(&self) -> bool {
        self.load_is_low
    }

    /// Only overdue jobs may be selected.
    #[must_use]
    pub fn only_deadlined(&self) -> bool {
        self.only_deadlined
    }

    #[must_use]
    pub fn allow_requested_repair_only(&self) -> bool {
        self.allow_requested_repair_only
    }
}

impl fmt::Display for OsdRestrictions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "time_permit={} load_is_low={} only_deadlined={} repair_only={}",
            self.time_permit, self.load_is_low, self.only_deadlined, self.allow_requested_repair_only
        )
    }
}

// ── Initiation outcomes ─────────────────────────────────────────────────────

/// Outcome of one attempt to start a scrub on a candidate PG.
///
/// The set is closed and matched exhaustively by the scheduler. "No attempt
/// was made" is not a variant: the pass loop represents it as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleResult {
    /// The PG accepted and queued the scrub.
    ScrubInitiated,
    /// A scrub is already queued or running on the PG.
    AlreadyStarted,
    /// The PG is not in a state that allows scrubbing (not active/clean).
    BadPgState,
    /// No local scrub slot could be reserved. Ends the pass.
    NoLocalResources,
    /// The PG's planned scrub is excluded by the current restrictions.
    Preconditions,
    /// The PG disappeared between candidate selection and the attempt.
    NoSuchPg,
}

impl ScheduleResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScrubInitiated => "scrub_initiated",
            Self::AlreadyStarted => "already_started",
            Self::BadPgState => "bad_pg_state",
            Self::NoLocalResources => "no_local_resources",
            Self::Preconditions => "preconditions",
            Self::NoSuchPg => "no_such_pg",
        }
    }

    /// True when no further candidate should be tried in this pass.
    #[must_use]
    pub fn ends_pass(self) -> bool {
        matches!(self, Self::ScrubInitiated | Self::NoLocalResources)
    }
}

impl fmt::Display for ScheduleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
