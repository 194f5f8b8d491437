//! Node-level scrub scheduler.
//!
//! [`OsdScrub`] runs one scheduling pass per tick: decide whether this node
//! may start a scrub at all, ask the queue for ranked candidates, and try
//! them in order until one PG accepts or local slots run out. A pass starts
//! at most one scrub.
//!
//! Admission, in order:
//!
//! 1. random backoff (`scrub_backoff_ratio`) thins out passes;
//! 2. a free local slot is required;
//! 3. no other PG may be mid-way through reserving replicas (the gate);
//! 4. time window and host load narrow the pass to overdue jobs when
//!    unfavorable;
//! 5. during recovery, scrubbing stops unless configured otherwise, in
//!    which case only operator-requested repairs may start.
//!
//! The gate is set before each candidate attempt. A pass that ends without
//! initiating a scrub clears it. When a scrub is initiated, the gate stays
//! set until the PG's replica reservation round concludes.
//!
//! # Logging
//!
//! - **TRACE** `scrubd::sched::osd_scrub`: `backoff` / `candidate_skipped` / `no_scrub_started`
//! - **DEBUG** `scrubd::sched::osd_scrub`: `initiate_scrub` / `pgs_blocked` / `slots_exhausted` / `reserving_in_progress`
//! - **DEBUG** `scrubd::sched::osd_scrub`: `recovery_active` / `recovery_repair_only` / `scrub_initiated` / `no_local_resources`
//! - **INFO** `scrubd::sched::osd_scrub`: `config_change_rescheduled`
//! - **WARN** `scrubd::sched::osd_scrub`: `pass_overlap` — a pass was requested while another was running

use jiff::Zoned;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use scrubd_error::Result;
use scrubd_types::{
    OsdId, OsdRestrictions, PgId, PgScrubInfo, PoolScrubOptions, RequestedScrub, SchedParams,
    ScheduleResult,
};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ConfigCell;
use crate::job::ScrubJobRef;
use crate::load::{HostLoad, LoadSource, LoadTracker};
use crate::pg::PgAccessor;
use crate::queue::ScrubQueue;
use crate::resources::ScrubResources;
use crate::schedule;
use crate::time_window;

/// One candidate tried during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrubAttempt {
    pub pgid: PgId,
    pub result: ScheduleResult,
}

/// What a scheduling pass did.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PassSummary {
    /// Restrictions in force, or `None` if the pass was suppressed before
    /// looking at candidates.
    pub restrictions: Option<OsdRestrictions>,
    /// Number of candidates the queue offered.
    pub candidates: usize,
    /// Attempts in the order they were made.
    pub attempts: Vec<ScrubAttempt>,
    /// The PG on which a scrub was initiated, if any.
    pub initiated: Option<PgId>,
}

impl PassSummary {
    #[must_use]
    pub fn was_suppressed(&self) -> bool {
        self.restrictions.is_none()
    }

    /// Outcome of the final attempt, if any candidate was tried.
    #[must_use]
    pub fn last_result(&self) -> Option<ScheduleResult> {
        self.attempts.last().map(|attempt| attempt.result)
    }
}

/// The scrub scheduler of one storage node.
pub struct OsdScrub {
    osd: OsdId,
    config: Arc<ConfigCell>,
    queue: Arc<dyn ScrubQueue>,
    pgs: Arc<dyn PgAccessor>,
    resources: Arc<ScrubResources>,
    load: Mutex<LoadTracker>,
    clock: Arc<dyn Clock>,
    backoff_rng: Mutex<Pcg64>,
    pass: Mutex<()>,
}

impl std::fmt::Debug for OsdScrub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsdScrub")
            .field("osd", &self.osd)
            .field("resources", &self.resources)
            .field("load", &*self.load.lock())
            .finish_non_exhaustive()
    }
}

impl OsdScrub {
    /// Scheduler reading the host load averages and time from the
    /// system clock.
    pub fn new(
        osd: OsdId,
        config: Arc<ConfigCell>,
        queue: Arc<dyn ScrubQueue>,
        pgs: Arc<dyn PgAccessor>,
        resources: Arc<ScrubResources>,
    ) -> Self {
        Self {
            osd,
            config,
            queue,
            pgs,
            resources,
            load: Mutex::new(LoadTracker::new(Arc::new(HostLoad::new()))),
            clock: Arc::new(SystemClock),
            backoff_rng: Mutex::new(Pcg64::from_entropy()),
            pass: Mutex::new(()),
        }
    }

    /// Replace the load source. The daily average is re-seeded from it.
    #[must_use]
    pub fn with_load_source(mut self, source: Arc<dyn LoadSource>) -> Self {
        self.load = Mutex::new(LoadTracker::new(source));
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make backoff decisions reproducible.
    #[must_use]
    pub fn with_backoff_seed(mut self, seed: u64) -> Self {
        self.backoff_rng = Mutex::new(Pcg64::seed_from_u64(seed));
        self
    }

    #[must_use]
    pub fn osd(&self) -> OsdId {
        self.osd
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigCell> {
        &self.config
    }

    #[must_use]
    pub fn resources(&self) -> &Arc<ScrubResources> {
        &self.resources
    }

    // ── Scheduling pass ─────────────────────────────────────────────────────

    /// Run one scheduling pass.
    pub fn initiate_scrub(&self, is_recovery_active: bool) -> PassSummary {
        let Some(_pass) = self.pass.try_lock() else {
            warn!(target: "scrubd::sched::osd_scrub", osd = %self.osd, "pass_overlap");
            return PassSummary::default();
        };

        let blocked = self.queue.blocked_pgs_count();
        if blocked > 0 {
            debug!(target: "scrubd::sched::osd_scrub", osd = %self.osd, blocked, "pgs_blocked");
        }

        let now = self.clock.now();
        debug!(
            target: "scrubd::sched::osd_scrub",
            osd = %self.osd,
            now = %now,
            is_recovery_active,
            "initiate_scrub"
        );

        let Some(restrictions) = self.restrictions_on_scrubbing(is_recovery_active, &now) else {
            return PassSummary::default();
        };

        let candidates = self.queue.ready_to_scrub(&restrictions, now.timestamp());
        let mut summary = PassSummary {
            restrictions: Some(restrictions),
            candidates: candidates.len(),
            ..PassSummary::default()
        };

        for pgid in candidates {
            self.queue.set_reserving_now();
            let result = self.initiate_a_scrub(pgid, restrictions.allow_requested_repair_only());
            summary.attempts.push(ScrubAttempt { pgid, result });

            match result {
                ScheduleResult::ScrubInitiated => {
                    debug!(target: "scrubd::sched::osd_scrub", pg = %pgid, "scrub_initiated");
                    self.queue.scrub_initiated(pgid);
                    summary.initiated = Some(pgid);
                }
                ScheduleResult::NoLocalResources => {
                    debug!(target: "scrubd::sched::osd_scrub", pg = %pgid, "no_local_resources");
                }
                ScheduleResult::AlreadyStarted
                | ScheduleResult::Preconditions
                | ScheduleResult::BadPgState
                | ScheduleResult::NoSuchPg => {
                    trace!(
                        target: "scrubd::sched::osd_scrub",
                        pg = %pgid,
                        result = result.as_str(),
                        "candidate_skipped"
                    );
                }
            }
            if result.ends_pass() {
                break;
            }
        }

        if summary.initiated.is_none() {
            self.queue.clear_reserving_now();
            trace!(
                target: "scrubd::sched::osd_scrub",
                attempts = summary.attempts.len(),
                "no_scrub_started"
            );
        }
        summary
    }

    /// Node-wide admission for a pass at `now`. `None` means no scrub may
    /// start in this pass.
    pub fn restrictions_on_scrubbing(
        &self,
        is_recovery_active: bool,
        now: &Zoned,
    ) -> Option<OsdRestrictions> {
        let config = self.config.load_full();

        if self.lost_coin_flip(config.scrub_backoff_ratio) {
            trace!(
                target: "scrubd::sched::osd_scrub",
                ratio = config.scrub_backoff_ratio,
                "backoff"
            );
            return None;
        }

        if !self.resources.can_inc_scrubs() {
            debug!(target: "scrubd::sched::osd_scrub", resources = %self.resources, "slots_exhausted");
            return None;
        }

        if self.queue.is_reserving_now() {
            debug!(target: "scrubd::sched::osd_scrub", "reserving_in_progress");
            return None;
        }

        let time_permit = time_window::scrub_time_permit(&config, now);
        let load_is_low = self.load.lock().scrub_load_below_threshold(config.load_threshold);
        let mut restrictions = OsdRestrictions::new(time_permit, load_is_low);

        if is_recovery_active && !config.scrub_during_recovery {
            if !config.repair_during_recovery {
                debug!(target: "scrubd::sched::osd_scrub", "recovery_active");
                return None;
            }
            debug!(target: "scrubd::sched::osd_scrub", "recovery_repair_only");
            restrictions = restrictions.with_requested_repair_only();
        }

        Some(restrictions)
    }

    /// Try to start a scrub on one candidate. The PG lock is held only for
    /// the duration of this call.
    pub fn initiate_a_scrub(&self, pgid: PgId, allow_requested_repair_only: bool) -> ScheduleResult {
        trace!(target: "scrubd::sched::osd_scrub", pg = %pgid, "trying_pg");

        let Some(mut pg) = self.pgs.get_locked_pg(pgid) else {
            return ScheduleResult::NoSuchPg;
        };
        if pg.is_scrub_queued_or_active() {
            return ScheduleResult::AlreadyStarted;
        }
        if allow_requested_repair_only && !pg.planned_scrub().must_repair {
            return ScheduleResult::Preconditions;
        }
        pg.sched_scrub()
    }

    fn lost_coin_flip(&self, ratio: f64) -> bool {
        if ratio.is_nan() || ratio <= 0.0 {
            return false;
        }
        self.backoff_rng.lock().gen_bool(ratio.min(1.0))
    }

    // ── Periodic and configuration hooks ────────────────────────────────────

    /// Recompute every registered job's schedule from its PG.
    pub fn on_config_change(&self) {
        let jobs = self.queue.list_registered_jobs();
        let mut rescheduled = 0_usize;
        for job in &jobs {
            let Some(mut pg) = self.pgs.get_locked_pg(job.pgid()) else {
                continue;
            };
            pg.on_scrub_schedule_input_change();
            rescheduled += 1;
        }
        info!(
            target: "scrubd::sched::osd_scrub",
            osd = %self.osd,
            registered = jobs.len(),
            rescheduled,
            "config_change_rescheduled"
        );
    }

    /// Heartbeat hook: fold the current load into the daily average.
    pub fn update_load_average(&self) -> Option<f64> {
        let heartbeat = self.config.load().heartbeat_interval_secs;
        self.load.lock().update_load_average(heartbeat)
    }

    #[must_use]
    pub fn daily_loadavg(&self) -> f64 {
        self.load.lock().daily_loadavg()
    }

    #[must_use]
    pub fn scrub_time_permit(&self) -> bool {
        time_window::scrub_time_permit(&self.config.load(), &self.clock.now())
    }

    #[must_use]
    pub fn scrub_sleep_time(&self, high_priority: bool) -> Duration {
        time_window::scrub_sleep_time(&self.config.load(), &self.clock.now(), high_priority)
    }

    #[must_use]
    pub fn determine_scrub_time(
        &self,
        request: &RequestedScrub,
        info: &PgScrubInfo,
        pool: &PoolScrubOptions,
    ) -> SchedParams {
        schedule::determine_scrub_time(request, info, pool, self.clock.now().timestamp())
    }

    // ── Forwards ────────────────────────────────────────────────────────────

    pub fn register_with_osd(&self, job: &ScrubJobRef, params: &SchedParams) {
        self.queue.register_with_osd(job, params);
    }

    pub fn update_job(&self, job: &ScrubJobRef, params: &SchedParams) {
        self.queue.update_job(job, params);
    }

    pub fn remove_from_osd_queue(&self, job: &ScrubJobRef) {
        self.queue.remove_from_osd_queue(job);
    }

    pub fn inc_scrubs_local(&self) -> bool {
        self.resources.inc_scrubs_local()
    }

    pub fn dec_scrubs_local(&self) {
        self.resources.dec_scrubs_local();
    }

    pub fn inc_scrubs_remote(&self) -> bool {
        self.resources.inc_scrubs_remote()
    }

    pub fn dec_scrubs_remote(&self) {
        self.resources.dec_scrubs_remote();
    }

    pub fn mark_pg_scrub_blocked(&self, pgid: PgId) {
        self.queue.mark_pg_scrub_blocked(pgid);
    }

    pub fn clear_pg_scrub_blocked(&self, pgid: PgId) {
        self.queue.clear_pg_scrub_blocked(pgid);
    }

    #[must_use]
    pub fn blocked_pgs_count(&self) -> usize {
        self.queue.blocked_pgs_count()
    }

    pub fn set_reserving_now(&self) {
        self.queue.set_reserving_now();
    }

    pub fn clear_reserving_now(&self) {
        self.queue.clear_reserving_now();
    }

    #[must_use]
    pub fn is_reserving_now(&self) -> bool {
        self.queue.is_reserving_now()
    }

    pub fn dump_scrubs(&self, sink: &mut dyn Write) -> Result<()> {
        self.queue.dump_scrubs(sink)
    }
}
