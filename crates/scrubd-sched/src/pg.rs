//! Placement-group access for the scheduler.
//!
//! The scheduler never owns PGs. It asks a [`PgAccessor`] for a locked
//! handle ([`LockedPg`]), runs its checks, and drops the handle before
//! moving to the next candidate.
//!
//! [`PgMap`] is a self-contained accessor that tracks the scrub-relevant
//! state of each PG on the node: its job, scrub history, pool overrides,
//! pending operator requests and the current scrub phase. It drives the
//! other half of the reservation gate: the gate set by a scheduling pass is
//! cleared here once the replica reservation round concludes.
//!
//! # Logging
//!
//! - **DEBUG** `scrubd::sched::pg`: `pg_added` / `pg_removed` / `scrub_requested`
//! - **DEBUG** `scrubd::sched::pg`: `reserving_replicas` / `not_active_clean`
//! - **INFO** `scrubd::sched::pg`: `reservation_granted` / `reservation_denied` / `scrub_finished`
//! - **WARN** `scrubd::sched::pg`: `unexpected_phase` — lifecycle event for a PG in the wrong phase

use jiff::Timestamp;
use parking_lot::{Mutex, RwLock};
use scrubd_error::{Result, ScrubError};
use scrubd_types::{
    OsdId, PgId, PgScrubInfo, PoolScrubOptions, RequestedScrub, ScheduleResult,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::DerefMut;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::job::{ScrubJob, ScrubJobRef};
use crate::queue::ScrubQueue;
use crate::resources::ScrubResources;
use crate::schedule::determine_scrub_time;

/// A PG held under its lock.
pub trait LockedPg {
    fn pgid(&self) -> PgId;

    /// A scrub is queued (reserving replicas) or running.
    fn is_scrub_queued_or_active(&self) -> bool;

    /// Pending operator or automatic scrub request.
    fn planned_scrub(&self) -> RequestedScrub;

    /// Try to start a scrub: reserve a local slot and begin the replica
    /// reservation round.
    fn sched_scrub(&mut self) -> ScheduleResult;

    /// Recompute the PG's schedule after a configuration change.
    fn on_scrub_schedule_input_change(&mut self);
}

/// Lookup of PGs by id.
pub trait PgAccessor: Send + Sync {
    /// The PG, locked, or `None` if it does not exist here.
    fn get_locked_pg(&self, pgid: PgId) -> Option<Box<dyn LockedPg + '_>>;
}

/// Where a PG is in its scrub lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrubPhase {
    /// Waiting in the queue (or not eligible).
    Idle,
    /// Local slot taken; waiting for replicas to grant their slots.
    Reserving,
    /// Scrub running.
    Active,
}

#[derive(Debug)]
struct PgScrubState {
    job: ScrubJobRef,
    info: PgScrubInfo,
    pool: PoolScrubOptions,
    planned: RequestedScrub,
    /// Requests consumed by the scrub that is reserving or running.
    in_flight: RequestedScrub,
    active_clean: bool,
    phase: ScrubPhase,
}

/// Scrub-side registry of the PGs hosted on one node.
pub struct PgMap {
    osd: OsdId,
    queue: Arc<dyn ScrubQueue>,
    resources: Arc<ScrubResources>,
    clock: Arc<dyn Clock>,
    pgs: RwLock<BTreeMap<PgId, Arc<Mutex<PgScrubState>>>>,
}

impl std::fmt::Debug for PgMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgMap")
            .field("osd", &self.osd)
            .field("pgs", &self.pgs.read().len())
            .finish_non_exhaustive()
    }
}

impl PgMap {
    #[must_use]
    pub fn new(
        osd: OsdId,
        queue: Arc<dyn ScrubQueue>,
        resources: Arc<ScrubResources>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            osd,
            queue,
            resources,
            clock,
            pgs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Start tracking `pgid` and register its job with the queue.
    ///
    /// New PGs are active+clean. Adding a PG that is already tracked returns
    /// the existing job unchanged.
    pub fn add_pg(&self, pgid: PgId, info: PgScrubInfo, pool: PoolScrubOptions) -> ScrubJobRef {
        let mut pgs = self.pgs.write();
        if let Some(existing) = pgs.get(&pgid) {
            return Arc::clone(&existing.lock().job);
        }

        let state = PgScrubState {
            job: ScrubJob::new(pgid, self.osd),
            info,
            pool,
            planned: RequestedScrub::default(),
            in_flight: RequestedScrub::default(),
            active_clean: true,
            phase: ScrubPhase::Idle,
        };
        self.reschedule(&state);
        let job = Arc::clone(&state.job);
        pgs.insert(pgid, Arc::new(Mutex::new(state)));
        debug!(target: "scrubd::sched::pg", pg = %pgid, "pg_added");
        job
    }

    /// Stop tracking `pgid`. Slots held by an in-flight scrub are released.
    pub fn remove_pg(&self, pgid: PgId) -> Result<()> {
        let entry = self
            .pgs
            .write()
            .remove(&pgid)
            .ok_or_else(|| ScrubError::UnknownPg(pgid.to_string()))?;
        let mut state = entry.lock();
        if state.job.is_registered() {
            self.queue.remove_from_osd_queue(&state.job);
        }
        match state.phase {
            ScrubPhase::Idle => {}
            ScrubPhase::Reserving => {
                self.resources.dec_scrubs_local();
                self.queue.clear_reserving_now();
            }
            ScrubPhase::Active => self.resources.dec_scrubs_local(),
        }
        state.phase = ScrubPhase::Idle;
        state.in_flight = RequestedScrub::default();
        debug!(target: "scrubd::sched::pg", pg = %pgid, "pg_removed");
        Ok(())
    }

    /// Operator request: scrub `pgid` as soon as possible.
    ///
    /// A request made while a scrub is reserving or running is kept for the
    /// scrub after it.
    pub fn request_scrub(&self, pgid: PgId, deep: bool, repair: bool) -> Result<()> {
        let entry = self.entry(pgid)?;
        let mut state = entry.lock();
        state.planned.must_scrub = true;
        state.planned.must_deep_scrub |= deep;
        state.planned.must_repair |= repair;
        if state.phase == ScrubPhase::Idle {
            self.reschedule(&state);
        }
        debug!(target: "scrubd::sched::pg", pg = %pgid, deep, repair, "scrub_requested");
        Ok(())
    }

    pub fn set_active_clean(&self, pgid: PgId, active_clean: bool) -> Result<()> {
        self.entry(pgid)?.lock().active_clean = active_clean;
        Ok(())
    }

    /// Replace the pool's interval overrides and reschedule.
    pub fn set_pool_options(&self, pgid: PgId, pool: PoolScrubOptions) -> Result<()> {
        let entry = self.entry(pgid)?;
        let mut state = entry.lock();
        state.pool = pool;
        if state.phase == ScrubPhase::Idle {
            self.reschedule(&state);
        }
        Ok(())
    }

    /// The replica reservation round for `pgid` finished.
    ///
    /// Opens the reservation gate. On denial the local slot is released, the
    /// requests the scrub had taken are pending again and the PG goes back
    /// into the queue.
    pub fn reservation_concluded(&self, pgid: PgId, granted: bool) -> Result<()> {
        let entry = self.entry(pgid)?;
        let mut state = entry.lock();
        if state.phase != ScrubPhase::Reserving {
            warn!(
                target: "scrubd::sched::pg",
                pg = %pgid,
                phase = ?state.phase,
                event = "reservation_concluded",
                "unexpected_phase"
            );
            return Ok(());
        }

        self.queue.clear_reserving_now();
        if granted {
            state.phase = ScrubPhase::Active;
            info!(target: "scrubd::sched::pg", pg = %pgid, "reservation_granted");
        } else {
            state.phase = ScrubPhase::Idle;
            let unserved = std::mem::take(&mut state.in_flight);
            merge_requests(&mut state.planned, unserved);
            self.resources.dec_scrubs_local();
            self.reschedule(&state);
            info!(target: "scrubd::sched::pg", pg = %pgid, "reservation_denied");
        }
        Ok(())
    }

    /// The running scrub on `pgid` completed: record it, release the slot
    /// and schedule the next periodic scrub.
    pub fn scrub_finished(&self, pgid: PgId) -> Result<()> {
        let entry = self.entry(pgid)?;
        let mut state = entry.lock();
        if state.phase != ScrubPhase::Active {
            warn!(
                target: "scrubd::sched::pg",
                pg = %pgid,
                phase = ?state.phase,
                event = "scrub_finished",
                "unexpected_phase"
            );
            return Ok(());
        }

        self.resources.dec_scrubs_local();
        let now = self.now();
        state.info.last_scrub_stamp = now;
        let served = std::mem::take(&mut state.in_flight);
        if served.must_deep_scrub {
            state.info.last_deep_scrub_stamp = now;
        }
        state.phase = ScrubPhase::Idle;
        self.reschedule(&state);
        info!(target: "scrubd::sched::pg", pg = %pgid, stamp = %now, "scrub_finished");
        Ok(())
    }

    /// `pgid` is waiting on a locked object.
    pub fn mark_blocked(&self, pgid: PgId) {
        self.queue.mark_pg_scrub_blocked(pgid);
    }

    pub fn clear_blocked(&self, pgid: PgId) {
        self.queue.clear_pg_scrub_blocked(pgid);
    }

    #[must_use]
    pub fn phase(&self, pgid: PgId) -> Option<ScrubPhase> {
        Some(self.pgs.read().get(&pgid)?.lock().phase)
    }

    #[must_use]
    pub fn scrub_info(&self, pgid: PgId) -> Option<PgScrubInfo> {
        Some(self.pgs.read().get(&pgid)?.lock().info)
    }

    #[must_use]
    pub fn job(&self, pgid: PgId) -> Option<ScrubJobRef> {
        Some(Arc::clone(&self.pgs.read().get(&pgid)?.lock().job))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pgs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pgs.read().is_empty()
    }

    fn entry(&self, pgid: PgId) -> Result<Arc<Mutex<PgScrubState>>> {
        self.pgs
            .read()
            .get(&pgid)
            .cloned()
            .ok_or_else(|| ScrubError::UnknownPg(pgid.to_string()))
    }

    fn now(&self) -> Timestamp {
        self.clock.now().timestamp()
    }

    fn reschedule(&self, state: &PgScrubState) {
        let params = determine_scrub_time(&state.planned, &state.info, &state.pool, self.now());
        if state.job.is_registered() {
            self.queue.update_job(&state.job, &params);
        } else {
            self.queue.register_with_osd(&state.job, &params);
        }
    }
}

fn merge_requests(into: &mut RequestedScrub, from: RequestedScrub) {
    into.must_scrub |= from.must_scrub;
    into.must_deep_scrub |= from.must_deep_scrub;
    into.must_repair |= from.must_repair;
    into.need_auto |= from.need_auto;
}

struct PgHandle<'a, G> {
    map: &'a PgMap,
    pgid: PgId,
    state: G,
}

impl<G> LockedPg for PgHandle<'_, G>
where
    G: DerefMut<Target = PgScrubState>,
{
    fn pgid(&self) -> PgId {
        self.pgid
    }

    fn is_scrub_queued_or_active(&self) -> bool {
        self.state.phase != ScrubPhase::Idle
    }

    fn planned_scrub(&self) -> RequestedScrub {
        self.state.planned
    }

    fn sched_scrub(&mut self) -> ScheduleResult {
        if self.state.phase != ScrubPhase::Idle {
            return ScheduleResult::AlreadyStarted;
        }
        if !self.state.active_clean {
            debug!(target: "scrubd::sched::pg", pg = %self.pgid, "not_active_clean");
            return ScheduleResult::BadPgState;
        }
        if !self.map.resources.inc_scrubs_local() {
            return ScheduleResult::NoLocalResources;
        }
        self.state.phase = ScrubPhase::Reserving;
        self.state.in_flight = std::mem::take(&mut self.state.planned);
        debug!(target: "scrubd::sched::pg", pg = %self.pgid, "reserving_replicas");
        ScheduleResult::ScrubInitiated
    }

    fn on_scrub_schedule_input_change(&mut self) {
        if self.state.phase == ScrubPhase::Idle {
            self.map.reschedule(&self.state);
        }
    }
}

impl PgAccessor for PgMap {
    fn get_locked_pg(&self, pgid: PgId) -> Option<Box<dyn LockedPg + '_>> {
        let entry = self.pgs.read().get(&pgid).cloned()?;
        Some(Box::new(PgHandle {
            map: self,
            pgid,
            state: entry.lock_arc(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ConfigCell, ScrubConfig};
    use crate::queue::JobQueue;
    use jiff::tz::TimeZone;
    use jiff::{SignedDuration, Zoned};
    use scrubd_types::{MustScrub, OsdRestrictions};

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: Arc<JobQueue>,
        resources: Arc<ScrubResources>,
        map: PgMap,
    }

    fn fixture(max_local: u32) -> Fixture {
        let config = Arc::new(
            ConfigCell::new(ScrubConfig {
                max_scrubs_local: max_local,
                interval_randomize_ratio: 0.0,
                ..ScrubConfig::default()
            })
            .unwrap(),
        );
        let start = Zoned::new(Timestamp::from_second(10 * 86_400).unwrap(), TimeZone::UTC);
        let clock = Arc::new(ManualClock::new(start));
        let queue = Arc::new(JobQueue::with_seed(OsdId(0), Arc::clone(&config), 1));
        let resources = Arc::new(ScrubResources::new(config));
        let map = PgMap::new(OsdId(0), queue.clone(), resources.clone(), clock.clone());
        Fixture {
            clock,
            queue,
            resources,
            map,
        }
    }

    fn pg(seed: u32) -> PgId {
        PgId::new(1, seed)
    }

    fn add_scrubbed_at(fx: &Fixture, seed: u32, secs: i64) -> ScrubJobRef {
        let info = PgScrubInfo::scrubbed_at(Timestamp::from_second(secs).unwrap());
        fx.map.add_pg(pg(seed), info, PoolScrubOptions::default())
    }

    fn start(fx: &Fixture, seed: u32) -> ScheduleResult {
        let mut handle = fx.map.get_locked_pg(pg(seed)).unwrap();
        handle.sched_scrub()
    }

    #[test]
    fn added_pg_is_registered_from_last_scrub() {
        let fx = fixture(1);
        let job = add_scrubbed_at(&fx, 1, 0);
        assert!(job.is_registered());
        assert_eq!(job.schedule().scheduled_at, Timestamp::from_second(86_400).unwrap());
        assert_eq!(fx.map.len(), 1);

        let again = add_scrubbed_at(&fx, 1, 500);
        assert!(Arc::ptr_eq(&job, &again));
    }

    #[test]
    fn sched_scrub_reserves_a_local_slot() {
        let fx = fixture(1);
        add_scrubbed_at(&fx, 1, 0);
        add_scrubbed_at(&fx, 2, 0);

        assert_eq!(start(&fx, 1), ScheduleResult::ScrubInitiated);
        assert_eq!(fx.map.phase(pg(1)), Some(ScrubPhase::Reserving));
        assert_eq!(fx.resources.scrubs_local(), 1);

        assert_eq!(start(&fx, 1), ScheduleResult::AlreadyStarted);
        assert_eq!(start(&fx, 2), ScheduleResult::NoLocalResources);
        assert_eq!(fx.map.phase(pg(2)), Some(ScrubPhase::Idle));
    }

    #[test]
    fn unclean_pg_is_refused() {
        let fx = fixture(1);
        add_scrubbed_at(&fx, 1, 0);
        fx.map.set_active_clean(pg(1), false).unwrap();
        assert_eq!(start(&fx, 1), ScheduleResult::BadPgState);
        assert_eq!(fx.resources.scrubs_local(), 0);
    }

    #[test]
    fn missing_pg_yields_no_handle() {
        let fx = fixture(1);
        assert!(fx.map.get_locked_pg(pg(9)).is_none());
        assert!(matches!(fx.map.request_scrub(pg(9), false, false), Err(ScrubError::UnknownPg(_))));
    }

    #[test]
    fn granted_reservation_clears_gate_and_finishes() {
        let fx = fixture(1);
        add_scrubbed_at(&fx, 1, 0);
        fx.queue.set_reserving_now();
        assert_eq!(start(&fx, 1), ScheduleResult::ScrubInitiated);
        fx.queue.scrub_initiated(pg(1));

        fx.map.reservation_concluded(pg(1), true).unwrap();
        assert!(!fx.queue.is_reserving_now());
        assert_eq!(fx.map.phase(pg(1)), Some(ScrubPhase::Active));
        assert_eq!(fx.resources.scrubs_local(), 1);

        fx.clock.advance(SignedDuration::from_secs(60));
        fx.map.scrub_finished(pg(1)).unwrap();
        assert_eq!(fx.resources.scrubs_local(), 0);
        assert_eq!(fx.map.phase(pg(1)), Some(ScrubPhase::Idle));

        let stamp = fx.map.scrub_info(pg(1)).unwrap().last_scrub_stamp;
        assert_eq!(stamp, fx.clock.now().timestamp());
        let job = fx.map.job(pg(1)).unwrap();
        assert!(job.is_registered());
        assert_eq!(job.schedule().scheduled_at, stamp + SignedDuration::from_hours(24));
    }

    #[test]
    fn denied_reservation_requeues_and_releases_slot() {
        let fx = fixture(1);
        add_scrubbed_at(&fx, 1, 0);
        fx.queue.set_reserving_now();
        assert_eq!(start(&fx, 1), ScheduleResult::ScrubInitiated);
        fx.queue.scrub_initiated(pg(1));

        fx.map.reservation_concluded(pg(1), false).unwrap();
        assert!(!fx.queue.is_reserving_now());
        assert_eq!(fx.resources.scrubs_local(), 0);
        assert_eq!(fx.map.phase(pg(1)), Some(ScrubPhase::Idle));
        assert!(fx.map.job(pg(1)).unwrap().is_registered());
    }

    #[test]
    fn out_of_phase_events_are_ignored() {
        let fx = fixture(1);
        add_scrubbed_at(&fx, 1, 0);
        fx.queue.set_reserving_now();
        fx.map.reservation_concluded(pg(1), true).unwrap();
        fx.map.scrub_finished(pg(1)).unwrap();
        assert!(fx.queue.is_reserving_now());
        assert_eq!(fx.map.phase(pg(1)), Some(ScrubPhase::Idle));
    }

    #[test]
    fn operator_request_makes_job_mandatory() {
        let fx = fixture(1);
        let job = add_scrubbed_at(&fx, 1, 9 * 86_400);
        assert_eq!(job.urgency(), MustScrub::NotMandatory);

        fx.map.request_scrub(pg(1), true, true).unwrap();
        assert_eq!(job.urgency(), MustScrub::Mandatory);
        let handle = fx.map.get_locked_pg(pg(1)).unwrap();
        assert!(handle.planned_scrub().must_repair);
        drop(handle);

        let now = fx.clock.now().timestamp();
        let ready = fx.queue.ready_to_scrub(&OsdRestrictions::new(false, false), now);
        assert_eq!(ready, vec![pg(1)]);
    }

    #[test]
    fn request_during_running_scrub_survives_it() {
        let fx = fixture(1);
        let job = add_scrubbed_at(&fx, 1, 9 * 86_400);
        fx.map.request_scrub(pg(1), true, false).unwrap();
        fx.queue.set_reserving_now();
        assert_eq!(start(&fx, 1), ScheduleResult::ScrubInitiated);
        fx.queue.scrub_initiated(pg(1));
        fx.map.reservation_concluded(pg(1), true).unwrap();

        fx.map.request_scrub(pg(1), false, true).unwrap();
        fx.clock.advance(SignedDuration::from_secs(60));
        fx.map.scrub_finished(pg(1)).unwrap();

        // The deep request was served by this scrub; the repair was not.
        let now = fx.clock.now().timestamp();
        assert_eq!(fx.map.scrub_info(pg(1)).unwrap().last_deep_scrub_stamp, now);
        let handle = fx.map.get_locked_pg(pg(1)).unwrap();
        let planned = handle.planned_scrub();
        assert!(planned.must_repair);
        assert!(!planned.must_deep_scrub);
        drop(handle);
        assert_eq!(job.urgency(), MustScrub::Mandatory);
        assert_eq!(job.schedule().scheduled_at, now);
    }

    #[test]
    fn denied_reservation_keeps_the_request_pending() {
        let fx = fixture(1);
        let job = add_scrubbed_at(&fx, 1, 9 * 86_400);
        fx.map.request_scrub(pg(1), false, true).unwrap();
        fx.queue.set_reserving_now();
        assert_eq!(start(&fx, 1), ScheduleResult::ScrubInitiated);
        fx.queue.scrub_initiated(pg(1));

        fx.map.reservation_concluded(pg(1), false).unwrap();
        let handle = fx.map.get_locked_pg(pg(1)).unwrap();
        assert!(handle.planned_scrub().must_repair);
        drop(handle);
        assert_eq!(job.urgency(), MustScrub::Mandatory);
    }

    #[test]
    fn finished_scrub_without_new_requests_goes_periodic() {
        let fx = fixture(1);
        let job = add_scrubbed_at(&fx, 1, 9 * 86_400);
        fx.map.request_scrub(pg(1), true, true).unwrap();
        fx.queue.set_reserving_now();
        assert_eq!(start(&fx, 1), ScheduleResult::ScrubInitiated);
        fx.queue.scrub_initiated(pg(1));
        fx.map.reservation_concluded(pg(1), true).unwrap();
        fx.map.scrub_finished(pg(1)).unwrap();

        assert_eq!(job.urgency(), MustScrub::NotMandatory);
        let handle = fx.map.get_locked_pg(pg(1)).unwrap();
        assert!(!handle.planned_scrub().is_mandatory());
    }

    #[test]
    fn pool_override_reschedules() {
        let fx = fixture(1);
        let job = add_scrubbed_at(&fx, 1, 0);
        fx.map
            .set_pool_options(
                pg(1),
                PoolScrubOptions {
                    scrub_min_interval: Some(60.0),
                    scrub_max_interval: None,
                },
            )
            .unwrap();
        assert_eq!(job.schedule().scheduled_at, Timestamp::from_second(60).unwrap());
    }

    #[test]
    fn removing_reserving_pg_releases_everything() {
        let fx = fixture(1);
        add_scrubbed_at(&fx, 1, 0);
        fx.queue.set_reserving_now();
        assert_eq!(start(&fx, 1), ScheduleResult::ScrubInitiated);

        fx.map.remove_pg(pg(1)).unwrap();
        assert!(fx.map.is_empty());
        assert!(fx.queue.is_empty());
        assert_eq!(fx.resources.scrubs_local(), 0);
        assert!(!fx.queue.is_reserving_now());
        assert!(fx.map.remove_pg(pg(1)).is_err());
    }

    #[test]
    fn blocked_marks_forward_to_queue() {
        let fx = fixture(1);
        fx.map.mark_blocked(pg(3));
        assert_eq!(fx.queue.blocked_pgs_count(), 1);
        fx.map.clear_blocked(pg(3));
        assert_eq!(fx.queue.blocked_pgs_count(), 0);
    }
}
