//! The scrub queue: registered jobs, candidate ranking, and the
//! reservation gate.
//!
//! [`ScrubQueue`] is the contract the scheduler drives. [`JobQueue`] is the
//! in-memory implementation: a flat list of registered jobs ranked on demand,
//! a set of PGs blocked on locked objects, and an atomic "reserving now"
//! gate that admits at most one replica-reservation round at a time.
//!
//! Lock order: the job list, then an individual job's state. Callers may
//! hold a PG lock while calling in; the queue never calls back out.
//!
//! # Logging
//!
//! - **TRACE** `scrubd::sched::queue`: `ready_to_scrub` — ranked candidate count
//! - **DEBUG** `scrubd::sched::queue`: `job_registered` / `job_updated` / `job_removed` / `job_dequeued`
//! - **DEBUG** `scrubd::sched::queue`: `pg_blocked` / `pg_unblocked`
//! - **WARN** `scrubd::sched::queue`: `remove_unknown_job`

use jiff::Timestamp;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use scrubd_error::{Result, ScrubError};
use scrubd_types::{MustScrub, OsdId, OsdRestrictions, PgId, SchedParams};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

use crate::config::ConfigCell;
use crate::job::{ScrubJobDump, ScrubJobRef};
use crate::schedule::compute_schedule;

/// Registry and ranking of scrub jobs for one node.
pub trait ScrubQueue: Send + Sync {
    /// PGs eligible for scrubbing at `now` under `restrictions`, best first.
    fn ready_to_scrub(&self, restrictions: &OsdRestrictions, now: Timestamp) -> Vec<PgId>;

    /// A scrub was initiated on `pgid`; stop offering it.
    fn scrub_initiated(&self, pgid: PgId);

    /// Snapshot of all registered jobs.
    fn list_registered_jobs(&self) -> Vec<ScrubJobRef>;

    /// Schedule `job` from `params` and add it to the queue if absent.
    fn register_with_osd(&self, job: &ScrubJobRef, params: &SchedParams);

    /// Recompute the schedule of `job` from `params`.
    fn update_job(&self, job: &ScrubJobRef, params: &SchedParams);

    /// Drop `job` from the queue.
    fn remove_from_osd_queue(&self, job: &ScrubJobRef);

    fn mark_pg_scrub_blocked(&self, pgid: PgId);
    fn clear_pg_scrub_blocked(&self, pgid: PgId);
    fn blocked_pgs_count(&self) -> usize;

    /// Close the reservation gate.
    fn set_reserving_now(&self);
    /// Open the reservation gate.
    fn clear_reserving_now(&self);
    fn is_reserving_now(&self) -> bool;

    /// Write a JSON description of the queue to `sink`.
    fn dump_scrubs(&self, sink: &mut dyn Write) -> Result<()>;
}

/// In-memory [`ScrubQueue`].
pub struct JobQueue {
    osd: OsdId,
    config: Arc<ConfigCell>,
    jobs: Mutex<Vec<ScrubJobRef>>,
    blocked: Mutex<BTreeSet<PgId>>,
    reserving_now: AtomicBool,
    rng: Mutex<Pcg64>,
}

#[derive(Debug, Serialize)]
struct QueueDump {
    osd: OsdId,
    reserving_now: bool,
    blocked_pgs: Vec<PgId>,
    jobs: Vec<ScrubJobDump>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("osd", &self.osd)
            .field("jobs", &self.jobs.lock().len())
            .field("blocked", &self.blocked.lock().len())
            .field("reserving_now", &self.reserving_now.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    #[must_use]
    pub fn new(osd: OsdId, config: Arc<ConfigCell>) -> Self {
        Self::with_rng(osd, config, Pcg64::from_entropy())
    }

    /// Queue whose schedule spread is reproducible.
    #[must_use]
    pub fn with_seed(osd: OsdId, config: Arc<ConfigCell>, seed: u64) -> Self {
        Self::with_rng(osd, config, Pcg64::seed_from_u64(seed))
    }

    fn with_rng(osd: OsdId, config: Arc<ConfigCell>, rng: Pcg64) -> Self {
        Self {
            osd,
            config,
            jobs: Mutex::new(Vec::new()),
            blocked: Mutex::new(BTreeSet::new()),
            reserving_now: AtomicBool::new(false),
            rng: Mutex::new(rng),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    fn plan(&self, job: &ScrubJobRef, params: &SchedParams) {
        let spread = self.rng.lock().gen_range(0.0..1.0);
        let schedule = compute_schedule(&self.config.load(), params, spread);
        job.set_schedule(schedule, params.is_must);
    }
}

impl ScrubQueue for JobQueue {
    fn ready_to_scrub(&self, restrictions: &OsdRestrictions, now: Timestamp) -> Vec<PgId> {
        let mut ripe: Vec<(MustScrub, Timestamp, PgId)> = self
            .jobs
            .lock()
            .iter()
            .filter(|job| job.is_registered())
            .filter_map(|job| {
                let schedule = job.schedule();
                let eligible = schedule.is_ripe(now)
                    && (!restrictions.only_deadlined() || schedule.is_deadlined(now));
                eligible.then(|| (job.urgency(), schedule.scheduled_at, job.pgid()))
            })
            .collect();

        // Mandatory first, then oldest target time; PgId breaks ties.
        ripe.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        trace!(
            target: "scrubd::sched::queue",
            osd = %self.osd,
            restrictions = %restrictions,
            count = ripe.len(),
            "ready_to_scrub"
        );
        ripe.into_iter().map(|(_, _, pgid)| pgid).collect()
    }

    fn scrub_initiated(&self, pgid: PgId) {
        let mut jobs = self.jobs.lock();
        if let Some(idx) = jobs.iter().position(|job| job.pgid() == pgid) {
            let job = jobs.swap_remove(idx);
            job.set_registered(false);
            debug!(target: "scrubd::sched::queue", pg = %pgid, "job_dequeued");
        }
    }

    fn list_registered_jobs(&self) -> Vec<ScrubJobRef> {
        self.jobs
            .lock()
            .iter()
            .filter(|job| job.is_registered())
            .cloned()
            .collect()
    }

    fn register_with_osd(&self, job: &ScrubJobRef, params: &SchedParams) {
        self.plan(job, params);
        let mut jobs = self.jobs.lock();
        job.set_registered(true);
        if !jobs.iter().any(|queued| Arc::ptr_eq(queued, job)) {
            jobs.push(Arc::clone(job));
        }
        debug!(target: "scrubd::sched::queue", job = %job, "job_registered");
    }

    fn update_job(&self, job: &ScrubJobRef, params: &SchedParams) {
        self.plan(job, params);
        debug!(target: "scrubd::sched::queue", job = %job, "job_updated");
    }

    fn remove_from_osd_queue(&self, job: &ScrubJobRef) {
        let mut jobs = self.jobs.lock();
        job.set_registered(false);
        let before = jobs.len();
        jobs.retain(|queued| !Arc::ptr_eq(queued, job));
        if jobs.len() == before {
            warn!(target: "scrubd::sched::queue", pg = %job.pgid(), "remove_unknown_job");
        } else {
            debug!(target: "scrubd::sched::queue", pg = %job.pgid(), "job_removed");
        }
    }

    fn mark_pg_scrub_blocked(&self, pgid: PgId) {
        let count = {
            let mut blocked = self.blocked.lock();
            blocked.insert(pgid);
            blocked.len()
        };
        debug!(target: "scrubd::sched::queue", pg = %pgid, blocked = count, "pg_blocked");
    }

    fn clear_pg_scrub_blocked(&self, pgid: PgId) {
        let count = {
            let mut blocked = self.blocked.lock();
            blocked.remove(&pgid);
            blocked.len()
        };
        debug!(target: "scrubd::sched::queue", pg = %pgid, blocked = count, "pg_unblocked");
    }

    fn blocked_pgs_count(&self) -> usize {
        self.blocked.lock().len()
    }

    fn set_reserving_now(&self) {
        self.reserving_now.store(true, Ordering::Release);
    }

    fn clear_reserving_now(&self) {
        self.reserving_now.store(false, Ordering::Release);
    }

    fn is_reserving_now(&self) -> bool {
        self.reserving_now.load(Ordering::Acquire)
    }

    fn dump_scrubs(&self, sink: &mut dyn Write) -> Result<()> {
        let mut jobs: Vec<ScrubJobDump> = self.jobs.lock().iter().map(|job| job.dump()).collect();
        jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.pgid.cmp(&b.pgid)));
        let dump = QueueDump {
            osd: self.osd,
            reserving_now: self.is_reserving_now(),
            blocked_pgs: self.blocked.lock().iter().copied().collect(),
            jobs,
        };
        serde_json::to_writer_pretty(&mut *sink, &dump)
            .map_err(|err| ScrubError::Json(err.to_string()))?;
        writeln!(sink)?;
        Ok(())
    }
}
