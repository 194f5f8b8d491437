//! Per-PG scrub jobs.
//!
//! A [`ScrubJob`] belongs to its PG. The queue holds shared references
//! ([`ScrubJobRef`]) to rank jobs; the scheduler only reads them. Schedule
//! and registration state sit behind a small mutex so the PG, the queue and
//! diagnostics can all observe a consistent snapshot.

use jiff::Timestamp;
use parking_lot::Mutex;
use scrubd_types::{MustScrub, OsdId, PgId, ScrubSchedule};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a scrub job.
pub type ScrubJobRef = Arc<ScrubJob>;

#[derive(Debug, Clone, Copy)]
struct JobState {
    registered: bool,
    schedule: ScrubSchedule,
    urgency: MustScrub,
}

/// Scheduling state of one PG's scrubs.
#[derive(Debug)]
pub struct ScrubJob {
    pgid: PgId,
    osd: OsdId,
    state: Mutex<JobState>,
}

/// Point-in-time view of a job, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrubJobDump {
    pub pgid: PgId,
    pub registered: bool,
    pub scheduled_at: Timestamp,
    pub deadline: Option<Timestamp>,
    pub urgency: MustScrub,
}

impl ScrubJob {
    /// Create an unregistered job. It is not eligible until a schedule is
    /// assigned by registration.
    #[must_use]
    pub fn new(pgid: PgId, osd: OsdId) -> ScrubJobRef {
        Arc::new(Self {
            pgid,
            osd,
            state: Mutex::new(JobState {
                registered: false,
                schedule: ScrubSchedule {
                    scheduled_at: Timestamp::MAX,
                    deadline: None,
                },
                urgency: MustScrub::NotMandatory,
            }),
        })
    }

    #[must_use]
    pub fn pgid(&self) -> PgId {
        self.pgid
    }

    #[must_use]
    pub fn osd(&self) -> OsdId {
        self.osd
    }

    #[must_use]
    pub fn schedule(&self) -> ScrubSchedule {
        self.state.lock().schedule
    }

    #[must_use]
    pub fn urgency(&self) -> MustScrub {
        self.state.lock().urgency
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    /// Replace the schedule and urgency.
    pub fn set_schedule(&self, schedule: ScrubSchedule, urgency: MustScrub) {
        let mut state = self.state.lock();
        state.schedule = schedule;
        state.urgency = urgency;
    }

    /// Set the registration flag, returning its previous value.
    pub fn set_registered(&self, registered: bool) -> bool {
        std::mem::replace(&mut self.state.lock().registered, registered)
    }

    #[must_use]
    pub fn dump(&self) -> ScrubJobDump {
        let state = *self.state.lock();
        ScrubJobDump {
            pgid: self.pgid,
            registered: state.registered,
            scheduled_at: state.schedule.scheduled_at,
            deadline: state.schedule.deadline,
            urgency: state.urgency,
        }
    }
}

impl fmt::Display for ScrubJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.lock();
        write!(f, "pg[{}] {} @ {}", self.pgid, self.osd, state.schedule.scheduled_at)?;
        match state.schedule.deadline {
            Some(deadline) => write!(f, " (dl: {deadline})")?,
            None => write!(f, " (dl: never)")?,
        }
        if state.urgency == MustScrub::Mandatory {
            write!(f, " must")?;
        }
        if !state.registered {
            write!(f, " unregistered")?;
        }
        Ok(())
    }
}
