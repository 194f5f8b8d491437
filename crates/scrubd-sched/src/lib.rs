#![forbid(unsafe_code)]
//! Scrub scheduling for a storage node.
//!
//! Decides, once per tick, whether the node may start a background scrub and
//! on which placement group. Admission weighs operator time windows, host
//! load, recovery activity, concurrent-scrub slots and the single-flight
//! replica reservation gate; selection delegates to a [`ScrubQueue`] and the
//! attempt itself to the PG through a [`PgAccessor`].

pub mod clock;
pub mod config;
pub mod job;
pub mod load;
pub mod osd_scrub;
pub mod pg;
pub mod queue;
pub mod resources;
pub mod schedule;
pub mod time_window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigCell, ScrubConfig};
pub use job::{ScrubJob, ScrubJobDump, ScrubJobRef};
pub use load::{HostLoad, LoadSource, LoadTracker};
pub use osd_scrub::{OsdScrub, PassSummary, ScrubAttempt};
pub use pg::{LockedPg, PgAccessor, PgMap, ScrubPhase};
pub use queue::{JobQueue, ScrubQueue};
pub use resources::ScrubResources;
pub use schedule::{compute_schedule, determine_scrub_time};
pub use time_window::{isbetween_modulo, scrub_sleep_time, scrub_time_permit};
