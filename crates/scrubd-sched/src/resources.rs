//! Concurrent-scrub slot bookkeeping.
//!
//! [`ScrubResources`] counts scrubs this node runs as primary ("local") and
//! scrubs it serves as a replica ("remote"), each against its own configured
//! maximum. Maxima are read from the live configuration on every check, so
//! lowering a limit takes effect for the next reservation (running scrubs
//! are never revoked).
//!
//! Increments and decrements must be matched. Releasing a slot that was
//! never taken is a logic error and panics.
//!
//! # Logging
//!
//! - **TRACE** `scrubd::sched::resources`: `scrubs_inc` / `scrubs_dec` — slot taken or released
//! - **DEBUG** `scrubd::sched::resources`: `scrubs_at_max` — reservation refused

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::ConfigCell;

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    local: u32,
    remote: u32,
}

/// Which side of a scrub a slot is reserved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Shared counters of in-progress scrubs.
pub struct ScrubResources {
    config: Arc<ConfigCell>,
    counts: Mutex<Counts>,
}

impl fmt::Debug for ScrubResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = *self.counts.lock();
        f.debug_struct("ScrubResources")
            .field("local", &counts.local)
            .field("remote", &counts.remote)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ScrubResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = *self.counts.lock();
        let config = self.config.load();
        write!(
            f,
            "scrubs local {}/{} remote {}/{}",
            counts.local, config.max_scrubs_local, counts.remote, config.max_scrubs_remote
        )
    }
}

impl ScrubResources {
    #[must_use]
    pub fn new(config: Arc<ConfigCell>) -> Self {
        Self {
            config,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Whether a local scrub slot is currently free.
    #[must_use]
    pub fn can_inc_scrubs(&self) -> bool {
        let max = self.config.load().max_scrubs_local;
        let local = self.counts.lock().local;
        let ok = local < max;
        if !ok {
            debug!(target: "scrubd::sched::resources", side = "local", count = local, max, "scrubs_at_max");
        }
        ok
    }

    /// Take a local slot. Returns `false` and changes nothing when full.
    pub fn inc_scrubs_local(&self) -> bool {
        self.inc(Side::Local)
    }

    /// Release a local slot.
    ///
    /// # Panics
    ///
    /// Panics if no local slot is held.
    pub fn dec_scrubs_local(&self) {
        self.dec(Side::Local);
    }

    /// Take a remote (replica-side) slot. Returns `false` and changes
    /// nothing when full.
    pub fn inc_scrubs_remote(&self) -> bool {
        self.inc(Side::Remote)
    }

    /// Release a remote slot.
    ///
    /// # Panics
    ///
    /// Panics if no remote slot is held.
    pub fn dec_scrubs_remote(&self) {
        self.dec(Side::Remote);
    }

    #[must_use]
    pub fn scrubs_local(&self) -> u32 {
        self.counts.lock().local
    }

    #[must_use]
    pub fn scrubs_remote(&self) -> u32 {
        self.counts.lock().remote
    }

    fn inc(&self, side: Side) -> bool {
        let config = self.config.load();
        let max = match side {
            Side::Local => config.max_scrubs_local,
            Side::Remote => config.max_scrubs_remote,
        };

        let mut counts = self.counts.lock();
        let slot = match side {
            Side::Local => &mut counts.local,
            Side::Remote => &mut counts.remote,
        };
        if *slot >= max {
            debug!(
                target: "scrubd::sched::resources",
                side = side.as_str(),
                count = *slot,
                max,
                "scrubs_at_max"
            );
            return false;
        }
        *slot += 1;
        trace!(
            target: "scrubd::sched::resources",
            side = side.as_str(),
            count = *slot,
            max,
            "scrubs_inc"
        );
        true
    }

    fn dec(&self, side: Side) {
        let mut counts = self.counts.lock();
        let slot = match side {
            Side::Local => &mut counts.local,
            Side::Remote => &mut counts.remote,
        };
        assert!(
            *slot > 0,
            "released a {} scrub slot that was never reserved",
            side.as_str()
        );
        *slot -= 1;
        trace!(
            target: "scrubd::sched::resources",
            side = side.as_str(),
            count = *slot,
            "scrubs_dec"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScrubConfig;
    use proptest::prelude::*;

    fn resources(max_local: u32, max_remote: u32) -> ScrubResources {
        let config = ScrubConfig {
            max_scrubs_local: max_local,
            max_scrubs_remote: max_remote,
            ..ScrubConfig::default()
        };
        ScrubResources::new(Arc::new(ConfigCell::new(config).unwrap()))
    }

    #[test]
    fn local_inc_stops_at_max() {
        let res = resources(2, 1);
        assert!(res.can_inc_scrubs());
        assert!(res.inc_scrubs_local());
        assert!(res.inc_scrubs_local());
        assert!(!res.can_inc_scrubs());
        assert!(!res.inc_scrubs_local());
        assert_eq!(res.scrubs_local(), 2);

        res.dec_scrubs_local();
        assert!(res.can_inc_scrubs());
        assert_eq!(res.scrubs_local(), 1);
    }

    #[test]
    fn remote_counter_is_independent() {
        let res = resources(1, 2);
        assert!(res.inc_scrubs_local());
        assert!(!res.can_inc_scrubs());
        assert!(res.inc_scrubs_remote());
        assert!(res.inc_scrubs_remote());
        assert!(!res.inc_scrubs_remote());
        assert_eq!(res.scrubs_remote(), 2);
        assert_eq!(res.scrubs_local(), 1);
    }

    #[test]
    fn lowered_limit_applies_to_next_reservation() {
        let config = Arc::new(ConfigCell::default());
        let res = ScrubResources::new(config.clone());
        assert!(res.inc_scrubs_local());
        assert!(res.inc_scrubs_local());

        config
            .update(ScrubConfig {
                max_scrubs_local: 1,
                ..ScrubConfig::default()
            })
            .unwrap();
        assert!(!res.can_inc_scrubs());
        assert!(!res.inc_scrubs_local());
        assert_eq!(res.scrubs_local(), 2);
    }

    #[test]
    fn display_summarizes_counts() {
        let res = resources(3, 2);
        assert!(res.inc_scrubs_remote());
        assert_eq!(res.to_string(), "scrubs local 0/3 remote 1/2");
    }

    #[test]
    #[should_panic(expected = "never reserved")]
    fn unmatched_local_release_panics() {
        resources(1, 1).dec_scrubs_local();
    }

    #[test]
    #[should_panic(expected = "never reserved")]
    fn unmatched_remote_release_panics() {
        resources(1, 1).dec_scrubs_remote();
    }

    #[test]
    fn concurrent_reservations_never_exceed_max() {
        let res = Arc::new(resources(4, 4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let res = Arc::clone(&res);
                std::thread::spawn(move || {
                    let mut taken = 0_u32;
                    for _ in 0..1_000 {
                        if res.inc_scrubs_local() {
                            assert!(res.scrubs_local() <= 4);
                            res.dec_scrubs_local();
                            taken += 1;
                        }
                    }
                    taken
                })
            })
            .collect();
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total > 0);
        assert_eq!(res.scrubs_local(), 0);
    }

    proptest! {
        #[test]
        fn counts_stay_within_bounds(
            max_local in 0_u32..5,
            max_remote in 0_u32..5,
            ops in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..64),
        ) {
            let res = resources(max_local, max_remote);
            let (mut local, mut remote) = (0_u32, 0_u32);
            for (is_local, is_inc) in ops {
                match (is_local, is_inc) {
                    (true, true) => {
                        let before = res.scrubs_local();
                        let ok = res.inc_scrubs_local();
                        prop_assert_eq!(ok, before < max_local);
                        if ok { local += 1; } else { prop_assert_eq!(res.scrubs_local(), before); }
                    }
                    (true, false) if local > 0 => {
                        res.dec_scrubs_local();
                        local -= 1;
                    }
                    (false, true) => {
                        if res.inc_scrubs_remote() { remote += 1; }
                    }
                    (false, false) if remote > 0 => {
                        res.dec_scrubs_remote();
                        remote -= 1;
                    }
                    _ => {}
                }
                prop_assert!(res.scrubs_local() <= max_local);
                prop_assert!(res.scrubs_remote() <= max_remote);
                prop_assert_eq!(res.scrubs_local(), local);
                prop_assert_eq!(res.scrubs_remote(), remote);
            }
        }
    }
}
