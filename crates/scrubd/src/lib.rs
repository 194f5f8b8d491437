#![forbid(unsafe_code)]
//! scrubd public API facade.
//!
//! Re-exports the scheduler from `scrubd-sched` together with the shared
//! value and error types, so embedders depend on a single crate.

pub use scrubd_error::{Result, ScrubError};
pub use scrubd_sched::*;
pub use scrubd_types::*;
