#![forbid(unsafe_code)]
//! Error types for scrubd.
//!
//! # Error Taxonomy
//!
//! The scheduling pass itself never returns an error: every per-candidate
//! failure is an outcome value (`ScheduleResult` in `scrubd-types`) and every
//! environmental suppression simply ends the pass. `ScrubError` covers the
//! fallible surfaces *around* the pass:
//!
//! | Variant | Raised by | Example |
//! |---------|-----------|---------|
//! | `InvalidConfig` | `ScrubConfig::validate` | `begin_hour = 24` |
//! | `InvalidPgId` | `PgId::from_str` | `"1.zz"` |
//! | `UnknownPg` | reference PG map operations | scrub request for a removed PG |
//! | `LoadAverage` | `LoadSource` implementations | host sample not finite |
//! | `Io` | diagnostics dump | broken pipe while dumping |
//! | `Json` | config parsing, diagnostics dump | malformed config document |
//!
//! ## Design Constraints
//!
//! - `scrubd-error` MUST NOT depend on `scrubd-types` (no cyclic deps), so
//!   identifiers are carried as their display strings.
//! - All string payloads are owned (`String`).
//! - Load-average failures are reported through this type by the source, but
//!   the load tracker converts them into a "load too high" verdict: they never
//!   reach the scheduler's caller.

use thiserror::Error;

/// Unified error type for scrubd operations outside the scheduling pass.
#[derive(Debug, Error)]
pub enum ScrubError {
    /// A configuration value is out of its permitted range.
    #[error("invalid configuration: {field} ({reason})")]
    InvalidConfig { field: &'static str, reason: String },

    /// A placement-group identifier could not be parsed.
    #[error("invalid pg id: {0}")]
    InvalidPgId(String),

    /// The named placement group is not hosted here.
    #[error("unknown pg: {0}")]
    UnknownPg(String),

    /// Host load averages could not be read or parsed.
    #[error("load average unavailable: {0}")]
    LoadAverage(String),

    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(String),
}

impl ScrubError {
    /// Shorthand for an [`InvalidConfig`](Self::InvalidConfig) error.
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// Result alias using `ScrubError`.
pub type Result<T> = std::result::Result<T, ScrubError>;
