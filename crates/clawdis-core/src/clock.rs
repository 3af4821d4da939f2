//! Wall-clock reads for the dispatch core.
//!
//! Everything time-shaped in Clawdis is a unix-epoch integer: envelope and
//! event-frame timestamps are milliseconds, pairing and login TTLs are
//! seconds. Milliseconds are the single source of truth here; the seconds
//! form is derived from the same read so the two can never disagree within
//! one call chain.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
///
/// A clock set before 1970 reads as zero rather than panicking; envelope
/// ordering degrades but ingestion keeps working.
pub fn unix_time_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX),
        Err(_) => 0,
    }
}

/// Seconds since the unix epoch, derived from [`unix_time_ms`].
pub fn unix_time_secs() -> u64 {
    unix_time_ms() / 1_000
}
