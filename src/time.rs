//! Millisecond timepoints.
//!
//! Every record in the data plane is stamped with a `u64` count of
//! milliseconds since the Unix epoch, the unit storage versions are
//! queried by.

use chrono::{DateTime, TimeZone, Utc};

/// Current wall-clock time in milliseconds
pub fn now_ms() -> u64 {
    to_timepoint(Utc::now())
}

pub fn to_timepoint(t: DateTime<Utc>) -> u64 {
    t.timestamp_millis().max(0) as u64
}

pub fn from_timepoint(timepoint: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(timepoint as i64)
        .single()
        .unwrap_or_else(Utc::now)
}
