//! Acquisition-time conversions.
//!
//! `delta_time` is stored as seconds since the ATLAS SDP epoch
//! (2018-01-01T00:00:00Z). Regression runs on integer nanoseconds since the
//! Unix epoch, so slopes come out in height-per-nanosecond.
use chrono::{DateTime, Utc};

/// 2018-01-01T00:00:00Z as Unix seconds.
pub const ATLAS_SDP_EPOCH_UNIX_S: i64 = 1_514_764_800;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Seconds since the ATLAS SDP epoch → whole nanoseconds since the Unix epoch.
/// Missing input stays missing.
pub fn delta_time_to_ticks(delta_time_s: f64) -> f64 {
    if !delta_time_s.is_finite() {
        return f64::NAN;
    }
    let offset_ns = (delta_time_s * NANOS_PER_SECOND as f64).round() as i64;
    match (ATLAS_SDP_EPOCH_UNIX_S * NANOS_PER_SECOND).checked_add(offset_ns) {
        Some(ns) => ns as f64,
        None => f64::NAN,
    }
}

pub fn delta_time_to_utc(delta_time_s: f64) -> Option<DateTime<Utc>> {
    if !delta_time_s.is_finite() {
        return None;
    }
    let whole = delta_time_s.floor();
    let nanos = ((delta_time_s - whole) * NANOS_PER_SECOND as f64) as u32;
    DateTime::from_timestamp(ATLAS_SDP_EPOCH_UNIX_S + whole as i64, nanos.min(999_999_999))
}

/// `YYYY-MM-DD` for a `delta_time` value.
pub fn delta_time_to_date(delta_time_s: f64) -> Option<String> {
    delta_time_to_utc(delta_time_s).map(|t| t.format("%Y-%m-%d").to_string())
}

/// `YYYY-MM-DD` for a tick value (Unix nanoseconds).
pub fn ticks_to_date(ticks: f64) -> Option<String> {
    if !ticks.is_finite() {
        return None;
    }
    delta_time_to_date(ticks / NANOS_PER_SECOND as f64 - ATLAS_SDP_EPOCH_UNIX_S as f64)
}
