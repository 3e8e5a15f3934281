//! Platform-epoch time arithmetic
//!
//! Both trading platforms stamp ticks as 100ns intervals since
//! 0001-01-01T00:00:00 UTC. Tick files store unix milliseconds.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::time::Duration;

/// Platform ticks per millisecond (100ns resolution)
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Platform ticks per second
pub const TICKS_PER_SECOND: i64 = 1_000 * TICKS_PER_MILLISECOND;

/// Platform ticks at 1970-01-01T00:00:00 UTC
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Anything carrying a platform timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

/// Convert unix milliseconds to platform ticks, `None` outside the i64 tick range
#[inline]
pub fn checked_unix_ms_to_ticks(ms: i64) -> Option<i64> {
    ms.checked_mul(TICKS_PER_MILLISECOND)?
        .checked_add(UNIX_EPOCH_TICKS)
}

/// Convert unix milliseconds to platform ticks, saturating at the i64 range
#[inline]
pub fn unix_ms_to_ticks(ms: i64) -> i64 {
    checked_unix_ms_to_ticks(ms).unwrap_or(if ms < 0 { i64::MIN } else { i64::MAX })
}

/// Convert platform ticks to unix milliseconds (floored). Total: the
/// quotient of any i64 offset by 10_000 fits back in i64.
#[inline]
pub fn ticks_to_unix_ms(ticks: i64) -> i64 {
    (ticks as i128 - UNIX_EPOCH_TICKS as i128).div_euclid(TICKS_PER_MILLISECOND as i128) as i64
}

/// Convert a duration to platform ticks, saturating at i64::MAX
pub fn duration_to_ticks(d: Duration) -> i64 {
    i64::try_from(d.as_nanos() / 100).unwrap_or(i64::MAX)
}

pub fn ticks_to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ticks_to_unix_ms(ticks)).single()
}

pub fn datetime_to_ticks(dt: DateTime<Utc>) -> i64 {
    unix_ms_to_ticks(dt.timestamp_millis())
}

/// Current wall clock in platform ticks
pub fn now_ticks() -> i64 {
    datetime_to_ticks(Utc::now())
}

/// Unix milliseconds at midnight UTC of the given day
pub fn day_start_ms(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}
