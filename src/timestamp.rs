//! Entry modification times.
//!
//! This module provides the [`Timestamp`] type used for archive entries and
//! the virtual filesystem. Timestamps count milliseconds since the Unix epoch,
//! the finest resolution any supported archive format records.
//!
//! # Precision
//!
//! The archive formats store coarser times:
//! - ZIP stores MS-DOS date/time: local-free, 2-second resolution, years 1980-2107
//! - TAR stores whole Unix seconds
//!
//! Converting to either format truncates; converting back yields the
//! truncated value.
//!
//! # Example
//!
//! ```rust
//! use archfs::Timestamp;
//!
//! let ts = Timestamp::from_unix_secs(1_700_000_001);
//! assert_eq!(ts.as_millis(), 1_700_000_001_000);
//!
//! // DOS time has a 2-second resolution
//! let (date, time) = ts.to_dos();
//! assert_eq!(Timestamp::from_dos(date, time).as_unix_secs(), 1_700_000_000);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds per second.
const MILLIS_PER_SECOND: i64 = 1000;

/// Seconds per day.
const SECONDS_PER_DAY: i64 = 86_400;

/// Earliest representable DOS timestamp: 1980-01-01 00:00:00.
const DOS_EPOCH_DATE: u16 = (1 << 5) | 1;

/// A point in time with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    millis: i64,
}

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp { millis: 0 };

    /// Creates a timestamp from milliseconds since the Unix epoch.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Creates a timestamp from whole Unix seconds.
    #[inline]
    pub const fn from_unix_secs(secs: i64) -> Self {
        Self {
            millis: secs.saturating_mul(MILLIS_PER_SECOND),
        }
    }

    /// Returns the current time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Creates a timestamp from a `SystemTime`, saturating far-out values.
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::from_millis(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
            Err(e) => Self::from_millis(-i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX)),
        }
    }

    /// Returns milliseconds since the Unix epoch.
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.millis
    }

    /// Returns whole seconds since the Unix epoch, rounding towards negative
    /// infinity.
    #[inline]
    pub const fn as_unix_secs(&self) -> i64 {
        self.millis.div_euclid(MILLIS_PER_SECOND)
    }

    /// Converts to a `SystemTime`.
    pub fn as_system_time(&self) -> SystemTime {
        if self.millis >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.millis as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(self.millis.unsigned_abs())
        }
    }

    /// Converts to a `filetime::FileTime` for setting native mtimes.
    pub(crate) fn as_file_time(&self) -> filetime::FileTime {
        filetime::FileTime::from_system_time(self.as_system_time())
    }

    /// Creates a timestamp from MS-DOS date and time fields (UTC).
    pub fn from_dos(date: u16, time: u16) -> Self {
        let year = 1980 + i64::from(date >> 9);
        let month = i64::from((date >> 5) & 0x0f).clamp(1, 12);
        let day = i64::from(date & 0x1f).max(1);
        let hour = i64::from(time >> 11);
        let minute = i64::from((time >> 5) & 0x3f);
        let second = i64::from(time & 0x1f) * 2;
        let days = days_from_civil(year, month, day);
        Self::from_unix_secs(days * SECONDS_PER_DAY + hour * 3600 + minute * 60 + second)
    }

    /// Converts to MS-DOS `(date, time)` fields (UTC), clamping to the
    /// representable range.
    pub fn to_dos(&self) -> (u16, u16) {
        let secs = self.as_unix_secs();
        let days = secs.div_euclid(SECONDS_PER_DAY);
        let rem = secs.rem_euclid(SECONDS_PER_DAY);
        let (year, month, day) = civil_from_days(days);
        if year < 1980 {
            return (DOS_EPOCH_DATE, 0);
        }
        if year > 2107 {
            return ((127 << 9) | (12 << 5) | 31, (23 << 11) | (59 << 5) | 29);
        }
        let date = (((year - 1980) as u16) << 9) | ((month as u16) << 5) | day as u16;
        let time = (((rem / 3600) as u16) << 11) | ((((rem / 60) % 60) as u16) << 5) | ((rem % 60) / 2) as u16;
        (date, time)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        Self::from_system_time(time)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        ts.as_system_time()
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Proleptic Gregorian date for days since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
