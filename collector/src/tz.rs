//! Display-timezone helpers.
//!
//! Everything is stored and compared in UTC. Local wall time only appears
//! at the edges: parsing owner input, formatting output, and aligning
//! axis ticks to local minute/hour/day boundaries.

use crate::errors::{Error, Result};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const MINUTE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Parse owner input in the display timezone.
///
/// Ambiguous wall times (DST fall-back) resolve to the earlier instant;
/// nonexistent ones (spring-forward gap) are rejected.
pub fn parse_local(s: &str, format: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), format)
        .map_err(|e| Error::Validation(format!("Can't parse date: {}", e)))?;
    from_local_naive(naive, tz)
}

pub fn from_local_naive(naive: NaiveDateTime, tz: Tz) -> Result<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| Error::Validation(format!("{} does not exist in {}", naive, tz.name())))
}

pub fn format_local(dt: DateTime<Utc>, format: &str, tz: Tz) -> String {
    dt.with_timezone(&tz).format(format).to_string()
}

/// Seconds since the epoch of the local wall-clock reading, as if it were UTC.
pub fn local_wall_seconds(dt: DateTime<Utc>, tz: Tz) -> i64 {
    dt.with_timezone(&tz).naive_local().and_utc().timestamp()
}

/// Drops seconds and sub-second precision.
pub fn truncate_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

/// Start of the minute after the one `dt` falls in.
pub fn following_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(dt) + Duration::minutes(1)
}

pub fn epoch_seconds(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_local_warsaw() {
        let dt = parse_local("2024-01-15 12:30:00", DATETIME_FORMAT, chrono_tz::Europe::Warsaw)
            .unwrap();
        assert_eq!(dt, utc("2024-01-15T11:30:00Z"));
    }

    #[test]
    fn test_parse_local_rejects_garbage() {
        assert!(matches!(
            parse_local("2024-13-15 12:30:00", DATETIME_FORMAT, chrono_tz::UTC),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_spring_forward_gap_rejected() {
        // 02:30 does not exist in Warsaw on 2024-03-31
        assert!(parse_local("2024-03-31 02:30", MINUTE_FORMAT, chrono_tz::Europe::Warsaw).is_err());
    }

    #[test]
    fn test_following_minute() {
        assert_eq!(
            following_minute(utc("2024-01-01T10:15:42.5Z")),
            utc("2024-01-01T10:16:00Z")
        );
        assert_eq!(
            following_minute(utc("2024-01-01T10:15:00Z")),
            utc("2024-01-01T10:16:00Z")
        );
        assert_eq!(
            truncate_to_minute(utc("2024-01-01T23:59:59.999Z")),
            utc("2024-01-01T23:59:00Z")
        );
    }

    #[test]
    fn test_format_and_wall_seconds() {
        let dt = utc("2024-07-01T00:00:00Z");
        assert_eq!(
            format_local(dt, DATETIME_FORMAT, chrono_tz::Europe::Warsaw),
            "2024-07-01 02:00:00"
        );
        assert_eq!(local_wall_seconds(dt, chrono_tz::Europe::Warsaw), dt.timestamp() + 7200);
    }
}
