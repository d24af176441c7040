use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::tz::{format_local, MINUTE_FORMAT};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points given in degrees, in metres.
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> i64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let cos_angle = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * (lon1 - lon2).cos();
    // Rounding can push identical points just above 1.0.
    (EARTH_RADIUS_M * cos_angle.clamp(-1.0, 1.0).acos()).round() as i64
}

/// Gap between two rows of the measurements table, e.g. `1d 02h 03m 04s`.
pub fn time_to_next_display(next: DateTime<Utc>, this: DateTime<Utc>) -> String {
    let diff = (next - this).num_milliseconds() as f64 / 1000.0;
    let mut diff = diff.round() as i64;

    let sec = diff % 60;
    diff /= 60;
    let min = diff % 60;
    diff /= 60;
    let hour = diff % 24;
    let day = diff / 24;

    let mut out = String::new();
    if day != 0 {
        out.push_str(&format!("{}d ", day));
    }
    if hour != 0 || day != 0 {
        out.push_str(&format!("{:02}h ", hour));
    }
    out.push_str(&format!("{:02}m {:02}s", min, sec));
    out
}

/// Span from `first` to `last` at minute precision, with `last` rounded up by a minute.
pub fn time_range_display(first: DateTime<Utc>, last: DateTime<Utc>, tz: Tz) -> String {
    format!(
        "{} \u{2014} {}",
        format_local(first, MINUTE_FORMAT, tz),
        format_local(last + Duration::minutes(1), MINUTE_FORMAT, tz)
    )
}

/// Span of a run; an open run shows `current` as its end.
pub fn run_time_range_display(
    date_from: DateTime<Utc>,
    date_to: Option<DateTime<Utc>>,
    tz: Tz,
) -> String {
    let to = match date_to {
        Some(date_to) => format_local(date_to, MINUTE_FORMAT, tz),
        None => "current".to_string(),
    };
    format!("{} \u{2014} {}", format_local(date_from, MINUTE_FORMAT, tz), to)
}
