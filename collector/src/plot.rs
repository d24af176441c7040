//! Chart and map payloads built from measurements.

use crate::axis::{TickPolicy, XAxis};
use crate::display::distance;
use crate::errors::{Error, Result};
use crate::model::{Device, Measurement, Run};
use crate::runs::axis_limits;
use crate::tz::{
    epoch_seconds, following_minute, format_local, parse_local, truncate_to_minute,
    DATETIME_FORMAT, MINUTE_FORMAT,
};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// The device overview plot shows at most this many of the newest points...
pub const INITIAL_PLOT_MAX_POINTS: i64 = 360;
/// ...spanning at most this many hours back from the newest one.
pub const INITIAL_PLOT_SPAN_HOURS: i64 = 6;
/// A device whose last point is this recent is considered live.
pub const LIVE_THRESHOLD_MINUTES: i64 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct PlotData {
    pub labels: Vec<String>,
    pub time: Vec<f64>,
    pub titles: Vec<String>,
    /// One series per column.
    pub data: Vec<Vec<f64>>,
    #[serde(flatten)]
    pub axis: XAxis,
}

/// Builds per-column series. Points are numbered from `start_idx` in the titles.
pub fn plot_data(
    columns: &[String],
    measurements: &[Measurement],
    start_idx: i64,
    axis: XAxis,
    tz: Tz,
) -> PlotData {
    let mut data: Vec<Vec<f64>> = vec![Vec::with_capacity(measurements.len()); columns.len()];
    for m in measurements {
        for (series, value) in data.iter_mut().zip(m.data.iter()) {
            series.push(*value);
        }
    }

    PlotData {
        labels: columns.to_vec(),
        time: measurements.iter().map(|m| epoch_seconds(m.date_added)).collect(),
        titles: measurements
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                format!(
                    "#{}: {}",
                    start_idx + idx as i64,
                    format_local(m.date_added, DATETIME_FORMAT, tz)
                )
            })
            .collect(),
        data,
        axis,
    }
}

pub fn run_axis(run: &Run, now: DateTime<Utc>, tz: Tz) -> XAxis {
    let (begin, end) = axis_limits(run, now);
    XAxis::new(begin, end, tz, TickPolicy::FallBackToLargest)
}

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub index: i64,
    pub lat: f64,
    pub lon: f64,
    pub time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapData {
    pub locations: Vec<Location>,
    /// Length of the track through the locations, in metres.
    pub distance_m: i64,
    pub maps_api_key: Option<String>,
}

/// `None` unless the device reports both `lat` and `lon`.
pub fn map_data(
    device: &Device,
    measurements: &[Measurement],
    start_idx: i64,
    tz: Tz,
    maps_api_key: Option<String>,
) -> Option<MapData> {
    let lat_idx = device.column_index("lat")?;
    let lon_idx = device.column_index("lon")?;

    let locations: Vec<Location> = measurements
        .iter()
        .enumerate()
        .filter_map(|(idx, m)| {
            Some(Location {
                index: start_idx + idx as i64,
                lat: *m.data.get(lat_idx)?,
                lon: *m.data.get(lon_idx)?,
                time: format_local(m.date_added, DATETIME_FORMAT, tz),
            })
        })
        .collect();

    let distance_m = locations
        .windows(2)
        .map(|pair| distance(pair[0].lat, pair[0].lon, pair[1].lat, pair[1].lon))
        .sum();

    Some(MapData {
        locations,
        distance_m,
        maps_api_key,
    })
}

/// Window of the device overview plot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialWindow {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Whether the window reaches the present, i.e. the client should keep polling.
    pub is_now: bool,
    /// Index into the input of the first measurement inside the window.
    pub first: usize,
}

/// `latest` are the newest measurements, oldest first.
pub fn initial_window(latest: &[Measurement], now: DateTime<Utc>) -> InitialWindow {
    let span = Duration::hours(INITIAL_PLOT_SPAN_HOURS);
    let Some(last) = latest.last() else {
        let end = following_minute(now);
        return InitialWindow {
            begin: end - span,
            end,
            is_now: true,
            first: 0,
        };
    };

    let cutoff = last.date_added - span;
    let first = latest
        .iter()
        .position(|m| m.date_added >= cutoff)
        .unwrap_or(latest.len() - 1);

    let is_now = truncate_to_minute(now) - last.date_added
        <= Duration::minutes(LIVE_THRESHOLD_MINUTES);
    let end = if is_now {
        following_minute(now)
    } else {
        following_minute(last.date_added)
    };

    InitialWindow {
        begin: truncate_to_minute(latest[first].date_added),
        end,
        is_now,
        first,
    }
}

/// Requested plot range: `date_from` is `YYYY-MM-DD HH:MM` or an offset
/// like `-6 hours`; `date_to` is `YYYY-MM-DD HH:MM` or `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotRange {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_now: bool,
}

impl PlotRange {
    pub fn parse(date_from: &str, date_to: &str, now: DateTime<Utc>, tz: Tz) -> Result<Self> {
        let date_to = date_to.trim();
        let (end, is_now) = if date_to == "now" {
            (following_minute(now), true)
        } else {
            (parse_local(date_to, MINUTE_FORMAT, tz)?, false)
        };

        let begin = match parse_hours_offset(date_from.trim())? {
            Some(offset) => {
                let offset = if is_now {
                    offset.checked_add(&Duration::minutes(1))
                } else {
                    Some(offset)
                };
                offset
                    .and_then(|offset| end.checked_sub_signed(offset))
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "Can't parse date: offset {} is out of range",
                            date_from.trim()
                        ))
                    })?
            }
            None => parse_local(date_from, MINUTE_FORMAT, tz)?,
        };

        if end <= begin {
            return Err(Error::Validation(
                "date-to should be later than date-from".to_string(),
            ));
        }

        Ok(Self { begin, end, is_now })
    }

    /// Strict axis: a range needing more than the largest tick interval is rejected.
    pub fn axis(&self, tz: Tz) -> Result<XAxis> {
        let axis = XAxis::new(self.begin, self.end, tz, TickPolicy::Strict);
        if axis.is_empty() {
            return Err(Error::Validation("Time range too long to plot".to_string()));
        }
        Ok(axis)
    }
}

fn parse_hours_offset(s: &str) -> Result<Option<Duration>> {
    let Some(hours) = s.strip_prefix('-').and_then(|s| s.strip_suffix("hours")) else {
        return Ok(None);
    };
    let hours: f64 = hours
        .trim()
        .parse()
        .map_err(|e| Error::Validation(format!("Can't parse date: {}", e)))?;
    if !hours.is_finite() || hours <= 0.0 {
        return Err(Error::Validation(format!(
            "Can't parse date: invalid offset {}",
            hours
        )));
    }
    Duration::try_milliseconds((hours * 3_600_000.0).round() as i64)
        .map(Some)
        .ok_or_else(|| {
            Error::Validation(format!("Can't parse date: offset of {} hours is out of range", hours))
        })
}

/// First timestamp a "newest data" poll is interested in: one whole second
/// past the last record the client already has.
pub fn newest_cutoff(last_record_time: f64) -> Result<DateTime<Utc>> {
    if !last_record_time.is_finite() {
        return Err(Error::field("last_record_time", "Not a number"));
    }
    (last_record_time.floor() as i64)
        .checked_add(1)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| Error::field("last_record_time", "Out of range"))
}
