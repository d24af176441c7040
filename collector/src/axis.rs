//! Time-axis tick selection for plots.
//!
//! Candidate intervals are tried smallest first; the first one that puts
//! at most `MAX_NUM_XTICKS` ticks inside `[begin, end]` wins. Tick
//! arithmetic happens on whole seconds of local wall time so ticks land on
//! local minute/hour/day boundaries regardless of the UTC offset.

use crate::tz::{epoch_seconds, from_local_naive, local_wall_seconds};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// Tick ladder, in seconds.
pub const XTICK_INTERVALS: [i64; 12] = [
    60,
    2 * 60,
    5 * 60,
    10 * 60,
    20 * 60,
    30 * 60,
    3600,
    2 * 3600,
    4 * 3600,
    6 * 3600,
    12 * 3600,
    24 * 3600,
];

pub const MAX_NUM_XTICKS: i64 = 7;

/// What to do when even the largest interval yields too many ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPolicy {
    /// Use the largest interval anyway.
    FallBackToLargest,
    /// Return no ticks; the caller reports the range as too long.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XTicks {
    pub interval: Option<Duration>,
    pub ticks: Vec<DateTime<Utc>>,
}

impl XTicks {
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}

/// Either `"HH:MM"` or `["YYYY-MM-DD", "HH:MM"]` when the date changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TickLabel {
    Time(String),
    DateTime([String; 2]),
}

/// Chart-ready x-axis: limits and ticks as epoch seconds.
#[derive(Debug, Clone, Serialize)]
pub struct XAxis {
    pub xlimits: (f64, f64),
    pub xticks: Vec<f64>,
    pub xticklabels: Vec<TickLabel>,
}

impl XAxis {
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>, tz: Tz, policy: TickPolicy) -> Self {
        let xticks = calculate_xticks(begin, end, tz, policy);
        Self {
            xlimits: (epoch_seconds(begin), epoch_seconds(end)),
            xticklabels: calculate_xticklabels(&xticks.ticks, tz),
            xticks: xticks.ticks.iter().map(|t| epoch_seconds(*t)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.xticks.is_empty()
    }
}

pub fn calculate_xticks(
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: Tz,
    policy: TickPolicy,
) -> XTicks {
    // A fractional second pushes the first tick candidate one second later.
    let begin_s = local_wall_seconds(begin, tz) + i64::from(begin.timestamp_subsec_nanos() > 0);
    let end_s = local_wall_seconds(end, tz);

    let largest = XTICK_INTERVALS[XTICK_INTERVALS.len() - 1];
    for &interval_s in XTICK_INTERVALS.iter() {
        let min_s = ceil_div(begin_s, interval_s) * interval_s;
        let max_s = end_s.div_euclid(interval_s) * interval_s;
        let num_ticks = ((max_s - min_s).div_euclid(interval_s) + 1).max(0);

        if num_ticks > MAX_NUM_XTICKS && (interval_s != largest || policy == TickPolicy::Strict) {
            continue;
        }

        let ticks = (0..num_ticks)
            .filter_map(|i| wall_seconds_to_instant(min_s + i * interval_s, tz))
            .collect();

        return XTicks {
            interval: Some(Duration::seconds(interval_s)),
            ticks,
        };
    }

    XTicks {
        interval: None,
        ticks: Vec::new(),
    }
}

pub fn calculate_xticklabels(ticks: &[DateTime<Utc>], tz: Tz) -> Vec<TickLabel> {
    let local: Vec<_> = ticks.iter().map(|t| t.with_timezone(&tz)).collect();
    local
        .iter()
        .enumerate()
        .map(|(idx, tick)| {
            let time = tick.format("%H:%M").to_string();
            let date_changed = idx == 0 || local[idx - 1].date_naive() != tick.date_naive();
            if date_changed {
                TickLabel::DateTime([tick.format("%Y-%m-%d").to_string(), time])
            } else {
                TickLabel::Time(time)
            }
        })
        .collect()
}

fn ceil_div(a: i64, b: i64) -> i64 {
    -((-a).div_euclid(b))
}

// Wall times skipped by a DST transition produce no tick.
fn wall_seconds_to_instant(secs: i64, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = DateTime::from_timestamp(secs, 0)?.naive_utc();
    from_local_naive(naive, tz).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn hm(ticks: &XTicks, tz: Tz) -> Vec<String> {
        ticks
            .ticks
            .iter()
            .map(|t| t.with_timezone(&tz).format("%H:%M").to_string())
            .collect()
    }

    #[test]
    fn test_seven_minutes_picks_two_minute_interval() {
        let begin = utc("2024-01-01T00:00:00Z");
        let end = utc("2024-01-01T00:07:00Z");
        let ticks = calculate_xticks(begin, end, chrono_tz::UTC, TickPolicy::FallBackToLargest);
        assert_eq!(ticks.interval, Some(Duration::minutes(2)));
        assert_eq!(hm(&ticks, chrono_tz::UTC), vec!["00:00", "00:02", "00:04", "00:06"]);
    }

    #[test]
    fn test_six_minutes_keeps_one_minute_interval() {
        let begin = utc("2024-01-01T00:00:00Z");
        let end = utc("2024-01-01T00:06:00Z");
        let ticks = calculate_xticks(begin, end, chrono_tz::UTC, TickPolicy::Strict);
        assert_eq!(ticks.interval, Some(Duration::minutes(1)));
        assert_eq!(ticks.ticks.len(), 7);
    }

    #[test]
    fn test_chosen_interval_is_smallest_fitting() {
        let begin = utc("2024-01-01T00:00:00Z");
        for hours in [1i64, 3, 5, 11, 30, 100] {
            let end = begin + Duration::hours(hours);
            let ticks = calculate_xticks(begin, end, chrono_tz::UTC, TickPolicy::Strict);
            let chosen = ticks.interval.unwrap().num_seconds();
            assert!(ticks.ticks.len() as i64 <= MAX_NUM_XTICKS);
            for &smaller in XTICK_INTERVALS.iter().take_while(|&&i| i < chosen) {
                let count = (hours * 3600) / smaller + 1;
                assert!(count > MAX_NUM_XTICKS, "{}s would have fit {}h", smaller, hours);
            }
        }
    }

    #[test]
    fn test_ticks_align_to_local_boundaries() {
        // 09:13 - 15:47 Warsaw time in winter (UTC+1)
        let tz = chrono_tz::Europe::Warsaw;
        let begin = utc("2024-01-10T08:13:00Z");
        let end = utc("2024-01-10T14:47:00Z");
        let ticks = calculate_xticks(begin, end, tz, TickPolicy::Strict);
        assert_eq!(ticks.interval, Some(Duration::hours(1)));
        assert_eq!(
            hm(&ticks, tz),
            vec!["10:00", "11:00", "12:00", "13:00", "14:00", "15:00"]
        );
    }

    #[test]
    fn test_too_long_range() {
        let begin = utc("2024-01-01T00:00:00Z");
        let end = utc("2024-01-20T00:00:00Z");
        let strict = calculate_xticks(begin, end, chrono_tz::UTC, TickPolicy::Strict);
        assert!(strict.is_empty());
        assert_eq!(strict.interval, None);

        let lenient = calculate_xticks(begin, end, chrono_tz::UTC, TickPolicy::FallBackToLargest);
        assert_eq!(lenient.interval, Some(Duration::days(1)));
        assert_eq!(lenient.ticks.len(), 20);
    }

    #[test]
    fn test_fractional_begin_skips_partial_tick() {
        let begin = utc("2024-01-01T00:00:00.250Z");
        let end = utc("2024-01-01T00:03:00Z");
        let ticks = calculate_xticks(begin, end, chrono_tz::UTC, TickPolicy::Strict);
        assert_eq!(hm(&ticks, chrono_tz::UTC), vec!["00:01", "00:02", "00:03"]);
    }

    #[test]
    fn test_window_without_boundary_has_no_ticks() {
        let begin = utc("2024-01-01T00:00:10Z");
        let end = utc("2024-01-01T00:00:50Z");
        let ticks = calculate_xticks(begin, end, chrono_tz::UTC, TickPolicy::Strict);
        assert!(ticks.is_empty());
        assert_eq!(ticks.interval, Some(Duration::minutes(1)));
    }

    #[test]
    fn test_labels_mark_date_changes() {
        let begin = utc("2024-01-01T20:00:00Z");
        let end = utc("2024-01-02T08:00:00Z");
        let ticks = calculate_xticks(begin, end, chrono_tz::UTC, TickPolicy::Strict);
        let labels = calculate_xticklabels(&ticks.ticks, chrono_tz::UTC);
        assert_eq!(
            labels,
            vec![
                TickLabel::DateTime(["2024-01-01".to_string(), "20:00".to_string()]),
                TickLabel::Time("22:00".to_string()),
                TickLabel::DateTime(["2024-01-02".to_string(), "00:00".to_string()]),
                TickLabel::Time("02:00".to_string()),
                TickLabel::Time("04:00".to_string()),
                TickLabel::Time("06:00".to_string()),
                TickLabel::Time("08:00".to_string()),
            ]
        );
    }

    #[test]
    fn test_axis_serializes_labels_untagged() {
        let axis = XAxis::new(
            utc("2024-01-01T00:00:00Z"),
            utc("2024-01-01T00:02:00Z"),
            chrono_tz::UTC,
            TickPolicy::Strict,
        );
        let json = serde_json::to_value(&axis).unwrap();
        assert_eq!(json["xticklabels"][0], serde_json::json!(["2024-01-01", "00:00"]));
        assert_eq!(json["xticklabels"][1], "00:01");
        assert_eq!(json["xlimits"][0], 1704067200.0);
    }
}
