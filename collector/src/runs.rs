//! Runs: named, non-overlapping time windows over a device's measurements.
//!
//! A run covers `[date_from, date_to)`; an open run (`date_to == None`)
//! extends indefinitely. The same half-open convention is used when new
//! measurements are assigned on ingest and when a new run adopts existing
//! measurements, so a measurement stamped exactly at `date_to` belongs to
//! whatever comes next.

use crate::devices::validation_message;
use crate::errors::{Error, Result};
use crate::metrics::{MEASUREMENTS_REASSIGNED_TOTAL, RUNS_CREATED_TOTAL};
use crate::model::Run;
use crate::tz::{following_minute, parse_local, truncate_to_minute, DATETIME_FORMAT};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::{PgExecutor, PgPool};
use std::collections::BTreeMap;
use tracing::info;

const RUN_COLUMNS: &str = "r.id, r.device_id, r.name, r.date_from, r.date_to";

pub const MAX_NAME_LEN: usize = 100;

/// Stand-in end for open runs when testing for overlap.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    fn end_or_sentinel(&self) -> DateTime<Utc> {
        self.end.unwrap_or_else(far_future)
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end_or_sentinel() && other.start < self.end_or_sentinel()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && self.end.map_or(true, |end| ts < end)
    }
}

impl From<&Run> for Interval {
    fn from(run: &Run) -> Self {
        Interval::new(run.date_from, run.date_to)
    }
}

pub fn find_overlap<'a>(candidate: &Interval, runs: &'a [Run]) -> Option<&'a Run> {
    runs.iter().find(|run| candidate.overlaps(&Interval::from(*run)))
}

/// Minute-aligned bounds that just cover the first and last measurement.
pub fn trimmed_bounds(first: DateTime<Utc>, last: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (truncate_to_minute(first), following_minute(last))
}

/// Whether `trim` would change the run. `first_last` is the time of the
/// run's first and last measurement, if it has any.
pub fn can_be_trimmed(run: &Run, first_last: Option<(DateTime<Utc>, DateTime<Utc>)>) -> bool {
    let Some(date_to) = run.date_to else {
        return true;
    };
    match first_last {
        Some((first, last)) => trimmed_bounds(first, last) != (run.date_from, date_to),
        None => false,
    }
}

/// Open runs, and runs that have not ended yet, may still receive data.
pub fn needs_updating(run: &Run, now: DateTime<Utc>) -> bool {
    run.date_to.map_or(true, |date_to| now <= date_to)
}

/// Plot window of a run. An open run ends at the next minute, or a day
/// after its start if it starts in the future.
pub fn axis_limits(run: &Run, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = match run.date_to {
        Some(date_to) => date_to,
        None if now < run.date_from => run.date_from + Duration::days(1),
        None => following_minute(now),
    };
    (run.date_from, end)
}

/// Validated input for a new run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunForm {
    pub name: String,
    pub date_from: DateTime<Utc>,
    pub date_to: Option<DateTime<Utc>>,
}

impl RunForm {
    /// Dates are `YYYY-MM-DD HH:MM:SS` in the display timezone; an empty
    /// `date_to` leaves the run open.
    pub fn parse(name: &str, date_from: &str, date_to: Option<&str>, tz: Tz) -> Result<Self> {
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut add = |field: &str, msg: String| {
            errors.entry(field.to_string()).or_default().push(msg);
        };

        let name = name.trim();
        if name.is_empty() {
            add("name", "This field is required.".to_string());
        } else if name.chars().count() > MAX_NAME_LEN {
            add(
                "name",
                format!("Ensure this value has at most {} characters.", MAX_NAME_LEN),
            );
        }

        let date_from = match date_from.trim() {
            "" => {
                add("date_from", "This field is required.".to_string());
                None
            }
            s => parse_local(s, DATETIME_FORMAT, tz)
                .map_err(|e| add("date_from", validation_message(e)))
                .ok(),
        };

        let date_to = match date_to.map(str::trim) {
            None | Some("") => None,
            Some(s) => parse_local(s, DATETIME_FORMAT, tz)
                .map_err(|e| add("date_to", validation_message(e)))
                .ok(),
        };

        if let (Some(from), Some(to)) = (date_from, date_to) {
            if to <= from {
                add(
                    "non_field_errors",
                    "date-to should be later than date-from".to_string(),
                );
            }
        }

        match date_from {
            Some(date_from) if errors.is_empty() => Ok(Self {
                name: name.to_string(),
                date_from,
                date_to,
            }),
            _ => Err(Error::FieldErrors(errors)),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub run: Run,
    pub num_measurements: i64,
}

async fn fetch_owned<'e>(
    executor: impl PgExecutor<'e>,
    owner_id: i64,
    run_id: i64,
    lock: bool,
) -> Result<Run> {
    let sql = format!(
        r#"
        SELECT {} FROM runs r
        JOIN devices d ON d.id = r.device_id
        WHERE r.id = $1 AND d.user_id = $2
        {}
        "#,
        RUN_COLUMNS,
        if lock { "FOR UPDATE OF r" } else { "" }
    );
    sqlx::query_as::<_, Run>(&sql)
        .bind(run_id)
        .bind(owner_id)
        .fetch_one(executor)
        .await
        .map_err(Error::from_lookup)
}

pub async fn get(pool: &PgPool, owner_id: i64, run_id: i64) -> Result<Run> {
    fetch_owned(pool, owner_id, run_id, false).await
}

/// Runs of a device, latest start first.
pub async fn list_for_device(pool: &PgPool, device_id: i64) -> Result<Vec<RunSummary>> {
    let sql = format!(
        r#"
        SELECT {}, COUNT(m.id) AS num_measurements
        FROM runs r
        LEFT JOIN measurements m ON m.run_id = r.id
        WHERE r.device_id = $1
        GROUP BY r.id
        ORDER BY r.date_from DESC
        "#,
        RUN_COLUMNS
    );
    let rows = sqlx::query_as::<_, RunSummary>(&sql)
        .bind(device_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Time of the first and last measurement of the run.
pub async fn first_last<'e>(
    executor: impl PgExecutor<'e>,
    run_id: i64,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let (first, last): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
        sqlx::query_as("SELECT MIN(date_added), MAX(date_added) FROM measurements WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(executor)
            .await?;
    Ok(first.zip(last))
}

/// Creates a run on one of the owner's devices and moves the device's
/// measurements inside the new window into it.
///
/// The device row is locked for the whole transaction, so two concurrent
/// creations on the same device cannot both pass the overlap check.
/// Returns the run and the number of measurements reassigned.
pub async fn create_run(
    pool: &PgPool,
    owner_id: i64,
    device_sequence_id: i32,
    form: RunForm,
) -> Result<(Run, u64)> {
    let mut tx = pool.begin().await?;

    let device_id: i64 = sqlx::query_scalar(
        "SELECT id FROM devices WHERE user_id = $1 AND sequence_id = $2 FOR UPDATE",
    )
    .bind(owner_id)
    .bind(device_sequence_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(Error::from_lookup)?;

    let sql = format!("SELECT {} FROM runs r WHERE r.device_id = $1", RUN_COLUMNS);
    let existing = sqlx::query_as::<_, Run>(&sql)
        .bind(device_id)
        .fetch_all(&mut *tx)
        .await?;

    let candidate = Interval::new(form.date_from, form.date_to);
    if let Some(conflict) = find_overlap(&candidate, &existing) {
        return Err(Error::Overlap {
            id: conflict.id,
            name: conflict.name.clone(),
        });
    }

    let run = sqlx::query_as::<_, Run>(
        r#"
        INSERT INTO runs (device_id, name, date_from, date_to)
        VALUES ($1, $2, $3, $4)
        RETURNING id, device_id, name, date_from, date_to
        "#,
    )
    .bind(device_id)
    .bind(&form.name)
    .bind(form.date_from)
    .bind(form.date_to)
    .fetch_one(&mut *tx)
    .await?;

    let reassigned = sqlx::query(
        r#"
        UPDATE measurements SET run_id = $1
        WHERE device_id = $2
          AND date_added >= $3
          AND ($4::timestamptz IS NULL OR date_added < $4)
        "#,
    )
    .bind(run.id)
    .bind(device_id)
    .bind(run.date_from)
    .bind(run.date_to)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    RUNS_CREATED_TOTAL.inc();
    MEASUREMENTS_REASSIGNED_TOTAL.inc_by(reassigned as f64);
    info!(
        "Run {} ({}) created on device {}, {} measurement(s) assigned",
        run.id, run.name, device_id, reassigned
    );
    Ok((run, reassigned))
}

/// Closes an open run at the start of the minute following `now`.
pub async fn finalize(pool: &PgPool, owner_id: i64, run_id: i64, now: DateTime<Utc>) -> Result<Run> {
    let run = get(pool, owner_id, run_id).await?;
    if run.date_to.is_some() {
        return Err(Error::AlreadyFinalized);
    }

    // Guarded so that a concurrent finalize loses instead of moving the end.
    let run = sqlx::query_as::<_, Run>(
        r#"
        UPDATE runs SET date_to = $2
        WHERE id = $1 AND date_to IS NULL
        RETURNING id, device_id, name, date_from, date_to
        "#,
    )
    .bind(run.id)
    .bind(following_minute(now))
    .fetch_optional(pool)
    .await?
    .ok_or(Error::AlreadyFinalized)?;

    info!("Run {} ({}) finalised", run.id, run.name);
    Ok(run)
}

/// Shrinks the run to the minute-aligned span of its measurements.
/// Fails with `Overlap` when the rounded span would reach into another run.
pub async fn trim(pool: &PgPool, owner_id: i64, run_id: i64) -> Result<Run> {
    let mut tx = pool.begin().await?;

    // Device row first, same lock order as create_run.
    let run = fetch_owned(&mut *tx, owner_id, run_id, false).await?;
    sqlx::query("SELECT id FROM devices WHERE id = $1 FOR UPDATE")
        .bind(run.device_id)
        .execute(&mut *tx)
        .await?;
    let run = fetch_owned(&mut *tx, owner_id, run_id, true).await?;

    let (first, last) = first_last(&mut *tx, run.id)
        .await?
        .ok_or(Error::NoMeasurements)?;
    let bounds = trimmed_bounds(first, last);

    let sql = format!("SELECT {} FROM runs r WHERE r.device_id = $1", RUN_COLUMNS);
    let siblings = sqlx::query_as::<_, Run>(&sql)
        .bind(run.device_id)
        .fetch_all(&mut *tx)
        .await?;
    if let Some(other) = trim_conflict(&run, bounds, &siblings) {
        return Err(Error::Overlap {
            id: other.id,
            name: other.name.clone(),
        });
    }

    let (date_from, date_to) = bounds;
    let run = sqlx::query_as::<_, Run>(
        r#"
        UPDATE runs SET date_from = $2, date_to = $3
        WHERE id = $1
        RETURNING id, device_id, name, date_from, date_to
        "#,
    )
    .bind(run.id)
    .bind(date_from)
    .bind(date_to)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    info!("Run {} ({}) trimmed", run.id, run.name);
    Ok(run)
}

/// The first run other than `run` that the trimmed bounds would overlap.
pub fn trim_conflict<'a>(
    run: &Run,
    (date_from, date_to): (DateTime<Utc>, DateTime<Utc>),
    runs: &'a [Run],
) -> Option<&'a Run> {
    let candidate = Interval::new(date_from, Some(date_to));
    runs.iter()
        .filter(|other| other.id != run.id)
        .find(|other| candidate.overlaps(&Interval::from(*other)))
}

/// Deletes the run and leaves its measurements unassigned.
/// Returns the run and the number of measurements detached.
pub async fn delete_detach(pool: &PgPool, owner_id: i64, run_id: i64) -> Result<(Run, u64)> {
    let mut tx = pool.begin().await?;
    let run = fetch_owned(&mut *tx, owner_id, run_id, true).await?;

    let detached = sqlx::query("UPDATE measurements SET run_id = NULL WHERE run_id = $1")
        .bind(run.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM runs WHERE id = $1")
        .bind(run.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!("Run {} ({}) deleted, {} measurement(s) detached", run.id, run.name, detached);
    Ok((run, detached))
}

/// Deletes the run together with its measurements.
/// Returns the run and the number of measurements deleted.
pub async fn delete_with_data(pool: &PgPool, owner_id: i64, run_id: i64) -> Result<(Run, u64)> {
    let mut tx = pool.begin().await?;
    let run = fetch_owned(&mut *tx, owner_id, run_id, true).await?;

    let deleted = sqlx::query("DELETE FROM measurements WHERE run_id = $1")
        .bind(run.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM runs WHERE id = $1")
        .bind(run.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!("Run {} ({}) deleted with {} measurement(s)", run.id, run.name, deleted);
    Ok((run, deleted))
}
