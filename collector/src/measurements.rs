//! Measurement queries shared by device, run and export views.

use crate::display::time_to_next_display;
use crate::errors::{Error, Result};
use crate::model::Measurement;
use crate::pagination::{PageInfo, Paginator};
use crate::tz::{epoch_seconds, format_local, DATETIME_FORMAT};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::PgPool;

const COLUMNS: &str = "id, device_id, run_id, date_added, data";

/// Which slice of the measurements table a query looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Device(i64),
    Run(i64),
    /// Measurements of the device not assigned to any run.
    Unassigned(i64),
}

impl Scope {
    /// `WHERE` clause fragment; always binds the id as `$1`.
    fn filter(&self) -> &'static str {
        match self {
            Scope::Device(_) => "device_id = $1",
            Scope::Run(_) => "run_id = $1",
            Scope::Unassigned(_) => "device_id = $1 AND run_id IS NULL",
        }
    }

    fn id(&self) -> i64 {
        match *self {
            Scope::Device(id) | Scope::Run(id) | Scope::Unassigned(id) => id,
        }
    }
}

/// A measurements table row as shown to the owner.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementRow {
    pub number: i64,
    pub id: i64,
    pub time: f64,
    pub date_added: String,
    pub data: Vec<f64>,
    /// Gap to the chronologically next measurement, when there is one.
    pub time_to_next: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeasurementsPage {
    pub page: PageInfo,
    pub rows: Vec<MeasurementRow>,
}

pub async fn count(pool: &PgPool, scope: Scope) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM measurements WHERE {}", scope.filter());
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(scope.id())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Number of measurements older than `ts`; used to number the points of a plotted range.
pub async fn count_before(pool: &PgPool, scope: Scope, ts: DateTime<Utc>) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM measurements WHERE {} AND date_added < $2",
        scope.filter()
    );
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(scope.id())
        .bind(ts)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn all_ascending(pool: &PgPool, scope: Scope) -> Result<Vec<Measurement>> {
    in_range(pool, scope, None, None).await
}

/// Measurements with `from <= date_added <= to`, oldest first. Either bound may be open.
pub async fn in_range(
    pool: &PgPool,
    scope: Scope,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<Vec<Measurement>> {
    let sql = format!(
        r#"
        SELECT {} FROM measurements
        WHERE {}
          AND ($2::timestamptz IS NULL OR date_added >= $2)
          AND ($3::timestamptz IS NULL OR date_added <= $3)
        ORDER BY date_added, id
        "#,
        COLUMNS,
        scope.filter()
    );
    let rows = sqlx::query_as::<_, Measurement>(&sql)
        .bind(scope.id())
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// The newest `limit` measurements, returned oldest first.
pub async fn latest(pool: &PgPool, scope: Scope, limit: i64) -> Result<Vec<Measurement>> {
    let sql = format!(
        "SELECT {} FROM measurements WHERE {} ORDER BY date_added DESC, id DESC LIMIT $2",
        COLUMNS,
        scope.filter()
    );
    let mut rows = sqlx::query_as::<_, Measurement>(&sql)
        .bind(scope.id())
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.reverse();
    Ok(rows)
}

/// One page of the newest-first measurements table.
pub async fn page(
    pool: &PgPool,
    scope: Scope,
    requested: &str,
    per_page: usize,
    tz: Tz,
) -> Result<MeasurementsPage> {
    let total = count(pool, scope).await?;
    let page = Paginator::new(total, per_page).get_page(requested);

    // Past the first page, fetch the row just above the page too so the
    // first row gets its gap to the next measurement.
    let offset = page.offset();
    let (limit, offset, has_newer) = if offset > 0 {
        (page.per_page + 1, offset - 1, true)
    } else {
        (page.per_page, 0, false)
    };

    let sql = format!(
        "SELECT {} FROM measurements WHERE {} ORDER BY date_added DESC, id DESC LIMIT $2 OFFSET $3",
        COLUMNS,
        scope.filter()
    );
    let mut items = sqlx::query_as::<_, Measurement>(&sql)
        .bind(scope.id())
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    let newer = if has_newer && !items.is_empty() {
        Some(items.remove(0))
    } else {
        None
    };

    let rows = build_rows(&items, newer.as_ref(), page.first_row_number(), tz);
    Ok(MeasurementsPage { page, rows })
}

/// Deletes one measurement of a device owned by `owner_id`.
pub async fn delete(pool: &PgPool, owner_id: i64, measurement_id: i64) -> Result<()> {
    let result = sqlx::query(
        r#"
        DELETE FROM measurements m
        USING devices d
        WHERE m.id = $1 AND m.device_id = d.id AND d.user_id = $2
        "#,
    )
    .bind(measurement_id)
    .bind(owner_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

/// Numbers newest-first rows downward from `first_number`. `newer` is the
/// measurement right before `items[0]` in the table, if any.
pub fn build_rows(
    items: &[Measurement],
    newer: Option<&Measurement>,
    first_number: i64,
    tz: Tz,
) -> Vec<MeasurementRow> {
    items
        .iter()
        .enumerate()
        .map(|(idx, m)| {
            let next = if idx == 0 { newer } else { items.get(idx - 1) };
            MeasurementRow {
                number: first_number - idx as i64,
                id: m.id,
                time: epoch_seconds(m.date_added),
                date_added: format_local(m.date_added, DATETIME_FORMAT, tz),
                data: m.data.clone(),
                time_to_next: next.map(|n| time_to_next_display(n.date_added, m.date_added)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn measurement(id: i64, at: DateTime<Utc>) -> Measurement {
        Measurement {
            id,
            device_id: 1,
            run_id: None,
            date_added: at,
            data: vec![id as f64],
        }
    }

    #[test]
    fn test_scope_filters() {
        assert_eq!(Scope::Run(4).filter(), "run_id = $1");
        assert_eq!(Scope::Unassigned(2).id(), 2);
        assert!(Scope::Unassigned(2).filter().contains("run_id IS NULL"));
    }

    #[test]
    fn test_build_rows_numbers_and_gaps() {
        let t = DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let newer = measurement(4, t + Duration::seconds(90));
        let items = vec![
            measurement(3, t + Duration::seconds(60)),
            measurement(2, t + Duration::seconds(30)),
        ];

        let rows = build_rows(&items, Some(&newer), 3, chrono_tz::UTC);
        assert_eq!(rows[0].number, 3);
        assert_eq!(rows[1].number, 2);
        assert_eq!(rows[0].time_to_next.as_deref(), Some("00m 30s"));
        assert_eq!(rows[1].time_to_next.as_deref(), Some("00m 30s"));
        assert_eq!(rows[1].date_added, "2024-01-01 12:00:30");

        let first_page = build_rows(&items, None, 2, chrono_tz::UTC);
        assert!(first_page[0].time_to_next.is_none());
    }
}
