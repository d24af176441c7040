//! Device registry: provisioning, API key authentication and per-device views.

use crate::credentials::{
    calculate_hash, generate_api_key, generate_salt, is_well_formed, matches_device, token_of,
};
use crate::display::time_range_display;
use crate::errors::{Error, Result};
use crate::model::{Device, User};
use crate::tz::{parse_local, DATETIME_FORMAT};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::{debug, info};

const DEVICE_COLUMNS: &str =
    "id, user_id, sequence_id, name, columns, token, salt, api_key_hash, date_added";

pub const MAX_NAME_LEN: usize = 30;

/// Validated input for a new device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceForm {
    pub name: String,
    pub columns: Vec<String>,
}

impl DeviceForm {
    /// `columns` is a comma separated list, e.g. `"temp, humidity"`.
    pub fn parse(name: &str, columns: &str) -> Result<Self> {
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();

        let name = name.trim();
        if name.is_empty() {
            errors
                .entry("name".to_string())
                .or_default()
                .push("This field is required.".to_string());
        } else if name.chars().count() > MAX_NAME_LEN {
            errors.entry("name".to_string()).or_default().push(format!(
                "Ensure this value has at most {} characters.",
                MAX_NAME_LEN
            ));
        }

        let columns: Vec<String> = columns.split(',').map(|c| c.trim().to_string()).collect();
        if columns.iter().any(|c| c.is_empty()) {
            errors
                .entry("columns".to_string())
                .or_default()
                .push("Column name can't be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(Error::FieldErrors(errors));
        }

        Ok(Self {
            name: name.to_string(),
            columns,
        })
    }
}

/// A freshly provisioned device. `api_key` is never stored and cannot be recovered later.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub device: Device,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub device: Device,
    pub num_measurements: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct DeviceStats {
    pub num_runs: i64,
    pub num_measurements: i64,
    pub num_unassigned_measurements: i64,
    pub first_measurement: Option<DateTime<Utc>>,
    pub last_measurement: Option<DateTime<Utc>>,
}

impl DeviceStats {
    pub fn time_range_display(&self, tz: Tz) -> String {
        match (self.first_measurement, self.last_measurement) {
            (Some(first), Some(last)) => time_range_display(first, last, tz),
            _ => String::new(),
        }
    }
}

/// Creates a device with the owner's next sequence number.
///
/// The owner's row stays locked until commit, so concurrent creations for
/// the same owner are serialized and sequence numbers never collide.
pub async fn create(pool: &PgPool, owner: &User, form: DeviceForm) -> Result<NewDevice> {
    let api_key = generate_api_key();
    let token = token_of(&api_key).to_string();
    let salt = generate_salt();
    let api_key_hash = calculate_hash(&api_key, &salt);

    let mut tx = pool.begin().await?;

    sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(owner.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::from_lookup)?;

    let last_sequence_id: i32 =
        sqlx::query_scalar("SELECT COALESCE(MAX(sequence_id), 0) FROM devices WHERE user_id = $1")
            .bind(owner.id)
            .fetch_one(&mut *tx)
            .await?;

    let sql = format!(
        r#"
        INSERT INTO devices (user_id, sequence_id, name, columns, token, salt, api_key_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {}
        "#,
        DEVICE_COLUMNS
    );
    let device = sqlx::query_as::<_, Device>(&sql)
        .bind(owner.id)
        .bind(last_sequence_id + 1)
        .bind(&form.name)
        .bind(&form.columns)
        .bind(&token)
        .bind(&salt)
        .bind(&api_key_hash)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(
        "Device {} #{} created for {}",
        device.name, device.sequence_id, owner.username
    );
    Ok(NewDevice { device, api_key })
}

/// Resolves a presented API key to its device.
///
/// A key of the wrong shape is rejected before touching the database. A
/// key whose token matches but whose hash does not fails with the same
/// error as an unknown token.
pub async fn authenticate(pool: &PgPool, api_key: &str) -> Result<Device> {
    if !is_well_formed(api_key) {
        return Err(incorrect_api_key());
    }

    let sql = format!("SELECT {} FROM devices WHERE token = $1", DEVICE_COLUMNS);
    let candidates = sqlx::query_as::<_, Device>(&sql)
        .bind(token_of(api_key))
        .fetch_all(pool)
        .await?;

    debug!("{} candidate device(s) for presented token", candidates.len());
    candidates
        .into_iter()
        .find(|d| matches_device(api_key, &d.salt, &d.api_key_hash))
        .ok_or_else(incorrect_api_key)
}

fn incorrect_api_key() -> Error {
    Error::Authentication("Incorrect API key".to_string())
}

pub async fn get(pool: &PgPool, owner_id: i64, sequence_id: i32) -> Result<Device> {
    let sql = format!(
        "SELECT {} FROM devices WHERE user_id = $1 AND sequence_id = $2",
        DEVICE_COLUMNS
    );
    sqlx::query_as::<_, Device>(&sql)
        .bind(owner_id)
        .bind(sequence_id)
        .fetch_one(pool)
        .await
        .map_err(Error::from_lookup)
}

pub async fn get_by_id(pool: &PgPool, owner_id: i64, device_id: i64) -> Result<Device> {
    let sql = format!(
        "SELECT {} FROM devices WHERE user_id = $1 AND id = $2",
        DEVICE_COLUMNS
    );
    sqlx::query_as::<_, Device>(&sql)
        .bind(owner_id)
        .bind(device_id)
        .fetch_one(pool)
        .await
        .map_err(Error::from_lookup)
}

pub async fn list_for_owner(pool: &PgPool, owner_id: i64) -> Result<Vec<DeviceSummary>> {
    let rows = sqlx::query_as::<_, DeviceSummary>(
        r#"
        SELECT d.id, d.user_id, d.sequence_id, d.name, d.columns, d.token, d.salt,
               d.api_key_hash, d.date_added, COUNT(m.id) AS num_measurements
        FROM devices d
        LEFT JOIN measurements m ON m.device_id = d.id
        WHERE d.user_id = $1
        GROUP BY d.id
        ORDER BY d.sequence_id
        "#,
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn stats(pool: &PgPool, device_id: i64) -> Result<DeviceStats> {
    let stats = sqlx::query_as::<_, DeviceStats>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM runs WHERE device_id = $1) AS num_runs,
            (SELECT COUNT(*) FROM measurements WHERE device_id = $1) AS num_measurements,
            (SELECT COUNT(*) FROM measurements WHERE device_id = $1 AND run_id IS NULL)
                AS num_unassigned_measurements,
            (SELECT MIN(date_added) FROM measurements WHERE device_id = $1) AS first_measurement,
            (SELECT MAX(date_added) FROM measurements WHERE device_id = $1) AS last_measurement
        "#,
    )
    .bind(device_id)
    .fetch_one(pool)
    .await?;
    Ok(stats)
}

/// Deletes the device together with its runs and measurements.
pub async fn delete(pool: &PgPool, owner_id: i64, sequence_id: i32) -> Result<Device> {
    let sql = format!(
        "DELETE FROM devices WHERE user_id = $1 AND sequence_id = $2 RETURNING {}",
        DEVICE_COLUMNS
    );
    let device = sqlx::query_as::<_, Device>(&sql)
        .bind(owner_id)
        .bind(sequence_id)
        .fetch_one(pool)
        .await
        .map_err(Error::from_lookup)?;

    info!("Device {} #{} deleted", device.name, device.sequence_id);
    Ok(device)
}

/// Optional `[date_from, date_to)` bounds entered as `YYYY-MM-DD HH:MM:SS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn parse(date_from: Option<&str>, date_to: Option<&str>, tz: Tz) -> Result<Self> {
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut parse = |field: &str, raw: Option<&str>| match raw.map(str::trim) {
            None | Some("") => None,
            Some(s) => match parse_local(s, DATETIME_FORMAT, tz) {
                Ok(dt) => Some(dt),
                Err(e) => {
                    errors
                        .entry(field.to_string())
                        .or_default()
                        .push(validation_message(e));
                    None
                }
            },
        };

        let range = Self {
            date_from: parse("date_from", date_from),
            date_to: parse("date_to", date_to),
        };

        if let (Some(from), Some(to)) = (range.date_from, range.date_to) {
            if to <= from {
                errors
                    .entry("non_field_errors".to_string())
                    .or_default()
                    .push("date-to should be later than date-from".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(Error::FieldErrors(errors));
        }
        Ok(range)
    }
}

pub(crate) fn validation_message(err: Error) -> String {
    match err {
        Error::Validation(msg) => msg,
        other => other.to_string(),
    }
}

/// Bulk deletes the device's measurements in `[date_from, date_to)`.
pub async fn delete_measurements(pool: &PgPool, device: &Device, range: DateRange) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM measurements
        WHERE device_id = $1
          AND ($2::timestamptz IS NULL OR date_added >= $2)
          AND ($3::timestamptz IS NULL OR date_added < $3)
        "#,
    )
    .bind(device.id)
    .bind(range.date_from)
    .bind(range.date_to)
    .execute(pool)
    .await?;

    info!(
        "Deleted {} measurement(s) of device {} #{}",
        result.rows_affected(),
        device.name,
        device.sequence_id
    );
    Ok(result.rows_affected())
}
