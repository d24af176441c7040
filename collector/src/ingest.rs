use crate::errors::{Error, Result};
use crate::metrics::MEASUREMENTS_STORED_TOTAL;
use crate::model::{Device, Measurement};
use sqlx::PgPool;
use tracing::debug;

/// A payload must carry exactly one finite value per device column.
pub fn validate_data(device: &Device, data: &[f64]) -> Result<()> {
    if data.len() != device.columns.len() {
        return Err(Error::field(
            "data",
            format!(
                "Expected {} columns; got {}",
                device.columns.len(),
                data.len()
            ),
        ));
    }

    if let Some(idx) = data.iter().position(|v| !v.is_finite()) {
        return Err(Error::field(
            "data",
            format!("Value for column {} is not a finite number", device.columns[idx]),
        ));
    }

    Ok(())
}

/// Stores one measurement stamped with the server time and assigns it to
/// the device's run covering that instant, if any.
pub async fn ingest(pool: &PgPool, device: &Device, data: Vec<f64>) -> Result<Measurement> {
    validate_data(device, &data)?;

    let mut tx = pool.begin().await?;

    let mut measurement = sqlx::query_as::<_, Measurement>(
        r#"
        INSERT INTO measurements (device_id, data)
        VALUES ($1, $2)
        RETURNING id, device_id, run_id, date_added, data
        "#,
    )
    .bind(device.id)
    .bind(&data)
    .fetch_one(&mut *tx)
    .await?;

    // Runs never overlap, so at most one matches.
    let run_id: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM runs
        WHERE device_id = $1
          AND date_from <= $2
          AND (date_to IS NULL OR date_to > $2)
        LIMIT 1
        "#,
    )
    .bind(device.id)
    .bind(measurement.date_added)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(run_id) = run_id {
        sqlx::query("UPDATE measurements SET run_id = $1 WHERE id = $2")
            .bind(run_id)
            .bind(measurement.id)
            .execute(&mut *tx)
            .await?;
        measurement.run_id = Some(run_id);
    }

    tx.commit().await?;

    MEASUREMENTS_STORED_TOTAL.inc();
    debug!(
        "Measurement {} stored for device {} (run {:?})",
        measurement.id, device.id, measurement.run_id
    );
    Ok(measurement)
}
