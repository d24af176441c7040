use chrono::{DateTime, Utc};
use serde::Serialize;

/// Account owning devices. Provisioned by the external login layer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
}

/// Registered telemetry source.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub user_id: i64,
    pub sequence_id: i32,
    pub name: String,
    pub columns: Vec<String>,
    pub token: String,
    #[serde(skip_serializing)]
    pub salt: String,
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub date_added: DateTime<Utc>,
}

impl Device {
    /// Devices reporting both `lat` and `lon` are shown on a map instead of a plot.
    pub fn has_map(&self) -> bool {
        self.column_index("lat").is_some() && self.column_index("lon").is_some()
    }

    pub fn has_plot(&self) -> bool {
        !self.has_map()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// One timestamped row of device data.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Measurement {
    pub id: i64,
    pub device_id: i64,
    pub run_id: Option<i64>,
    pub date_added: DateTime<Utc>,
    pub data: Vec<f64>,
}

/// Named time window over a device's measurements. `date_to == None` means ongoing.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Run {
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    pub date_from: DateTime<Utc>,
    pub date_to: Option<DateTime<Utc>>,
}

/// Owner-facing action acknowledgement; carries the flash message.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub status: &'static str,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok",
            message: message.into(),
        }
    }
}
