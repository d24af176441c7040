use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Validation failures keyed by the offending input field.
    #[error("Validation error: {}", format_field_errors(.0))]
    FieldErrors(BTreeMap<String, Vec<String>>),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("This run would overlap with run \"{name}\" (#{id})")]
    Overlap { id: i64, name: String },

    #[error("Run already finalised")]
    AlreadyFinalized,

    #[error("Run has no measurements")]
    NoMeasurements,

    #[error("Not found")]
    NotFound,

    #[error("Ajax request expected")]
    AjaxExpected,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), vec![message.into()]);
        Error::FieldErrors(errors)
    }

    /// Collapses a `sqlx::Error::RowNotFound` into `NotFound`.
    pub fn from_lookup(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound,
            other => Error::Database(other),
        }
    }
}

fn format_field_errors(errors: &BTreeMap<String, Vec<String>>) -> String {
    errors
        .iter()
        .map(|(field, messages)| format!("{}: {}", field, messages.join("; ")))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_error_display() {
        let err = Error::field("data", "Expected 2 columns; got 3");
        assert_eq!(
            err.to_string(),
            "Validation error: data: Expected 2 columns; got 3"
        );
    }

    #[test]
    fn test_row_not_found_becomes_not_found() {
        assert!(matches!(
            Error::from_lookup(sqlx::Error::RowNotFound),
            Error::NotFound
        ));
        assert!(matches!(
            Error::from_lookup(sqlx::Error::PoolClosed),
            Error::Database(_)
        ));
    }
}
