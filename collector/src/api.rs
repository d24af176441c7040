//! Device-facing upload endpoint.

use crate::devices;
use crate::errors::{Error, Result};
use crate::ingest;
use crate::metrics::{
    AUTH_FAILURES_TOTAL, INGEST_LATENCY_SECONDS, INGEST_REQUESTS_TOTAL,
    MEASUREMENTS_REJECTED_TOTAL,
};
use crate::rest::{AppError, AppState};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::PgPool;

const API_KEY_FIELD: &str = "api-key";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/measurements/", post(post_measurement))
        .route("/api/measurements", post(post_measurement))
}

async fn post_measurement(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<(StatusCode, Json<Value>), AppError> {
    INGEST_REQUESTS_TOTAL.inc();
    let timer = INGEST_LATENCY_SECONDS.start_timer();
    let result = store(&state.pool, &headers, &body).await;
    timer.observe_duration();

    match &result {
        Err(Error::Authentication(_)) => AUTH_FAILURES_TOTAL.inc(),
        Err(Error::FieldErrors(_)) | Err(Error::Validation(_)) => {
            MEASUREMENTS_REJECTED_TOTAL.inc()
        }
        _ => {}
    }
    result?;

    Ok((StatusCode::CREATED, Json(json!({ "status": "ok" }))))
}

async fn store(pool: &PgPool, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    // A body that is not JSON still gets a chance to authenticate via the header.
    let payload: Option<Value> = serde_json::from_slice(body).ok();

    let api_key = api_key_from(headers, payload.as_ref())
        .ok_or_else(|| Error::Authentication("Missing API key".to_string()))?;
    let device = devices::authenticate(pool, &api_key).await?;

    let data = parse_data(payload.as_ref())?;
    ingest::ingest(pool, &device, data).await?;
    Ok(())
}

/// The `API-KEY` header wins over an `api-key` field in the body. The value
/// is passed on untouched; padding makes the key the wrong length.
fn api_key_from(headers: &HeaderMap, payload: Option<&Value>) -> Option<String> {
    headers
        .get(API_KEY_FIELD)
        .and_then(|v| v.to_str().ok())
        .or_else(|| payload?.get(API_KEY_FIELD)?.as_str())
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

fn parse_data(payload: Option<&Value>) -> Result<Vec<f64>> {
    let raw = payload
        .and_then(|p| p.get("data"))
        .ok_or_else(|| Error::field("data", "This field is required."))?;
    serde_json::from_value(raw.clone())
        .map_err(|_| Error::field("data", "Expected a list of numbers."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{generate_api_key, is_well_formed, API_KEY_LEN};
    use axum::http::HeaderValue;

    #[test]
    fn test_api_key_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("API-KEY", HeaderValue::from_static("abcd1234"));
        let payload = json!({ "api-key": "fromthebody", "data": [1.0] });
        assert_eq!(
            api_key_from(&headers, Some(&payload)).as_deref(),
            Some("abcd1234")
        );
    }

    #[test]
    fn test_api_key_from_body() {
        let headers = HeaderMap::new();
        let payload = json!({ "api-key": "fromthebody", "data": [1.0] });
        assert_eq!(
            api_key_from(&headers, Some(&payload)).as_deref(),
            Some("fromthebody")
        );
        assert_eq!(api_key_from(&headers, None), None);
        assert_eq!(api_key_from(&headers, Some(&json!({ "api-key": "" }))), None);
    }

    #[test]
    fn test_padded_key_is_not_trimmed() {
        let key = generate_api_key();
        let payload = json!({ "api-key": format!(" {}", key), "data": [1.0] });
        let presented = api_key_from(&HeaderMap::new(), Some(&payload)).unwrap();
        assert_eq!(presented.len(), API_KEY_LEN + 1);
        assert!(!is_well_formed(&presented));
    }

    #[tokio::test]
    async fn test_padded_key_fails_authentication() {
        // Rejected on shape, so the pool is never used.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://nobody@localhost:1/none")
            .unwrap();
        let key = generate_api_key();
        let payload = json!({ "api-key": format!("{} ", key), "data": [1.0] });
        let presented = api_key_from(&HeaderMap::new(), Some(&payload)).unwrap();
        assert!(matches!(
            devices::authenticate(&pool, &presented).await,
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn test_parse_data() {
        let payload = json!({ "data": [1, 2.5, -3] });
        assert_eq!(parse_data(Some(&payload)).unwrap(), vec![1.0, 2.5, -3.0]);

        for bad in [json!({}), json!({ "data": "1,2" }), json!({ "data": [1, "x"] })] {
            match parse_data(Some(&bad)) {
                Err(Error::FieldErrors(errors)) => assert!(errors.contains_key("data")),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(parse_data(None).is_err());
    }
}
