//! Owner-facing HTTP views.
//!
//! Every route here acts on behalf of the user named in the upstream
//! authentication header and only ever touches that user's devices.

use crate::api;
use crate::axis::{TickPolicy, XAxis};
use crate::config::Config;
use crate::credentials::masked_api_key;
use crate::devices::{self, DateRange, DeviceForm, DeviceStats, DeviceSummary};
use crate::display::run_time_range_display;
use crate::errors::Error;
use crate::export;
use crate::measurements::{self, MeasurementsPage, Scope};
use crate::model::{ActionResponse, Device, Measurement, Run, User};
use crate::plot::{self, MapData, PlotData, PlotRange, INITIAL_PLOT_MAX_POINTS};
use crate::runs::{self, RunForm, RunSummary};
use crate::tz::epoch_seconds;
use crate::users;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/profile/", get(profile))
        .route("/profile/add-device/", post(add_device))
        .route("/devices/:sid/", get(device_detail))
        .route("/devices/:sid/delete-device/", post(delete_device))
        .route("/devices/:sid/add-run/", post(add_run))
        .route(
            "/devices/:sid/pagination-unassigned-measurements/:page/",
            get(unassigned_measurements_page),
        )
        .route("/devices/:sid/initial-plot/", get(device_initial_plot))
        .route("/devices/:sid/plot/", get(device_plot))
        .route("/devices/:sid/newest-data/", get(device_newest_data))
        .route("/devices/:sid/delete-data/", post(delete_device_data))
        .route("/devices/:sid/download/", get(download_device_data))
        .route("/runs/:id/", get(run_detail))
        .route("/runs/:id/finalise/", post(finalise_run))
        .route("/runs/:id/trim/", post(trim_run))
        .route("/runs/:id/delete-run-detach-data/", post(delete_run_detach_data))
        .route("/runs/:id/delete-run-and-data/", post(delete_run_and_data))
        .route("/runs/:id/download/", get(download_run_data))
        .route("/runs/:id/newest-data/", get(run_newest_data))
        .route(
            "/runs/:id/pagination-measurements/:page/",
            get(run_measurements_page),
        )
        .route("/measurements/:id/delete/", post(delete_measurement))
        .merge(api::router())
        .with_state(state)
}

/// The signed-in owner, resolved from the upstream authentication header.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let username = parts
            .headers
            .get(state.config.remote_user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Authentication("Login required".to_string()))?;

        let user = users::find_by_username(&state.pool, username).await?;
        Ok(CurrentUser(user))
    }
}

/// Rejects requests not marked with `X-Requested-With: XMLHttpRequest`.
pub struct Ajax;

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Ajax {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, AppError> {
        let is_ajax = parts
            .headers
            .get("x-requested-with")
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v == "XMLHttpRequest");
        if is_ajax {
            Ok(Ajax)
        } else {
            Err(Error::AjaxExpected.into())
        }
    }
}

#[derive(Debug, Serialize)]
struct ProfileDevice {
    #[serde(flatten)]
    summary: DeviceSummary,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct Profile {
    username: String,
    devices: Vec<ProfileDevice>,
}

async fn profile(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Profile>, AppError> {
    let devices = devices::list_for_owner(&state.pool, user.id)
        .await?
        .into_iter()
        .map(|summary| ProfileDevice {
            api_key: masked_api_key(&summary.device.token),
            summary,
        })
        .collect();

    Ok(Json(Profile {
        username: user.username,
        devices,
    }))
}

#[derive(Debug, Deserialize)]
struct AddDeviceRequest {
    name: String,
    columns: String,
}

#[derive(Debug, Serialize)]
struct DeviceCreated {
    status: &'static str,
    message: String,
    /// The only time the full key is ever returned.
    api_key: String,
    device: Device,
}

async fn add_device(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<AddDeviceRequest>,
) -> Result<(StatusCode, Json<DeviceCreated>), AppError> {
    let form = DeviceForm::parse(&req.name, &req.columns)?;
    let created = devices::create(&state.pool, &user, form).await?;

    Ok((
        StatusCode::CREATED,
        Json(DeviceCreated {
            status: "ok",
            message: format!(
                "Device {} added. Please save the API key as it is shown only once",
                created.device.name
            ),
            api_key: created.api_key,
            device: created.device,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct RunListItem {
    #[serde(flatten)]
    summary: RunSummary,
    time_range: String,
}

#[derive(Debug, Serialize)]
struct DeviceDetail {
    device: Device,
    api_key: String,
    has_plot: bool,
    has_map: bool,
    stats: DeviceStats,
    time_range: String,
    runs: Vec<RunListItem>,
    unassigned: MeasurementsPage,
}

async fn device_detail(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<i32>,
) -> Result<Json<DeviceDetail>, AppError> {
    let tz = state.config.display_timezone;
    let device = devices::get(&state.pool, user.id, sid).await?;
    let stats = devices::stats(&state.pool, device.id).await?;

    let runs = runs::list_for_device(&state.pool, device.id)
        .await?
        .into_iter()
        .map(|summary| RunListItem {
            time_range: run_time_range_display(summary.run.date_from, summary.run.date_to, tz),
            summary,
        })
        .collect();

    let unassigned = measurements::page(
        &state.pool,
        Scope::Unassigned(device.id),
        "1",
        state.config.page_size,
        tz,
    )
    .await?;

    Ok(Json(DeviceDetail {
        api_key: masked_api_key(&device.token),
        has_plot: device.has_plot(),
        has_map: device.has_map(),
        time_range: stats.time_range_display(tz),
        stats,
        runs,
        unassigned,
        device,
    }))
}

async fn delete_device(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<i32>,
) -> Result<Json<ActionResponse>, AppError> {
    let device = devices::delete(&state.pool, user.id, sid).await?;
    Ok(Json(ActionResponse::ok(format!("Device {} deleted", device.name))))
}

#[derive(Debug, Deserialize)]
struct AddRunRequest {
    name: String,
    date_from: String,
    date_to: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunCreated {
    status: &'static str,
    message: String,
    run: Run,
    num_assigned: u64,
}

async fn add_run(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<i32>,
    Json(req): Json<AddRunRequest>,
) -> Result<(StatusCode, Json<RunCreated>), AppError> {
    let form = RunForm::parse(
        &req.name,
        &req.date_from,
        req.date_to.as_deref(),
        state.config.display_timezone,
    )?;
    let (run, num_assigned) = runs::create_run(&state.pool, user.id, sid, form).await?;

    Ok((
        StatusCode::CREATED,
        Json(RunCreated {
            status: "ok",
            message: format!(
                "Run \"{}\" added. {} measurements assigned.",
                run.name, num_assigned
            ),
            run,
            num_assigned,
        }),
    ))
}

async fn unassigned_measurements_page(
    _: Ajax,
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((sid, page)): Path<(i32, String)>,
) -> Result<Json<MeasurementsPage>, AppError> {
    let device = devices::get(&state.pool, user.id, sid).await?;
    let page = measurements::page(
        &state.pool,
        Scope::Unassigned(device.id),
        &page,
        state.config.page_size,
        state.config.display_timezone,
    )
    .await?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
struct PlotResponse {
    /// The window reaches the present and the client should poll for newer data.
    is_now: bool,
    last_record_time: f64,
    num_measurements: i64,
    plot: Option<PlotData>,
    map: Option<MapData>,
}

/// A plot for plain devices, a map for devices reporting a position.
fn charts(
    config: &Config,
    device: &Device,
    measurements: &[Measurement],
    start_idx: i64,
    axis: Option<XAxis>,
) -> (Option<PlotData>, Option<MapData>) {
    let tz = config.display_timezone;
    if device.has_map() {
        let map = plot::map_data(
            device,
            measurements,
            start_idx,
            tz,
            config.maps_api_key.clone(),
        );
        return (None, map);
    }
    let plot = axis.map(|axis| plot::plot_data(&device.columns, measurements, start_idx, axis, tz));
    (plot, None)
}

fn newest_epoch(measurements: &[Measurement]) -> f64 {
    measurements
        .last()
        .map(|m| epoch_seconds(m.date_added))
        .unwrap_or(0.0)
}

async fn device_initial_plot(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<i32>,
) -> Result<Json<PlotResponse>, AppError> {
    let tz = state.config.display_timezone;
    let device = devices::get(&state.pool, user.id, sid).await?;
    let scope = Scope::Device(device.id);

    let latest = measurements::latest(&state.pool, scope, INITIAL_PLOT_MAX_POINTS).await?;
    let window = plot::initial_window(&latest, Utc::now());
    let shown = &latest[window.first..];

    let total = measurements::count(&state.pool, scope).await?;
    let start_idx = total - shown.len() as i64 + 1;
    let axis = XAxis::new(window.begin, window.end, tz, TickPolicy::FallBackToLargest);
    let (plot, map) = charts(&state.config, &device, shown, start_idx, Some(axis));

    Ok(Json(PlotResponse {
        is_now: window.is_now,
        last_record_time: newest_epoch(shown),
        num_measurements: total,
        plot,
        map,
    }))
}

#[derive(Debug, Deserialize)]
struct PlotQuery {
    date_from: Option<String>,
    date_to: Option<String>,
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, Error> {
    value
        .as_deref()
        .ok_or_else(|| Error::field(field, "This field is required."))
}

async fn device_plot(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<i32>,
    Query(query): Query<PlotQuery>,
) -> Result<Json<PlotResponse>, AppError> {
    let tz = state.config.display_timezone;
    let range = PlotRange::parse(
        required("date_from", &query.date_from)?,
        required("date_to", &query.date_to)?,
        Utc::now(),
        tz,
    )?;
    let device = devices::get(&state.pool, user.id, sid).await?;
    let axis = if device.has_plot() {
        Some(range.axis(tz)?)
    } else {
        None
    };

    let scope = Scope::Device(device.id);
    let data = measurements::in_range(&state.pool, scope, Some(range.begin), Some(range.end)).await?;
    let start_idx = measurements::count_before(&state.pool, scope, range.begin).await? + 1;
    let (plot, map) = charts(&state.config, &device, &data, start_idx, axis);

    Ok(Json(PlotResponse {
        is_now: range.is_now,
        last_record_time: newest_epoch(&data),
        num_measurements: data.len() as i64,
        plot,
        map,
    }))
}

#[derive(Debug, Deserialize)]
struct NewestQuery {
    last_record_time: Option<f64>,
}

/// Reply to a live-update poll.
#[derive(Debug, Default, Serialize)]
struct NewestData {
    any_new: bool,
    last_record_time: f64,
    num_measurements: Option<i64>,
    measurements: Option<MeasurementsPage>,
    /// New points only, plus the axis for the shifted window.
    plot: Option<PlotData>,
    /// Set when nothing is new but the window has moved on.
    xaxis: Option<XAxis>,
    map: Option<MapData>,
}

struct NewestSource<'a> {
    device: &'a Device,
    /// Scope of the points counted and plotted.
    scope: Scope,
    /// Scope of the measurements table shown next to the plot.
    table: Scope,
    axis: XAxis,
}

async fn newest_data(
    state: &AppState,
    source: NewestSource<'_>,
    last_record_time: Option<f64>,
) -> Result<NewestData, Error> {
    let last_record_time = last_record_time
        .ok_or_else(|| Error::field("last_record_time", "This field is required."))?;
    let cutoff = plot::newest_cutoff(last_record_time)?;
    let device = source.device;

    let new = measurements::in_range(&state.pool, source.scope, Some(cutoff), None).await?;
    if new.is_empty() {
        return Ok(NewestData {
            last_record_time,
            xaxis: device.has_plot().then_some(source.axis),
            ..NewestData::default()
        });
    }

    let total = measurements::count(&state.pool, source.scope).await?;
    let start_idx = total - new.len() as i64 + 1;
    let page = measurements::page(
        &state.pool,
        source.table,
        "1",
        state.config.page_size,
        state.config.display_timezone,
    )
    .await?;
    let (plot, map) = charts(&state.config, device, &new, start_idx, Some(source.axis));

    Ok(NewestData {
        any_new: true,
        last_record_time: newest_epoch(&new),
        num_measurements: Some(total),
        measurements: Some(page),
        plot,
        xaxis: None,
        map,
    })
}

async fn device_newest_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<i32>,
    Query(query): Query<NewestQuery>,
) -> Result<Json<NewestData>, AppError> {
    let device = devices::get(&state.pool, user.id, sid).await?;

    // The live window slides with the clock; recompute it the same way the initial plot does.
    let latest =
        measurements::latest(&state.pool, Scope::Device(device.id), INITIAL_PLOT_MAX_POINTS).await?;
    let window = plot::initial_window(&latest, Utc::now());
    let axis = XAxis::new(
        window.begin,
        window.end,
        state.config.display_timezone,
        TickPolicy::FallBackToLargest,
    );

    let source = NewestSource {
        device: &device,
        scope: Scope::Device(device.id),
        table: Scope::Unassigned(device.id),
        axis,
    };
    Ok(Json(newest_data(&state, source, query.last_record_time).await?))
}

#[derive(Debug, Deserialize)]
struct DateRangeRequest {
    date_from: Option<String>,
    date_to: Option<String>,
}

impl DateRangeRequest {
    fn parse(&self, config: &Config) -> Result<DateRange, Error> {
        DateRange::parse(
            self.date_from.as_deref(),
            self.date_to.as_deref(),
            config.display_timezone,
        )
    }
}

async fn delete_device_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<i32>,
    Json(req): Json<DateRangeRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    let range = req.parse(&state.config)?;
    let device = devices::get(&state.pool, user.id, sid).await?;
    let deleted = devices::delete_measurements(&state.pool, &device, range).await?;
    Ok(Json(ActionResponse::ok(format!("{} records deleted", deleted))))
}

fn csv_response(filename: String, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}

async fn download_device_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<i32>,
    Query(req): Query<DateRangeRequest>,
) -> Result<Response, AppError> {
    let range = req.parse(&state.config)?;
    let device = devices::get(&state.pool, user.id, sid).await?;

    let mut data = measurements::in_range(
        &state.pool,
        Scope::Device(device.id),
        range.date_from,
        range.date_to,
    )
    .await?;
    // The download range excludes its end.
    data.retain(|m| range.date_to.map_or(true, |to| m.date_added < to));

    let body = export::to_csv_bytes(&device.columns, &data, state.config.display_timezone)?;
    info!(
        "Exported {} measurement(s) of device {} #{}",
        data.len(),
        device.name,
        device.sequence_id
    );
    Ok(csv_response(export::device_filename(&device.name), body))
}

/// A run together with the device it belongs to, both owned by `user`.
async fn owned_run(pool: &PgPool, user: &User, run_id: i64) -> Result<(Run, Device), Error> {
    let run = runs::get(pool, user.id, run_id).await?;
    let device = devices::get_by_id(pool, user.id, run.device_id).await?;
    Ok((run, device))
}

#[derive(Debug, Serialize)]
struct RunDetail {
    run: Run,
    device: Device,
    time_range: String,
    num_measurements: i64,
    can_be_trimmed: bool,
    /// The run is still open, so the client should poll for newer data.
    needs_updating: bool,
    has_plot: bool,
    has_map: bool,
    last_record_time: f64,
    measurements: MeasurementsPage,
    plot: Option<PlotData>,
    map: Option<MapData>,
}

async fn run_detail(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Json<RunDetail>, AppError> {
    let tz = state.config.display_timezone;
    let now = Utc::now();
    let (run, device) = owned_run(&state.pool, &user, run_id).await?;

    let data = measurements::all_ascending(&state.pool, Scope::Run(run.id)).await?;
    let first_last = data
        .first()
        .zip(data.last())
        .map(|(first, last)| (first.date_added, last.date_added));
    let page = measurements::page(
        &state.pool,
        Scope::Run(run.id),
        "1",
        state.config.page_size,
        tz,
    )
    .await?;
    let (plot, map) = charts(
        &state.config,
        &device,
        &data,
        1,
        Some(plot::run_axis(&run, now, tz)),
    );

    Ok(Json(RunDetail {
        time_range: run_time_range_display(run.date_from, run.date_to, tz),
        num_measurements: data.len() as i64,
        can_be_trimmed: runs::can_be_trimmed(&run, first_last),
        needs_updating: runs::needs_updating(&run, now),
        has_plot: device.has_plot(),
        has_map: device.has_map(),
        last_record_time: newest_epoch(&data),
        measurements: page,
        plot,
        map,
        run,
        device,
    }))
}

async fn finalise_run(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Json<ActionResponse>, AppError> {
    let run = runs::finalize(&state.pool, user.id, run_id, Utc::now()).await?;
    Ok(Json(ActionResponse::ok(format!("Run {} finalised", run.name))))
}

async fn trim_run(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Json<ActionResponse>, AppError> {
    let run = runs::trim(&state.pool, user.id, run_id).await?;
    Ok(Json(ActionResponse::ok(format!(
        "Run {} trimmed to {}",
        run.name,
        run_time_range_display(run.date_from, run.date_to, state.config.display_timezone)
    ))))
}

async fn delete_run_detach_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Json<ActionResponse>, AppError> {
    let (run, detached) = runs::delete_detach(&state.pool, user.id, run_id).await?;
    Ok(Json(ActionResponse::ok(format!(
        "Run {} deleted; its {} records are now unassigned",
        run.name, detached
    ))))
}

async fn delete_run_and_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Json<ActionResponse>, AppError> {
    let (run, deleted) = runs::delete_with_data(&state.pool, user.id, run_id).await?;
    Ok(Json(ActionResponse::ok(format!(
        "Run {} and its {} records deleted",
        run.name, deleted
    ))))
}

async fn download_run_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
) -> Result<Response, AppError> {
    let (run, device) = owned_run(&state.pool, &user, run_id).await?;
    let data = measurements::all_ascending(&state.pool, Scope::Run(run.id)).await?;
    let body = export::to_csv_bytes(&device.columns, &data, state.config.display_timezone)?;
    Ok(csv_response(export::run_filename(&device.name, &run.name), body))
}

async fn run_newest_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(run_id): Path<i64>,
    Query(query): Query<NewestQuery>,
) -> Result<Json<NewestData>, AppError> {
    let (run, device) = owned_run(&state.pool, &user, run_id).await?;
    let source = NewestSource {
        device: &device,
        scope: Scope::Run(run.id),
        table: Scope::Run(run.id),
        axis: plot::run_axis(&run, Utc::now(), state.config.display_timezone),
    };
    Ok(Json(newest_data(&state, source, query.last_record_time).await?))
}

async fn run_measurements_page(
    _: Ajax,
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((run_id, page)): Path<(i64, String)>,
) -> Result<Json<MeasurementsPage>, AppError> {
    let run = runs::get(&state.pool, user.id, run_id).await?;
    let page = measurements::page(
        &state.pool,
        Scope::Run(run.id),
        &page,
        state.config.page_size,
        state.config.display_timezone,
    )
    .await?;
    Ok(Json(page))
}

async fn delete_measurement(
    _: Ajax,
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(measurement_id): Path<i64>,
) -> Result<Json<ActionResponse>, AppError> {
    measurements::delete(&state.pool, user.id, measurement_id).await?;
    Ok(Json(ActionResponse::ok("Measurement deleted")))
}

pub struct AppError(pub Error);

/// HTTP status an error is reported with.
pub fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) | Error::FieldErrors(_) => StatusCode::BAD_REQUEST,
        Error::Authentication(_) => StatusCode::UNAUTHORIZED,
        Error::AjaxExpected => StatusCode::FORBIDDEN,
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::Overlap { .. } | Error::AlreadyFinalized | Error::NoMeasurements => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The `errors` object of an error reply. Internal failures are not described.
fn error_details(err: &Error) -> Value {
    match err {
        Error::FieldErrors(errors) => json!(errors),
        Error::Validation(msg) => json!({ "non_field_errors": [msg] }),
        Error::Overlap { .. } | Error::AlreadyFinalized | Error::NoMeasurements => {
            json!({ "non_field_errors": [err.to_string()] })
        }
        Error::Authentication(msg) => json!({ "detail": msg }),
        Error::AjaxExpected | Error::NotFound => json!({ "detail": err.to_string() }),
        _ => json!({ "detail": "Internal server error" }),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        let body = json!({ "status": "error", "errors": error_details(&self.0) });
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
