//! HTTP surface mounted under `/api/youtube`.
//!
//! Handlers are thin: parse the JSON body, run the blocking component call on
//! the blocking pool, and wrap the result in `{success, ...}`.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::task;
use tracing::error;

use crate::{
    config::ServiceConfig,
    downloader::{DownloadOptions, Downloader},
    error::{DownloadError, ScheduleError, StoreError},
    schedule::{CronHost, DEFAULT_HOUR, DEFAULT_MINUTE, ScheduleReconciler},
    store::{DEFAULT_QUALITY, Store},
};

pub const API_PREFIX: &str = "/api/youtube";

#[derive(Clone)]
pub struct AppState {
    store: Arc<Store>,
    schedule: Arc<ScheduleReconciler>,
    downloader: Arc<Downloader>,
}

impl AppState {
    pub fn new(config: &ServiceConfig, host: Arc<dyn CronHost>) -> Result<Self, StoreError> {
        Ok(Self {
            store: Arc::new(Store::new(config)?),
            schedule: Arc::new(ScheduleReconciler::new(host, config)),
            downloader: Arc::new(Downloader::new(config)),
        })
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        let body = json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateSubscription(_) => ApiError::bad_request(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::InvalidTimeRange { .. } => ApiError::bad_request(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::InvalidUrl => ApiError::bad_request(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/download", post(download_video))
        .route("/download/info", post(video_info))
        .route(
            "/subscriptions",
            get(list_subscriptions).post(add_subscription),
        )
        .route("/subscriptions/{id}", delete(remove_subscription))
        .route("/subscriptions/{id}/fetch", post(fetch_subscription))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/schedule", get(get_schedule).post(update_schedule))
        .route("/logs", get(get_logs));

    Router::new().nest(API_PREFIX, routes).with_state(state)
}

#[derive(Deserialize)]
struct DownloadBody {
    url: Option<String>,
    quality: Option<String>,
    format: Option<String>,
    #[serde(default)]
    audio_only: bool,
}

#[derive(Deserialize)]
struct InfoBody {
    url: Option<String>,
}

#[derive(Deserialize)]
struct SubscriptionBody {
    url: Option<String>,
    name: Option<String>,
    #[serde(default)]
    audio_only: bool,
}

#[derive(Deserialize)]
struct ScheduleBody {
    #[serde(default)]
    enabled: bool,
    hour: Option<i64>,
    minute: Option<i64>,
}

/// Bodies are parsed by hand so a missing or malformed body is a 400 in the
/// same `{success, error}` shape as every other failure.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::bad_request("No data provided"));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Null) => Err(ApiError::bad_request("No data provided")),
        Ok(Value::Object(map)) if map.is_empty() => {
            Err(ApiError::bad_request("No data provided"))
        }
        Ok(value) => serde_json::from_value(value)
            .map_err(|err| ApiError::bad_request(format!("Invalid request body: {err}"))),
        Err(err) => Err(ApiError::bad_request(format!("Invalid JSON body: {err}"))),
    }
}

fn require_url(url: Option<String>) -> ApiResult<String> {
    url.filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing required field: url"))
}

async fn blocking<F, T>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
}

async fn download_video(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let body: DownloadBody = parse_body(&body)?;
    let url = require_url(body.url)?;

    let result = blocking(move || {
        let settings = state.store.get_settings();
        let options = DownloadOptions {
            quality: body.quality.unwrap_or_else(|| DEFAULT_QUALITY.to_string()),
            format: body.format,
            audio_only: body.audio_only,
            auto_hardlink: settings.auto_hardlink(),
        };
        Ok(state.downloader.download_video(&url, &options)?)
    })
    .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Download started successfully",
        "data": result,
    })))
}

async fn video_info(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let body: InfoBody = parse_body(&body)?;
    let url = require_url(body.url)?;

    let info = blocking(move || Ok(state.downloader.video_info(&url)?)).await?;
    Ok(Json(json!({
        "success": true,
        "data": info,
    })))
}

async fn list_subscriptions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let subscriptions = blocking(move || Ok(state.store.list_subscriptions())).await?;
    Ok(Json(json!({
        "success": true,
        "subscriptions": subscriptions,
    })))
}

async fn add_subscription(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let body: SubscriptionBody = parse_body(&body)?;
    let url = require_url(body.url)?;

    let subscription = blocking(move || {
        Ok(state
            .store
            .add_subscription(&url, body.name.as_deref(), body.audio_only)?)
    })
    .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Subscription added successfully",
        "subscription": subscription,
    })))
}

async fn remove_subscription(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let removed = blocking(move || Ok(state.store.remove_subscription(&id)?)).await?;
    if !removed {
        return Err(ApiError::not_found("Subscription not found"));
    }
    Ok(Json(json!({
        "success": true,
        "message": "Subscription removed successfully",
    })))
}

async fn fetch_subscription(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let (name, result) = blocking(move || {
        let subscription = state
            .store
            .find_subscription(&id)
            .ok_or_else(|| ApiError::not_found("Subscription not found"))?;
        let settings = state.store.get_settings();
        let options = DownloadOptions::from_settings(&settings, subscription.audio_only);
        let result = state
            .downloader
            .download_channel(&subscription.url, &options)?;
        Ok((subscription.name, result))
    })
    .await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Download started for {name}"),
        "data": result,
    })))
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let settings = blocking(move || Ok(state.store.get_settings())).await?;
    Ok(Json(json!({
        "success": true,
        "settings": settings,
    })))
}

async fn update_settings(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let partial: Map<String, Value> = parse_body(&body)?;
    let settings = blocking(move || Ok(state.store.update_settings(partial)?)).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Settings updated successfully",
        "settings": settings,
    })))
}

async fn get_schedule(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let schedule = blocking(move || Ok(state.schedule.read())).await?;
    Ok(Json(json!({
        "success": true,
        "schedule": schedule,
    })))
}

async fn update_schedule(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let body: ScheduleBody = parse_body(&body)?;
    let hour = body.hour.unwrap_or(i64::from(DEFAULT_HOUR));
    let minute = body.minute.unwrap_or(i64::from(DEFAULT_MINUTE));

    let schedule = blocking(move || Ok(state.schedule.write(body.enabled, hour, minute)?)).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Schedule updated successfully",
        "schedule": schedule,
    })))
}

async fn get_logs(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let logs = blocking(move || Ok(state.downloader.activity_log().read_all())).await?;
    Ok(Json(json!({
        "success": true,
        "logs": logs,
    })))
}
