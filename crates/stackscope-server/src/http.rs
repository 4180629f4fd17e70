//! HTTP facade over the tile service.
//!
//! Request validation lives here: bad coordinates, unknown channel keys and
//! malformed settings are the caller's fault and return 400. Everything past
//! validation is the server's problem and never surfaces on tile endpoints;
//! those respond 200 with a black PNG on internal failure. `/health` is the
//! one endpoint allowed to return 500.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use stackscope_compose::settings::{ChannelSettings, SettingsMap};
use stackscope_store::scheduler::DEFAULT_PRIORITY;
use stackscope_store::types::{ChannelId, MAX_SCALE, TileCoord};

use crate::service::AppState;

/// Create the HTTP router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/tile", axum::routing::get(handle_tile))
        .route("/merged-tile", axum::routing::get(handle_merged_tile))
        .route("/prefetch", axum::routing::get(handle_prefetch))
        .route("/health", axum::routing::get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Query parameters shared by the tile endpoints.
#[derive(Debug, Deserialize)]
pub struct TileParams {
    /// Dataset identifier
    pub dataset_id: String,
    /// Timestamp folder; the configured default applies when omitted
    pub timestamp: Option<String>,
    /// Channel key; defaults to brightfield (0)
    pub channel: Option<u8>,
    /// Channel keys for merged tiles, comma-separated
    pub channels: Option<String>,
    /// Scale level
    pub scale: u8,
    /// Column index in tile units
    pub x: u32,
    /// Row index in tile units
    pub y: u32,
    /// Per-channel contrast, JSON scalar or object keyed by channel key
    pub contrast: Option<String>,
    /// Per-channel brightness, JSON scalar or object keyed by channel key
    pub brightness: Option<String>,
    /// Per-channel percentile window, JSON pair or object keyed by channel key
    pub threshold: Option<String>,
    /// Per-channel color, JSON `[r,g,b]` or object keyed by channel key
    pub color: Option<String>,
    /// Scheduling priority; lower wins
    pub priority: Option<i32>,
}

/// Query parameters for the prefetch endpoint.
#[derive(Debug, Deserialize)]
pub struct PrefetchParams {
    /// Dataset identifier
    pub dataset_id: String,
    /// Timestamp folder; the configured default applies when omitted
    pub timestamp: Option<String>,
    /// Channel key; defaults to brightfield (0)
    pub channel: Option<u8>,
    /// Scale level
    pub scale: u8,
    /// Tiles as comma-separated `y.x` pairs, e.g. `3.4,3.5,4.4`
    pub tiles: String,
    /// Scheduling priority; lower wins
    pub priority: Option<i32>,
}

/// Application-level error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Malformed request (400)
    InvalidRequest(String),
    /// Health probe failure (500)
    Unhealthy(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unhealthy(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, message).into_response()
    }
}

fn channel_from_key(key: u8) -> Result<ChannelId, AppError> {
    ChannelId::from_key(key)
        .ok_or_else(|| AppError::InvalidRequest(format!("Unknown channel key: {key}")))
}

fn parse_channel_list(raw: &str) -> Result<Vec<ChannelId>, AppError> {
    let mut channels = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let key: u8 = part
            .parse()
            .map_err(|_| AppError::InvalidRequest(format!("Invalid channel key: {part}")))?;
        let channel = channel_from_key(key)?;
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    if channels.is_empty() {
        return Err(AppError::InvalidRequest("No channels requested".to_string()));
    }
    if channels.len() > stackscope_compose::compose::MAX_CHANNELS {
        return Err(AppError::InvalidRequest(format!(
            "Too many channels: {}",
            channels.len()
        )));
    }
    Ok(channels)
}

/// Parse one settings query parameter for one channel.
///
/// Accepts a bare JSON value (applies to every requested channel) or an
/// object keyed by channel key (`{"12": 0.05}`).
fn parse_setting_field<T: serde::de::DeserializeOwned>(
    raw: Option<&str>,
    field: &str,
    channel: ChannelId,
) -> Result<Option<T>, AppError> {
    let Some(raw) = raw else { return Ok(None) };
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid {field}: {e}")))?;

    let selected = match &value {
        serde_json::Value::Object(map) => match map.get(&channel.key().to_string()) {
            Some(v) => v.clone(),
            None => return Ok(None),
        },
        other => other.clone(),
    };

    serde_json::from_value(selected)
        .map(Some)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid {field}: {e}")))
}

fn build_settings(params: &TileParams, channels: &[ChannelId]) -> Result<SettingsMap, AppError> {
    let mut settings = SettingsMap::new();
    for &channel in channels {
        let channel_settings = ChannelSettings {
            contrast: parse_setting_field(params.contrast.as_deref(), "contrast", channel)?,
            brightness: parse_setting_field(
                params.brightness.as_deref(),
                "brightness",
                channel,
            )?,
            threshold: parse_setting_field(params.threshold.as_deref(), "threshold", channel)?,
            color: parse_setting_field(params.color.as_deref(), "color", channel)?,
        };
        channel_settings
            .validate()
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
        if !channel_settings.is_default() {
            settings.insert(channel, channel_settings);
        }
    }
    Ok(settings)
}

fn build_coord(
    params: &TileParams,
    channel: ChannelId,
    default_timestamp: &str,
) -> Result<TileCoord, AppError> {
    if params.scale > MAX_SCALE {
        return Err(AppError::InvalidRequest(format!(
            "Scale {} exceeds maximum {MAX_SCALE}",
            params.scale
        )));
    }
    if params.dataset_id.is_empty() {
        return Err(AppError::InvalidRequest("dataset_id must not be empty".to_string()));
    }
    Ok(TileCoord {
        dataset: params.dataset_id.clone(),
        timestamp: params
            .timestamp
            .clone()
            .unwrap_or_else(|| default_timestamp.to_string()),
        channel,
        scale: params.scale,
        x: params.x,
        y: params.y,
    })
}

fn png_response(png: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], png).into_response()
}

/// Handle `GET /tile`: one channel as a grayscale PNG.
pub async fn handle_tile(
    State(state): State<AppState>,
    Query(params): Query<TileParams>,
) -> Result<Response, AppError> {
    let service = state.service();
    let channel = channel_from_key(params.channel.unwrap_or(0))?;
    let coord = build_coord(&params, channel, service.default_timestamp())?;
    let settings = build_settings(&params, &[channel])?;
    let priority = params.priority.unwrap_or(DEFAULT_PRIORITY);

    tracing::debug!("Tile request {coord} (priority {priority})");
    let png = service.get_tile(coord, &settings, priority).await;
    Ok(png_response(png))
}

/// Handle `GET /merged-tile`: several channels composed into one RGB PNG.
pub async fn handle_merged_tile(
    State(state): State<AppState>,
    Query(params): Query<TileParams>,
) -> Result<Response, AppError> {
    let service = state.service();
    let channels = match params.channels.as_deref() {
        Some(raw) => parse_channel_list(raw)?,
        None => vec![channel_from_key(params.channel.unwrap_or(0))?],
    };
    let coord = build_coord(&params, channels[0], service.default_timestamp())?;
    let settings = build_settings(&params, &channels)?;
    let priority = params.priority.unwrap_or(DEFAULT_PRIORITY);

    tracing::debug!(
        "Merged tile request {coord} over {} channels (priority {priority})",
        channels.len()
    );
    let png = service
        .get_merged_tile(coord, &channels, &settings, priority)
        .await;
    Ok(png_response(png))
}

/// Handle `GET /prefetch`: queue tiles, report how many were accepted.
pub async fn handle_prefetch(
    State(state): State<AppState>,
    Query(params): Query<PrefetchParams>,
) -> Result<Response, AppError> {
    let service = state.service();
    if params.scale > MAX_SCALE {
        return Err(AppError::InvalidRequest(format!(
            "Scale {} exceeds maximum {MAX_SCALE}",
            params.scale
        )));
    }
    let channel = channel_from_key(params.channel.unwrap_or(0))?;
    let timestamp = params
        .timestamp
        .clone()
        .unwrap_or_else(|| service.default_timestamp().to_string());

    let mut coords = Vec::new();
    for pair in params.tiles.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (y, x) = pair
            .split_once('.')
            .ok_or_else(|| AppError::InvalidRequest(format!("Invalid tile pair: {pair}")))?;
        let y: u32 = y
            .parse()
            .map_err(|_| AppError::InvalidRequest(format!("Invalid tile row: {y}")))?;
        let x: u32 = x
            .parse()
            .map_err(|_| AppError::InvalidRequest(format!("Invalid tile column: {x}")))?;
        coords.push(TileCoord {
            dataset: params.dataset_id.clone(),
            timestamp: timestamp.clone(),
            channel,
            scale: params.scale,
            x,
            y,
        });
    }

    let priority = params.priority.unwrap_or(DEFAULT_PRIORITY);
    let accepted = service.prefetch(coords, priority);
    Ok(axum::Json(serde_json::json!({ "accepted": accepted })).into_response())
}

/// Handle `GET /health`: probe one known archive end to end.
pub async fn handle_health(State(state): State<AppState>) -> Response {
    let report = state.service().health().await;
    let status = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, axum::Json(report)).into_response()
}
