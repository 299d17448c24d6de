//! REST API endpoints for the tracksync service.
//!
//! # Concurrency and Lock Acquisition
//!
//! - **`state.store`** (Mutex): acquired through [`AppState::store`], which
//!   gives up after the configured operation timeout. Held only for the
//!   queries of a single request.
//! - **`state.freshness`** (RwLock inside [`FreshnessIndex`](crate::freshness::FreshnessIndex)):
//!   read for change polls and status, never held across store calls.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. Version
//! conflicts return 409 together with the current server-side entity so
//! clients can merge and retry.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Multipart, Path, Query, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, put},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracksync_store::{ClearCounts, MAX_DECLARED_VERSION};
use tracksync_types::{DeviceSettings, StoredDevice, UserPreferences, parse_rfc3339};
use uuid::Uuid;

use crate::changes::{QueryError, UpdateCheck, check_for_updates};
use crate::icons::{ICON_CONTENT_TYPE, IconDir, IconError};
use crate::ingestor::{IngestError, Ingestor, TickReport};
use crate::state::{AppState, IngestStats, StoreTimeout};
use crate::versioned::{self, Devices, Preferences, Settings, WriteOutcome};

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Health and status
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        // Devices
        .route("/api/devices", get(list_devices))
        .route("/api/devices/check-updates", get(check_updates))
        .route("/api/devices/refresh", delete(refresh_devices))
        .route("/api/devices/{id}", put(update_device))
        .route(
            "/api/devices/{id}/settings",
            get(get_settings).put(update_settings),
        )
        .route(
            "/api/devices/{id}/icon",
            get(get_icon).put(update_icon).post(upload_icon),
        )
        // Preferences
        .route(
            "/api/users/{user_id}/preferences",
            get(get_preferences).post(update_preferences),
        )
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub ingestor: IngestorStatus,
    pub freshness: FreshnessStatus,
}

/// Ingestor state.
#[derive(Debug, Serialize)]
pub struct IngestorStatus {
    /// Whether the background loop is running.
    pub running: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    /// How long the loop has been running (in seconds).
    pub uptime_seconds: Option<u64>,
    #[serde(flatten)]
    pub stats: IngestStats,
}

/// Freshness index summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessStatus {
    /// Devices with a recorded update time.
    pub tracked_devices: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub last_checked: OffsetDateTime,
}

/// Get service status including ingestor state and freshness.
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let running = state.ingestor.is_running();
    let started_at = state.ingestor.started_at();
    let uptime_seconds = started_at.map(|s| {
        let now = OffsetDateTime::now_utc();
        (now - s).whole_seconds().max(0) as u64
    });

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
        ingestor: IngestorStatus {
            running,
            started_at,
            uptime_seconds,
            stats: state.ingestor.stats().await,
        },
        freshness: FreshnessStatus {
            tracked_devices: state.freshness.len().await,
            last_checked: state.freshness.last_checked().await,
        },
    })
}

/// Every stored device.
#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub result_list: Vec<StoredDevice>,
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DeviceListResponse>, AppError> {
    let store = state.store().await?;
    let result_list = store.list_devices()?;
    Ok(Json(DeviceListResponse { result_list }))
}

/// Query parameters for change polls.
#[derive(Debug, Deserialize)]
pub struct CheckUpdatesQuery {
    #[serde(rename = "lastUpdate")]
    pub last_update: Option<String>,
}

/// Poll for changes since the client's last update.
async fn check_updates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckUpdatesQuery>,
) -> Result<Json<UpdateCheck>, AppError> {
    let raw = query
        .last_update
        .ok_or_else(|| AppError::BadRequest("lastUpdate is required".to_string()))?;
    let since = parse_rfc3339("lastUpdate", &raw).map_err(|e| AppError::BadRequest(e.to_string()))?;

    Ok(Json(check_for_updates(&state, since).await?))
}

/// Query parameters for versioned device writes.
#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: Option<String>,
}

impl VersionQuery {
    /// Parse the declared version.
    pub fn declared(&self) -> Result<u64, AppError> {
        let raw = self
            .version
            .as_deref()
            .ok_or_else(|| AppError::BadRequest("version is required".to_string()))?;
        let version = raw
            .trim()
            .parse()
            .map_err(|_| AppError::BadRequest(format!("Invalid version: {}", raw)))?;
        check_version(version)
    }
}

/// Reject declared versions the store cannot hold or increment.
pub fn check_version(version: u64) -> Result<u64, AppError> {
    if version > MAX_DECLARED_VERSION {
        return Err(AppError::BadRequest(format!(
            "Version {} is out of range",
            version
        )));
    }
    Ok(version)
}

/// Patch a device's attributes, declaring the version last seen.
async fn update_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
    Json(body): Json<Value>,
) -> Result<Json<StoredDevice>, AppError> {
    Uuid::parse_str(&id).map_err(|_| AppError::BadRequest(format!("Invalid device ID: {}", id)))?;
    let declared = query.declared()?;
    let Value::Object(mut patch) = body else {
        return Err(AppError::BadRequest(
            "Request body must be a JSON object".to_string(),
        ));
    };
    patch.remove("_id");
    patch.remove("version");

    let store = state.store().await?;
    let outcome = versioned::write::<Devices>(&store, &id, declared, &patch)?;
    respond("Device", &id, outcome).map(Json)
}

/// Read a device's settings, creating the defaults if none exist yet.
async fn get_settings(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceSettings>, AppError> {
    let store = state.store().await?;
    if let Some(settings) = store.get_settings(&device_id)? {
        return Ok(Json(settings));
    }

    let defaults = DeviceSettings::defaults_for(device_id.as_str());
    if store.insert_settings_if_absent(&defaults)? {
        info!("Created default settings for {}", device_id);
        return Ok(Json(defaults));
    }

    // Lost a race with another writer; return what it stored
    store
        .get_settings(&device_id)?
        .map(Json)
        .ok_or_else(|| AppError::Internal(format!("Settings for {} disappeared", device_id)))
}

/// Replace a device's settings. The declared version is the body's `version`.
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<DeviceSettings>, AppError> {
    if !body.is_object() {
        return Err(AppError::BadRequest(
            "Request body must be a JSON object".to_string(),
        ));
    }
    let mut settings: DeviceSettings = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid settings: {}", e)))?;

    if !settings.device_id.is_empty() && settings.device_id != device_id {
        return Err(AppError::BadRequest(format!(
            "Body device_id {} does not match path {}",
            settings.device_id, device_id
        )));
    }
    check_version(settings.version)?;
    settings.device_id = device_id.clone();
    if settings.updated_at.is_none() {
        settings.updated_at = Some(OffsetDateTime::now_utc());
    }

    let store = state.store().await?;
    let outcome = versioned::write::<Settings>(&store, &device_id, settings.version, &settings)?;
    respond("Settings", &device_id, outcome).map(Json)
}

/// Request body for icon URL updates.
#[derive(Debug, Deserialize)]
pub struct IconRequest {
    /// New icon URL. `null` or empty clears the icon.
    #[serde(rename = "iconUrl", default)]
    pub icon_url: Option<String>,
    pub version: u64,
}

/// Set or clear a device's icon URL, as a versioned settings write.
async fn update_icon(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(request): Json<IconRequest>,
) -> Result<Json<DeviceSettings>, AppError> {
    let declared = check_version(request.version)?;
    let url = request.icon_url.unwrap_or_default().trim().to_string();
    apply_icon(&state, &device_id, Some(declared), IconChange::Url(url))
        .await
        .map(Json)
}

/// Query parameters for icon uploads.
#[derive(Debug, Deserialize)]
pub struct IconUploadQuery {
    /// Delete the icon file and clear the URL instead of uploading.
    #[serde(default)]
    pub remove: bool,
    /// Declared settings version. When absent the current version is used.
    pub version: Option<String>,
}

/// Upload a PNG icon (multipart field `file`), set a URL (field
/// `defaultIcon`), or remove the icon with `?remove=true`.
async fn upload_icon(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(query): Query<IconUploadQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DeviceSettings>, AppError> {
    let declared = query
        .version
        .map(|raw| VersionQuery { version: Some(raw) }.declared())
        .transpose()?;

    let change = if query.remove {
        IconChange::Remove
    } else {
        let mut multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;
        read_icon_form(&mut multipart).await?
    };

    apply_icon(&state, &device_id, declared, change)
        .await
        .map(Json)
}

/// Serve a device's uploaded icon. Devices without one get an empty 200.
async fn get_icon(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Response, AppError> {
    let icons = IconDir::new(state.config.read().await.server.icons_dir.clone());
    Ok(match icons.read(&device_id).await? {
        Some(bytes) => ([(header::CONTENT_TYPE, ICON_CONTENT_TYPE)], bytes).into_response(),
        None => StatusCode::OK.into_response(),
    })
}

/// What an icon request asks for.
enum IconChange {
    Url(String),
    File(Vec<u8>),
    Remove,
}

/// Read the upload form. A `defaultIcon` URL wins over a file.
async fn read_icon_form(multipart: &mut Multipart) -> Result<IconChange, AppError> {
    let mut file = None;
    let mut default_icon = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let content_type = field.content_type().unwrap_or_default().to_string();
                if content_type != ICON_CONTENT_TYPE {
                    return Err(AppError::BadRequest(format!(
                        "Unsupported icon content type: {:?}",
                        content_type
                    )));
                }
                file = Some(field.bytes().await?.to_vec());
            }
            Some("defaultIcon") => {
                let url = field.text().await?.trim().to_string();
                if !url.is_empty() {
                    default_icon = Some(url);
                }
            }
            _ => {}
        }
    }

    match (default_icon, file) {
        (Some(url), _) => Ok(IconChange::Url(url)),
        (None, Some(bytes)) => Ok(IconChange::File(bytes)),
        (None, None) => Err(AppError::BadRequest(
            "Expected a file or defaultIcon field".to_string(),
        )),
    }
}

/// Apply an icon change to a known device and record the URL through a
/// versioned settings write.
///
/// The store stays locked across the file operation, so the version checked
/// here is the one the write sees.
async fn apply_icon(
    state: &AppState,
    device_id: &str,
    declared: Option<u64>,
    change: IconChange,
) -> Result<DeviceSettings, AppError> {
    let icons = IconDir::new(state.config.read().await.server.icons_dir.clone());
    IconDir::file_name(device_id)?;

    let store = state.store().await?;
    if store.get_device_by_device_id(device_id)?.is_none() {
        return Err(AppError::NotFound(format!("Device not found: {}", device_id)));
    }

    let current = store.get_settings(device_id)?;
    let current_version = current.as_ref().map_or(0, |s| s.version);
    let declared = declared.unwrap_or(current_version);

    let icon_url = match change {
        IconChange::Url(url) => url,
        // A mismatched version cannot apply; leave the files alone
        _ if declared != current_version => String::new(),
        IconChange::Remove => {
            icons.remove(device_id).await?;
            String::new()
        }
        IconChange::File(bytes) => {
            icons.save(device_id, &bytes).await?;
            IconDir::url(device_id)?
        }
    };

    let settings = DeviceSettings {
        icon_url,
        updated_at: Some(OffsetDateTime::now_utc()),
        ..current.unwrap_or_else(|| DeviceSettings::defaults_for(device_id))
    };

    let outcome = versioned::write::<Settings>(&store, device_id, declared, &settings)?;
    respond("Settings", device_id, outcome)
}

/// Response for a forced resync.
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub cleared: ClearCounts,
    pub report: TickReport,
}

/// Clear everything and re-ingest from the telemetry source.
async fn refresh_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshResponse>, AppError> {
    let (cleared, report) = Ingestor::new(Arc::clone(&state)).resync().await?;
    Ok(Json(RefreshResponse { cleared, report }))
}

/// Read a user's preferences, creating the defaults on first access.
async fn get_preferences(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<(StatusCode, Json<UserPreferences>), AppError> {
    let store = state.store().await?;
    if let Some(prefs) = store.get_preferences(&user_id)? {
        return Ok((StatusCode::OK, Json(prefs)));
    }

    let defaults = UserPreferences::defaults_for(user_id.as_str());
    if store.insert_preferences_if_absent(&defaults)? {
        info!("Created default preferences for {}", user_id);
        return Ok((StatusCode::CREATED, Json(defaults)));
    }

    store
        .get_preferences(&user_id)?
        .map(|prefs| (StatusCode::OK, Json(prefs)))
        .ok_or_else(|| AppError::Internal(format!("Preferences for {} disappeared", user_id)))
}

/// Replace a user's preferences. The declared version is the body's `version`.
async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<UserPreferences>, AppError> {
    if !body.is_object() {
        return Err(AppError::BadRequest(
            "Request body must be a JSON object".to_string(),
        ));
    }
    let prefs: UserPreferences = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid preferences: {}", e)))?;

    if !prefs.user_id.is_empty() && prefs.user_id != user_id {
        return Err(AppError::BadRequest(format!(
            "Body userId {} does not match path {}",
            prefs.user_id, user_id
        )));
    }
    check_version(prefs.version)?;

    let store = state.store().await?;
    let outcome = versioned::write::<Preferences>(&store, &user_id, prefs.version, &prefs)?;
    respond("Preferences", &user_id, outcome).map(Json)
}

/// Map a write outcome onto the response.
fn respond<E: Serialize>(kind: &str, key: &str, outcome: WriteOutcome<E>) -> Result<E, AppError> {
    match outcome {
        WriteOutcome::Applied(entity) | WriteOutcome::Unchanged(entity) => Ok(entity),
        WriteOutcome::Conflict(current) => {
            warn!("{} write for {} lost a version race", kind, key);
            Err(AppError::Conflict {
                message: format!("{} {} was modified by another writer", kind, key),
                current: serde_json::to_value(current).unwrap_or(Value::Null),
            })
        }
        WriteOutcome::NotFound => Err(AppError::NotFound(format!("{} not found: {}", kind, key))),
    }
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    /// A versioned write lost the race; carries the current entity.
    Conflict { message: String, current: Value },
    Store(tracksync_store::Error),
    /// The store could not be acquired in time.
    Unavailable(String),
    /// The telemetry source failed during a forced resync.
    Upstream(String),
    Internal(String),
}

impl From<tracksync_store::Error> for AppError {
    fn from(e: tracksync_store::Error) -> Self {
        match e {
            tracksync_store::Error::VersionOutOfRange(_) => AppError::BadRequest(e.to_string()),
            e => AppError::Store(e),
        }
    }
}

impl From<QueryError> for AppError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Store(e) => e.into(),
            QueryError::StoreTimeout(e) => e.into(),
        }
    }
}

impl From<IconError> for AppError {
    fn from(e: IconError) -> Self {
        match e {
            IconError::InvalidDeviceId(_) | IconError::NotPng => AppError::BadRequest(e.to_string()),
            IconError::Io { .. } => {
                warn!("{}", e);
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        AppError::BadRequest(e.body_text())
    }
}

impl From<StoreTimeout> for AppError {
    fn from(e: StoreTimeout) -> Self {
        AppError::Unavailable(e.to_string())
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Upstream(e) => AppError::Upstream(e.to_string()),
            IngestError::Store(e) => AppError::Store(e),
            IngestError::StoreTimeout(e) => e.into(),
            e @ IngestError::Vanished(_) => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let mut current = None;
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict {
                message,
                current: entity,
            } => {
                current = Some(entity);
                (StatusCode::CONFLICT, message)
            }
            AppError::Store(e) => {
                warn!("Store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let mut body = serde_json::json!({
            "error": message,
        });
        if let Some(current) = current {
            body["current"] = current;
        }

        (status, Json(body)).into_response()
    }
}
