//! Mock telemetry source for local development.
//!
//! Serves an in-memory fleet at `GET /api/v1/devices` in the same envelope as
//! the real source. A background task occasionally nudges a few devices so
//! the ingestor and polling clients have something to pick up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{RwLock, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use tracksync_types::{Snapshot, format_rfc3339};

use crate::config::{MockConfig, TelemetryConfig};
use crate::telemetry::{HttpSource, TelemetryError, TelemetrySource};

/// Path the mock serves the fleet on.
pub const DEVICES_PATH: &str = "/api/v1/devices";

/// Errors seeding the mock fleet.
#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("Failed to read seed file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse seed file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to seed from upstream: {0}")]
    Upstream(#[from] TelemetryError),
}

/// The fleet served by the mock.
#[derive(Debug, Default)]
pub struct MockFleet {
    devices: RwLock<Vec<Value>>,
}

impl MockFleet {
    pub fn new(devices: Vec<Value>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Load the fleet from a seed file, or fetch it once from the real source.
    pub async fn seed(mock: &MockConfig, upstream: &TelemetryConfig) -> Result<Self, MockError> {
        let snapshot = match &mock.seed_file {
            Some(path) => read_seed_file(path)?,
            None => {
                let source = HttpSource::new(upstream.endpoint(), upstream.timeout())?;
                info!("Seeding mock fleet from {}", source.url());
                source.fetch_snapshot().await?
            }
        };

        info!("Mock fleet seeded with {} devices", snapshot.result_list.len());
        Ok(Self::new(snapshot.result_list))
    }

    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            result_list: self.devices.read().await.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Mutate up to `count` random devices. Returns how many were changed.
    pub async fn mutate<R: Rng>(&self, count: usize, rng: &mut R) -> usize {
        let mut devices = self.devices.write().await;
        mutate(&mut devices, count, rng)
    }
}

fn read_seed_file(path: &Path) -> Result<Snapshot, MockError> {
    let content = std::fs::read_to_string(path).map_err(|e| MockError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| MockError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Router serving the fleet.
pub fn router(fleet: Arc<MockFleet>) -> Router {
    Router::new()
        .route(DEVICES_PATH, get(list_devices))
        .with_state(fleet)
}

async fn list_devices(State(fleet): State<Arc<MockFleet>>) -> Json<Snapshot> {
    Json(fleet.snapshot().await)
}

/// Pick `count` devices at random (with replacement) and mutate each.
///
/// `count` is capped at the fleet size. Returns how many mutations applied.
pub fn mutate<R: Rng>(devices: &mut [Value], count: usize, rng: &mut R) -> usize {
    if devices.is_empty() {
        return 0;
    }

    let mut mutated = 0;
    for _ in 0..count.min(devices.len()) {
        let index = rng.random_range(0..devices.len());
        if mutate_device(&mut devices[index], rng) {
            mutated += 1;
        }
    }
    mutated
}

/// Apply a random change to the fields a device already has.
///
/// Returns `false` for entries without a string `device_id`.
pub fn mutate_device<R: Rng>(device: &mut Value, rng: &mut R) -> bool {
    let Some(fields) = device.as_object_mut() else {
        warn!("Skipping mock entry that is not an object");
        return false;
    };
    let Some(device_id) = fields.get("device_id").and_then(Value::as_str) else {
        warn!("Skipping mock entry without a string device_id");
        return false;
    };
    debug!("Mutating mock device {}", device_id);

    if let Some(online) = fields.get_mut("online") {
        *online = Value::Bool(rng.random_bool(0.5));
    }

    if let Some(point) = fields
        .get_mut("latest_device_point")
        .and_then(Value::as_object_mut)
    {
        for axis in ["lat", "lng"] {
            if let Some(coord) = point.get_mut(axis)
                && let Some(current) = coord.as_f64()
            {
                *coord = Value::from(current + nudge(rng));
            }
        }

        if let Some(speed) = point
            .get_mut("device_point_detail")
            .and_then(|detail| detail.get_mut("speed"))
            .and_then(Value::as_object_mut)
        {
            let value: u32 = rng.random_range(0..=50);
            speed.insert("value".to_string(), Value::from(value));
            speed.insert("display".to_string(), Value::from(format!("{} km/h", value)));
        }
    }

    if let Some(updated_at) = fields.get_mut("updated_at") {
        *updated_at = Value::String(format_rfc3339(OffsetDateTime::now_utc()));
    }

    true
}

/// A coordinate offset of 0.01 to 0.05 degrees in either direction.
fn nudge<R: Rng>(rng: &mut R) -> f64 {
    let magnitude = rng.random_range(0.01..0.05);
    if rng.random_bool(0.5) {
        magnitude
    } else {
        -magnitude
    }
}

/// Run mutation rounds until `stop` flips to `true`.
pub async fn run_mutations(
    fleet: Arc<MockFleet>,
    config: MockConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut rng = StdRng::from_os_rng();
    let mut timer = interval(config.interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; start mutating one period in
    timer.tick().await;

    info!(
        "Mock mutations every {}s (chance {}, up to {} devices)",
        config.interval_secs, config.mutate_chance, config.mutate_devices
    );

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!("Mock mutations stopped");
                    break;
                }
                continue;
            }
        }

        if rng.random_bool(config.mutate_chance) {
            let mutated = fleet.mutate(config.mutate_devices, &mut rng).await;
            debug!("Mutated {} mock devices", mutated);
        }
    }
}
