//! Device sync engine and HTTP REST API for fleet telemetry.
//!
//! This crate provides a service that:
//! - Pulls full fleet snapshots from a telemetry source on a schedule
//! - Stores each device once, replacing it only when the source reports a
//!   strictly newer `updated_at`
//! - Answers client polls ("what changed since T?") from an in-memory
//!   freshness index plus one range query
//! - Accepts client edits to devices, settings and preferences through
//!   optimistic-concurrency writes
//! - Optionally serves a mock telemetry source for local development
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET /api/status` - Ingestor and freshness status
//! - `GET /api/devices` - All stored devices
//! - `GET /api/devices/check-updates?lastUpdate=<RFC3339>` - Change poll
//! - `PUT /api/devices/{id}?version=<n>` - Versioned device patch
//! - `GET|PUT /api/devices/{id}/settings` - Device settings
//! - `PUT /api/devices/{id}/icon` - Set or clear a device icon URL
//! - `POST /api/devices/{id}/icon[?remove=true]` - Upload (multipart) or remove an icon file
//! - `GET /api/devices/{id}/icon` - The uploaded icon, if any
//! - `DELETE /api/devices/refresh` - Clear everything and re-ingest
//! - `GET|POST /api/users/{userId}/preferences` - User preferences
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/tracksync/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//! icons_dir = "./icons"
//!
//! [storage]
//! path = "~/.local/share/tracksync/data.db"
//!
//! [telemetry]
//! url = "http://127.0.0.1:8081/api/v1/devices"
//! api_key = ""
//!
//! [ingest]
//! interval_secs = 60
//! ```

pub mod api;
pub mod changes;
pub mod config;
pub mod freshness;
pub mod icons;
pub mod ingestor;
pub mod mock;
pub mod state;
pub mod telemetry;
pub mod versioned;

pub use changes::{QueryError, UpdateCheck, check_for_updates};
pub use config::{
    Config, ConfigError, IngestConfig, MockConfig, ServerConfig, StorageConfig, TelemetryConfig,
};
pub use freshness::FreshnessIndex;
pub use icons::{IconDir, IconError};
pub use ingestor::{IngestError, Ingestor, TickReport};
pub use mock::MockFleet;
pub use state::{AppState, IngestStats, StoreTimeout};
pub use telemetry::{HttpSource, TelemetryError, TelemetrySource};
pub use versioned::WriteOutcome;
