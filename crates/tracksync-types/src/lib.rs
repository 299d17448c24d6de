//! Domain and wire types for the tracksync device synchronization service.
//!
//! This crate provides the types shared by the store and the service:
//!
//! - Device records as they arrive from the telemetry source and as they are stored
//! - The projected device summary returned to polling clients
//! - Per-device settings with their documented defaults
//! - Per-user UI preferences
//! - RFC3339 timestamp helpers
//!
//! Device telemetry is mostly opaque. Only the fields the sync engine inspects
//! (`device_id`, `updated_at`, `settings`) are typed; everything else travels
//! through [`DeviceRecord::attributes`] untouched.
//!
//! # Example
//!
//! ```
//! use tracksync_types::IncomingDevice;
//!
//! let raw = serde_json::json!({
//!     "device_id": "abc",
//!     "updated_at": "2024-01-01T00:00:00Z",
//!     "online": true,
//! });
//!
//! let incoming = IncomingDevice::from_value(raw).unwrap();
//! assert_eq!(incoming.record.device_id, "abc");
//! assert!(incoming.settings.is_none());
//! ```

pub mod device;
pub mod error;
pub mod preferences;
pub mod settings;
pub mod timestamp;

pub use device::{DeviceRecord, DeviceSummary, IncomingDevice, Snapshot, StoredDevice};
pub use error::{RecordError, RecordResult};
pub use preferences::UserPreferences;
pub use settings::{DeviceSettings, FuelConsumption, Measure};
pub use timestamp::{format_rfc3339, is_indexable, parse_rfc3339};
