//! Device records: incoming sightings, stored documents and client projections.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::{RecordError, RecordResult};
use crate::settings::DeviceSettings;
use crate::timestamp::{is_indexable, parse_rfc3339};

/// Keys owned by the store or the sync engine.
///
/// These are stripped from incoming telemetry and from client patches so that
/// neither can rewrite identity, version or the staleness signal.
pub const PROTECTED_FIELDS: [&str; 5] = ["_id", "version", "device_id", "updated_at", "settings"];

/// A device as reported by the telemetry source.
///
/// `device_id` and `updated_at` are the only fields the sync engine reads.
/// Every other field is carried verbatim in `attributes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Natural key, assigned by the telemetry source. Immutable.
    pub device_id: String,
    /// Source-side modification time. The sole ordering authority for a device.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Opaque telemetry (location, online flag, activity state, ...).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl DeviceRecord {
    /// Create a record with no attributes.
    pub fn new(device_id: impl Into<String>, updated_at: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            updated_at,
            attributes: Map::new(),
        }
    }

    /// Merge a client patch into the attribute bag.
    ///
    /// Protected keys in the patch are ignored; everything else overwrites the
    /// existing value, including explicit `null`s.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if PROTECTED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.attributes.insert(key.clone(), value.clone());
        }
    }
}

/// One entry of a snapshot, validated and split into record and settings.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingDevice {
    /// The device record, without the nested `settings` object.
    pub record: DeviceRecord,
    /// Settings carried inline by the source, stamped with the device id and
    /// the record's `updated_at`.
    pub settings: Option<DeviceSettings>,
    /// Why an inline `settings` object was ignored, if it was.
    pub settings_error: Option<String>,
}

impl IncomingDevice {
    /// Validate a raw snapshot entry.
    ///
    /// Requires a string `device_id` and an RFC3339 `updated_at` inside the
    /// indexable range (see [`is_indexable`]). A nested
    /// `settings` object is decoded into [`DeviceSettings`] (missing fields take
    /// their defaults); a settings object that does not decode is dropped and
    /// reported through `settings_error` rather than failing the record.
    pub fn from_value(value: Value) -> RecordResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(RecordError::NotAnObject);
        };

        let device_id = match map.remove("device_id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            _ => return Err(RecordError::MissingDeviceId),
        };

        let updated_at = match map.remove("updated_at") {
            Some(Value::String(raw)) => {
                let updated_at = parse_rfc3339("updated_at", &raw)?;
                if !is_indexable(updated_at) {
                    return Err(RecordError::TimestampOutOfRange {
                        field: "updated_at",
                        value: raw,
                    });
                }
                updated_at
            }
            _ => return Err(RecordError::MissingUpdatedAt(device_id)),
        };

        map.remove("_id");
        map.remove("version");

        let (settings, settings_error) = match map.remove("settings") {
            Some(raw @ Value::Object(_)) => match serde_json::from_value::<DeviceSettings>(raw) {
                Ok(mut settings) => {
                    settings.device_id = device_id.clone();
                    settings.updated_at = Some(updated_at);
                    (Some(settings), None)
                }
                Err(e) => (None, Some(e.to_string())),
            },
            Some(Value::Null) | None => (None, None),
            Some(_) => (None, Some("settings is not an object".to_string())),
        };

        Ok(Self {
            record: DeviceRecord {
                device_id,
                updated_at,
                attributes: map,
            },
            settings,
            settings_error,
        })
    }
}

/// A device record as persisted, with its store-assigned identity and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Opaque store ID.
    #[serde(rename = "_id")]
    pub id: String,
    /// Optimistic-concurrency version. Zero until the first versioned write.
    #[serde(default)]
    pub version: u64,
    /// The record itself.
    #[serde(flatten)]
    pub record: DeviceRecord,
}

/// The subset of a device that a polling client needs to redraw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Opaque store ID.
    #[serde(rename = "_id")]
    pub id: String,
    /// Natural key.
    pub device_id: String,
    /// Source-side modification time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_device_point: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_accurate_device_point: Option<Value>,
}

/// The telemetry source's response envelope.
///
/// Entries stay untyped here so that one malformed device can be skipped
/// without rejecting the whole snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub result_list: Vec<Value>,
}
