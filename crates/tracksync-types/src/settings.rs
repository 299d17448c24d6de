//! Per-device configuration.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A quantity with its unit and a human-readable rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub value: f64,
    pub unit: String,
    pub display: String,
}

impl Measure {
    pub fn new(value: f64, unit: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
            display: display.into(),
        }
    }

    fn seconds(value: f64, display: &str) -> Self {
        Self::new(value, "s", display)
    }

    fn zero_mph() -> Self {
        Self::new(0.0, "mph", "0 mph")
    }
}

impl Default for Measure {
    fn default() -> Self {
        Self::new(0.0, "", "")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuelConsumption {
    pub calculation_method: String,
    pub measurement: String,
    pub fuel_type: String,
    pub fuel_cost: f64,
    pub fuel_economy: f64,
}

impl Default for FuelConsumption {
    fn default() -> Self {
        Self {
            calculation_method: "fuel_sensor".to_string(),
            measurement: "mpg".to_string(),
            fuel_type: String::new(),
            fuel_cost: 0.0,
            fuel_economy: 0.0,
        }
    }
}

/// Settings document for one device.
///
/// Every field is optional on the wire; anything a payload leaves out takes
/// the value from [`DeviceSettings::default`]. `device_id` and `version` are
/// owned by the store and the versioned writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub device_id: String,
    /// Icon reference. Empty means no icon.
    #[serde(rename = "iconUrl", skip_serializing_if = "String::is_empty")]
    pub icon_url: String,
    pub version: u64,
    /// Time of the last modification, used to detect replayed writes.
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<OffsetDateTime>,
    pub begin_moving_speed: Measure,
    pub begin_stopped_speed: Measure,
    pub max_drift_distance: Measure,
    pub min_num_satellites: u32,
    pub ignore_unset_min_num_sats: bool,
    pub max_hdop: f64,
    pub drive_timeout: Measure,
    pub stop_timeout: Measure,
    pub offline_timeout: Measure,
    pub history_calc_duration: Measure,
    pub fuel_consumption: FuelConsumption,
    pub initial_device_point_delete_cutoff_time: String,
    pub engine_hours_counter_config: String,
    pub use_v3_engine_hours: bool,
    pub history_retention_days: u32,
    pub harsh_event_min_speed: Measure,
}

impl DeviceSettings {
    /// Default settings for a device, at version 1.
    pub fn defaults_for(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            version: 1,
            ..Self::default()
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            icon_url: String::new(),
            version: 0,
            updated_at: None,
            begin_moving_speed: Measure::zero_mph(),
            begin_stopped_speed: Measure::zero_mph(),
            max_drift_distance: Measure::new(350.0, "m", "350 m"),
            min_num_satellites: 8,
            ignore_unset_min_num_sats: true,
            max_hdop: 3.5,
            drive_timeout: Measure::seconds(1800.0, "30m"),
            stop_timeout: Measure::seconds(14400.0, "4h"),
            offline_timeout: Measure::seconds(3900.0, "1h 5m"),
            history_calc_duration: Measure::seconds(86400.0, "24h"),
            fuel_consumption: FuelConsumption::default(),
            initial_device_point_delete_cutoff_time: "2024-06-21T17:45:09.284403Z".to_string(),
            engine_hours_counter_config: "best".to_string(),
            use_v3_engine_hours: true,
            history_retention_days: 1095,
            harsh_event_min_speed: Measure::zero_mph(),
        }
    }
}
