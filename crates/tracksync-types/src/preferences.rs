//! Per-user UI preferences.

use serde::{Deserialize, Serialize};

/// UI preferences for one user.
///
/// Field names follow the client's wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub version: u64,
    /// Width of the device list panel in pixels.
    #[serde(rename = "DeviceListWidth")]
    pub device_list_width: u32,
    /// Display unit system, e.g. `imperial` or `metric`.
    pub unit: String,
}

impl UserPreferences {
    /// Default preferences for a user, at version 1.
    pub fn defaults_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            version: 1,
            ..Self::default()
        }
    }
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            version: 0,
            device_list_width: 400,
            unit: "imperial".to_string(),
        }
    }
}
