//! Device settings and user preferences collections.

use std::collections::BTreeMap;

use rusqlite::{OptionalExtension, params};

use tracksync_types::{DeviceSettings, UserPreferences};

use crate::error::Result;
use crate::store::{Store, from_sql_version, next_version, to_sql_version};

impl Store {
    // === Device settings ===

    /// Get the settings for a device.
    pub fn get_settings(&self, device_id: &str) -> Result<Option<DeviceSettings>> {
        let row = self
            .conn
            .query_row(
                "SELECT version, document FROM device_settings WHERE device_id = ?",
                [device_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        row.map(|(version, document)| {
            let mut settings: DeviceSettings = serde_json::from_str(&document)?;
            settings.device_id = device_id.to_string();
            settings.version = from_sql_version(version);
            Ok(settings)
        })
        .transpose()
    }

    /// Whether a settings document exists for the device.
    pub fn settings_exist(&self, device_id: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM device_settings WHERE device_id = ?)",
            [device_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Write settings unconditionally, replacing any existing document.
    ///
    /// Used when a device is first seen; the stored version is taken from the
    /// payload as-is.
    pub fn put_settings(&self, settings: &DeviceSettings) -> Result<()> {
        let document = serde_json::to_string(settings)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO device_settings (device_id, version, icon_url, document)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                settings.device_id,
                to_sql_version(settings.version)?,
                settings.icon_url,
                document
            ],
        )?;
        Ok(())
    }

    /// Insert settings only if the device has none yet.
    ///
    /// Returns whether the document was inserted.
    pub fn insert_settings_if_absent(&self, settings: &DeviceSettings) -> Result<bool> {
        let document = serde_json::to_string(settings)?;
        let inserted = self.conn.execute(
            "INSERT INTO device_settings (device_id, version, icon_url, document)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id) DO NOTHING",
            params![
                settings.device_id,
                to_sql_version(settings.version)?,
                settings.icon_url,
                document
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Replace a device's settings if the stored version equals `expected`.
    ///
    /// The stored document becomes `settings` at version `expected + 1`.
    /// Returns the post-update document, or `None` if nothing matched.
    pub fn update_settings_if_version(
        &self,
        settings: &DeviceSettings,
        expected: u64,
    ) -> Result<Option<DeviceSettings>> {
        let next = DeviceSettings {
            version: next_version(expected)?,
            ..settings.clone()
        };
        let document = serde_json::to_string(&next)?;

        let updated = self.conn.execute(
            "UPDATE device_settings SET version = version + 1, icon_url = ?1, document = ?2
             WHERE device_id = ?3 AND version = ?4",
            params![
                next.icon_url,
                document,
                next.device_id,
                to_sql_version(expected)?
            ],
        )?;

        Ok((updated == 1).then_some(next))
    }

    /// Icon URL for every known device.
    ///
    /// Devices without a settings document, or whose settings carry no icon,
    /// map to an empty string.
    pub fn icon_map(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, icon_url FROM device_settings
             UNION ALL
             SELECT device_id, '' FROM devices
             WHERE device_id NOT IN (SELECT device_id FROM device_settings)",
        )?;

        let map = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<BTreeMap<String, String>, _>>()?;
        Ok(map)
    }

    // === User preferences ===

    /// Get a user's preferences.
    pub fn get_preferences(&self, user_id: &str) -> Result<Option<UserPreferences>> {
        let row = self
            .conn
            .query_row(
                "SELECT version, document FROM user_preferences WHERE user_id = ?",
                [user_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        row.map(|(version, document)| {
            let mut prefs: UserPreferences = serde_json::from_str(&document)?;
            prefs.user_id = user_id.to_string();
            prefs.version = from_sql_version(version);
            Ok(prefs)
        })
        .transpose()
    }

    /// Insert preferences only if the user has none yet.
    ///
    /// Returns whether the document was inserted.
    pub fn insert_preferences_if_absent(&self, prefs: &UserPreferences) -> Result<bool> {
        let document = serde_json::to_string(prefs)?;
        let inserted = self.conn.execute(
            "INSERT INTO user_preferences (user_id, version, document)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO NOTHING",
            params![prefs.user_id, to_sql_version(prefs.version)?, document],
        )?;
        Ok(inserted == 1)
    }

    /// Replace a user's preferences if the stored version equals `expected`.
    pub fn update_preferences_if_version(
        &self,
        prefs: &UserPreferences,
        expected: u64,
    ) -> Result<Option<UserPreferences>> {
        let next = UserPreferences {
            version: next_version(expected)?,
            ..prefs.clone()
        };
        let document = serde_json::to_string(&next)?;

        let updated = self.conn.execute(
            "UPDATE user_preferences SET version = version + 1, document = ?1
             WHERE user_id = ?2 AND version = ?3",
            params![document, next.user_id, to_sql_version(expected)?],
        )?;

        Ok((updated == 1).then_some(next))
    }
}
