//! Main store implementation: connection handling and the device collection.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use tracksync_types::{DeviceRecord, DeviceSummary, StoredDevice};

use crate::error::{Error, Result};
use crate::schema;

/// SQLite-backed document store for devices, device settings and user
/// preferences.
///
/// Every write that is conditional on a version is a single SQL statement,
/// so a compare-and-swap never interleaves with another writer.
#[derive(Debug)]
pub struct Store {
    pub(crate) conn: Connection,
}

/// Largest version a writer may declare. Versions are stored as signed 64-bit
/// integers and a successful write stores `declared + 1`.
pub const MAX_DECLARED_VERSION: u64 = i64::MAX as u64 - 1;

/// Rows removed by [`Store::clear_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearCounts {
    pub devices: usize,
    pub settings: usize,
    pub preferences: usize,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Bound how long a statement waits on a locked database file.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    // === Device operations ===

    /// Natural keys of every stored device.
    pub fn device_ids(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT device_id FROM devices")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<String>, _>>()?;
        Ok(ids)
    }

    /// Number of stored devices.
    pub fn count_devices(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Insert a device seen for the first time. It starts at version 0.
    pub fn insert_device(&self, record: &DeviceRecord) -> Result<StoredDevice> {
        let id = Uuid::new_v4().to_string();
        let document = serde_json::to_string(record)?;

        self.conn.execute(
            "INSERT INTO devices (id, device_id, updated_at, version, document)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![id, record.device_id, to_nanos(record.updated_at)?, document],
        )?;

        debug!("Inserted device {} as {}", record.device_id, id);
        Ok(StoredDevice {
            id,
            version: 0,
            record: record.clone(),
        })
    }

    /// Replace a device's whole document, matched by natural key.
    ///
    /// Not version-gated, but the version is still bumped so that clients
    /// holding the previous version see a conflict instead of overwriting the
    /// fresher telemetry. Returns `None` if no device has this `device_id`.
    pub fn replace_device(&self, record: &DeviceRecord) -> Result<Option<StoredDevice>> {
        let document = serde_json::to_string(record)?;

        let row = self
            .conn
            .query_row(
                "UPDATE devices SET updated_at = ?1, version = version + 1, document = ?2
                 WHERE device_id = ?3
                 RETURNING id, version",
                params![to_nanos(record.updated_at)?, document, record.device_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(id, version)| StoredDevice {
            id,
            version: from_sql_version(version),
            record: record.clone(),
        }))
    }

    /// Get a device by its opaque store ID.
    pub fn get_device(&self, id: &str) -> Result<Option<StoredDevice>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, version, document FROM devices WHERE id = ?",
                [id],
                raw_device,
            )
            .optional()?;

        row.map(decode_device).transpose()
    }

    /// Get a device by its natural key.
    pub fn get_device_by_device_id(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, version, document FROM devices WHERE device_id = ?",
                [device_id],
                raw_device,
            )
            .optional()?;

        row.map(decode_device).transpose()
    }

    /// List all devices, ordered by natural key.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, version, document FROM devices ORDER BY device_id")?;

        let rows = stmt
            .query_map([], raw_device)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(decode_device).collect()
    }

    /// Devices whose `updated_at` is strictly after `since`, projected to the
    /// fields a client needs to redraw them. Oldest first.
    ///
    /// A `since` outside the indexable range is clamped to its nearest end, so
    /// a far-past bound returns everything and a far-future one nothing.
    pub fn devices_updated_since(&self, since: OffsetDateTime) -> Result<Vec<DeviceSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, updated_at,
                    document -> '$.online',
                    document -> '$.active_state',
                    document -> '$.latest_device_point',
                    document -> '$.latest_accurate_device_point'
             FROM devices
             WHERE updated_at > ?1
             ORDER BY updated_at, device_id",
        )?;

        let rows = stmt
            .query_map([clamp_nanos(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, device_id, nanos, online, active, point, accurate)| {
                Ok(DeviceSummary {
                    id,
                    device_id,
                    updated_at: from_nanos(nanos)?,
                    online: parse_fragment(online)?,
                    active_state: parse_fragment(active)?,
                    latest_device_point: parse_fragment(point)?,
                    latest_accurate_device_point: parse_fragment(accurate)?,
                })
            })
            .collect()
    }

    /// Apply a client patch to a device if its stored version still equals
    /// `expected`, incrementing the version.
    ///
    /// Returns the post-update device, or `None` if the device is missing or
    /// its version differs. Identity and `updated_at` cannot be patched.
    pub fn update_device_if_version(
        &self,
        id: &str,
        expected: u64,
        patch: &Map<String, Value>,
    ) -> Result<Option<StoredDevice>> {
        let Some(mut device) = self.get_device(id)? else {
            return Ok(None);
        };
        if device.version != expected {
            return Ok(None);
        }

        device.record.apply_patch(patch);
        let document = serde_json::to_string(&device.record)?;

        let version = self
            .conn
            .query_row(
                "UPDATE devices SET version = version + 1, document = ?1
                 WHERE id = ?2 AND version = ?3
                 RETURNING version",
                params![document, id, to_sql_version(expected)?],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(version.map(|version| StoredDevice {
            version: from_sql_version(version),
            ..device
        }))
    }

    /// Delete every device, settings and preferences document.
    pub fn clear_all(&self) -> Result<ClearCounts> {
        let tx = self.conn.unchecked_transaction()?;
        let counts = ClearCounts {
            devices: tx.execute("DELETE FROM devices", [])?,
            settings: tx.execute("DELETE FROM device_settings", [])?,
            preferences: tx.execute("DELETE FROM user_preferences", [])?,
        };
        tx.commit()?;

        info!(
            "Cleared {} devices, {} settings, {} preferences",
            counts.devices, counts.settings, counts.preferences
        );
        Ok(counts)
    }
}

fn raw_device(row: &Row<'_>) -> rusqlite::Result<(String, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode_device((id, version, document): (String, i64, String)) -> Result<StoredDevice> {
    Ok(StoredDevice {
        id,
        version: from_sql_version(version),
        record: serde_json::from_str(&document)?,
    })
}

fn parse_fragment(raw: Option<String>) -> Result<Option<Value>> {
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

pub(crate) fn to_nanos(ts: OffsetDateTime) -> Result<i64> {
    i64::try_from(ts.unix_timestamp_nanos())
        .map_err(|_| Error::InvalidTimestamp(format!("{ts} is out of range")))
}

/// Nearest representable nanosecond value, for range bounds.
pub(crate) fn clamp_nanos(ts: OffsetDateTime) -> i64 {
    let nanos = ts.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

pub(crate) fn from_nanos(nanos: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| Error::InvalidTimestamp(e.to_string()))
}

pub(crate) fn to_sql_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| Error::VersionOutOfRange(version))
}

/// The version a successful conditional write moves to.
pub(crate) fn next_version(expected: u64) -> Result<u64> {
    if expected > MAX_DECLARED_VERSION {
        return Err(Error::VersionOutOfRange(expected));
    }
    Ok(expected + 1)
}

pub(crate) fn from_sql_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or_default()
}
