//! Optimistic-concurrency writes shared by devices, settings and preferences.
//!
//! A writer declares the version it last saw. The store applies the write
//! only if that is still the stored version, bumping it by one in the same
//! statement. When nothing matches, a follow-up read by key tells a missing
//! entity apart from a lost race, and a lost race hands back the current
//! entity so the caller can merge and retry.
//!
//! Declared version `0` means "I have never seen this entity". Collections
//! that allow it create the entity at version 1; if it already exists the
//! write falls through to the normal conditional path, which cannot match
//! and so reports a conflict.

use serde_json::{Map, Value};
use tracksync_store::{Result, Store};
use tracksync_types::{DeviceSettings, StoredDevice, UserPreferences};

/// Result of a versioned write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<E> {
    /// The write matched and the entity is now at `declared + 1`.
    Applied(E),
    /// The write was a replay of what is already stored; nothing changed.
    Unchanged(E),
    /// The stored version differs from the declared one. Carries the current
    /// entity.
    Conflict(E),
    /// No entity exists under the key.
    NotFound,
}

/// A collection written through [`write`].
pub trait VersionedCollection {
    /// Stored entity.
    type Entity;
    /// What a writer submits.
    type Payload;

    /// Whether declared version 0 creates the entity.
    const CREATE_ON_ZERO: bool = false;
    /// Whether to compare against the stored entity before writing, to turn
    /// replays into [`WriteOutcome::Unchanged`].
    const DEDUPLICATE: bool = false;

    fn find(store: &Store, key: &str) -> Result<Option<Self::Entity>>;

    fn version(entity: &Self::Entity) -> u64;

    /// Insert at version 1 if nothing exists under `key`. Returns the created
    /// entity, or `None` if one already existed.
    fn insert_initial(
        _store: &Store,
        _key: &str,
        _payload: &Self::Payload,
    ) -> Result<Option<Self::Entity>> {
        Ok(None)
    }

    /// Write `payload` if the stored version equals `expected`.
    fn update_if_version(
        store: &Store,
        key: &str,
        expected: u64,
        payload: &Self::Payload,
    ) -> Result<Option<Self::Entity>>;

    /// Whether `payload` is a replay of `current`. Only consulted when
    /// versions match and [`Self::DEDUPLICATE`] is set.
    fn is_duplicate(_current: &Self::Entity, _payload: &Self::Payload) -> bool {
        false
    }
}

/// Write `payload` to the entity under `key`, declaring `declared` as the
/// version the caller last saw.
pub fn write<C: VersionedCollection>(
    store: &Store,
    key: &str,
    declared: u64,
    payload: &C::Payload,
) -> Result<WriteOutcome<C::Entity>> {
    if declared == 0
        && C::CREATE_ON_ZERO
        && let Some(created) = C::insert_initial(store, key, payload)?
    {
        return Ok(WriteOutcome::Applied(created));
    }

    if C::DEDUPLICATE
        && let Some(current) = C::find(store, key)?
        && C::version(&current) == declared
        && C::is_duplicate(&current, payload)
    {
        return Ok(WriteOutcome::Unchanged(current));
    }

    if let Some(updated) = C::update_if_version(store, key, declared, payload)? {
        return Ok(WriteOutcome::Applied(updated));
    }

    Ok(match C::find(store, key)? {
        Some(current) => WriteOutcome::Conflict(current),
        None => WriteOutcome::NotFound,
    })
}

/// Device records, keyed by store ID. The payload is an attribute patch.
pub struct Devices;

impl VersionedCollection for Devices {
    type Entity = StoredDevice;
    type Payload = Map<String, Value>;

    fn find(store: &Store, key: &str) -> Result<Option<StoredDevice>> {
        store.get_device(key)
    }

    fn version(entity: &StoredDevice) -> u64 {
        entity.version
    }

    fn update_if_version(
        store: &Store,
        key: &str,
        expected: u64,
        payload: &Map<String, Value>,
    ) -> Result<Option<StoredDevice>> {
        store.update_device_if_version(key, expected, payload)
    }
}

/// Device settings, keyed by `device_id`.
pub struct Settings;

impl VersionedCollection for Settings {
    type Entity = DeviceSettings;
    type Payload = DeviceSettings;

    const CREATE_ON_ZERO: bool = true;
    const DEDUPLICATE: bool = true;

    fn find(store: &Store, key: &str) -> Result<Option<DeviceSettings>> {
        store.get_settings(key)
    }

    fn version(entity: &DeviceSettings) -> u64 {
        entity.version
    }

    fn insert_initial(
        store: &Store,
        key: &str,
        payload: &DeviceSettings,
    ) -> Result<Option<DeviceSettings>> {
        let initial = DeviceSettings {
            device_id: key.to_string(),
            version: 1,
            ..payload.clone()
        };
        Ok(store.insert_settings_if_absent(&initial)?.then_some(initial))
    }

    fn update_if_version(
        store: &Store,
        key: &str,
        expected: u64,
        payload: &DeviceSettings,
    ) -> Result<Option<DeviceSettings>> {
        let settings = DeviceSettings {
            device_id: key.to_string(),
            ..payload.clone()
        };
        store.update_settings_if_version(&settings, expected)
    }

    fn is_duplicate(current: &DeviceSettings, payload: &DeviceSettings) -> bool {
        match (payload.updated_at, current.updated_at) {
            (Some(incoming), Some(stored)) => incoming <= stored,
            _ => false,
        }
    }
}

/// User preferences, keyed by `user_id`.
pub struct Preferences;

impl VersionedCollection for Preferences {
    type Entity = UserPreferences;
    type Payload = UserPreferences;

    const CREATE_ON_ZERO: bool = true;

    fn find(store: &Store, key: &str) -> Result<Option<UserPreferences>> {
        store.get_preferences(key)
    }

    fn version(entity: &UserPreferences) -> u64 {
        entity.version
    }

    fn insert_initial(
        store: &Store,
        key: &str,
        payload: &UserPreferences,
    ) -> Result<Option<UserPreferences>> {
        let initial = UserPreferences {
            user_id: key.to_string(),
            version: 1,
            ..payload.clone()
        };
        Ok(store.insert_preferences_if_absent(&initial)?.then_some(initial))
    }

    fn update_if_version(
        store: &Store,
        key: &str,
        expected: u64,
        payload: &UserPreferences,
    ) -> Result<Option<UserPreferences>> {
        let prefs = UserPreferences {
            user_id: key.to_string(),
            ..payload.clone()
        };
        store.update_preferences_if_version(&prefs, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;
    use tracksync_types::DeviceRecord;

    fn settings_at(version: u64, updated_at: time::OffsetDateTime) -> DeviceSettings {
        DeviceSettings {
            version,
            updated_at: Some(updated_at),
            ..DeviceSettings::defaults_for("abc")
        }
    }

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .put_settings(&settings_at(1, datetime!(2024-01-01 0:00 UTC)))
            .unwrap();
        store
    }

    #[test]
    fn test_correct_version_applies_and_increments() {
        let store = seeded_store();
        let mut change = settings_at(1, datetime!(2024-01-02 0:00 UTC));
        change.min_num_satellites = 4;

        let outcome = write::<Settings>(&store, "abc", 1, &change).unwrap();
        let WriteOutcome::Applied(updated) = outcome else {
            panic!("expected Applied, got {:?}", outcome);
        };
        assert_eq!(updated.version, 2);
        assert_eq!(updated.min_num_satellites, 4);
        assert_eq!(store.get_settings("abc").unwrap().unwrap(), updated);
    }

    #[test]
    fn test_stale_version_conflicts_without_mutating() {
        let store = seeded_store();
        let first = settings_at(1, datetime!(2024-01-02 0:00 UTC));
        write::<Settings>(&store, "abc", 1, &first).unwrap();

        let mut stale = settings_at(1, datetime!(2024-01-03 0:00 UTC));
        stale.max_hdop = 9.0;
        let outcome = write::<Settings>(&store, "abc", 1, &stale).unwrap();

        let WriteOutcome::Conflict(current) = outcome else {
            panic!("expected Conflict, got {:?}", outcome);
        };
        assert_eq!(current.version, 2);
        assert_eq!(current.max_hdop, 3.5);
        assert_eq!(store.get_settings("abc").unwrap().unwrap(), current);
    }

    #[test]
    fn test_version_zero_against_existing_conflicts() {
        let store = seeded_store();
        let mut fresh = settings_at(0, datetime!(2024-02-01 0:00 UTC));
        fresh.max_hdop = 1.0;

        let outcome = write::<Settings>(&store, "abc", 0, &fresh).unwrap();
        assert!(matches!(outcome, WriteOutcome::Conflict(ref s) if s.version == 1));
        assert_eq!(store.get_settings("abc").unwrap().unwrap().max_hdop, 3.5);
    }

    #[test]
    fn test_version_zero_creates_at_one() {
        let store = Store::open_in_memory().unwrap();
        let mut fresh = settings_at(0, datetime!(2024-02-01 0:00 UTC));
        fresh.device_id = "ignored".to_string();

        let outcome = write::<Settings>(&store, "new-device", 0, &fresh).unwrap();
        let WriteOutcome::Applied(created) = outcome else {
            panic!("expected Applied, got {:?}", outcome);
        };
        assert_eq!(created.version, 1);
        assert_eq!(created.device_id, "new-device");
        assert!(store.get_settings("new-device").unwrap().is_some());
    }

    #[test]
    fn test_missing_entity_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let change = settings_at(3, datetime!(2024-02-01 0:00 UTC));
        assert_eq!(
            write::<Settings>(&store, "nope", 3, &change).unwrap(),
            WriteOutcome::NotFound
        );
    }

    #[test]
    fn test_settings_replay_is_unchanged() {
        let store = seeded_store();

        for ts in [datetime!(2024-01-01 0:00 UTC), datetime!(2023-12-31 0:00 UTC)] {
            let mut replay = settings_at(1, ts);
            replay.max_hdop = 7.0;

            let outcome = write::<Settings>(&store, "abc", 1, &replay).unwrap();
            let WriteOutcome::Unchanged(current) = outcome else {
                panic!("expected Unchanged, got {:?}", outcome);
            };
            assert_eq!(current.version, 1);
            assert_eq!(current.max_hdop, 3.5);
        }

        assert_eq!(store.get_settings("abc").unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_settings_without_stored_timestamp_always_write() {
        let store = Store::open_in_memory().unwrap();
        store
            .put_settings(&DeviceSettings::defaults_for("abc"))
            .unwrap();

        let change = settings_at(1, datetime!(2000-01-01 0:00 UTC));
        assert!(matches!(
            write::<Settings>(&store, "abc", 1, &change).unwrap(),
            WriteOutcome::Applied(_)
        ));
    }

    #[test]
    fn test_preferences_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let mut prefs = UserPreferences::defaults_for("u1");
        prefs.version = 0;
        prefs.unit = "metric".to_string();

        let outcome = write::<Preferences>(&store, "u1", 0, &prefs).unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(ref p) if p.version == 1 && p.unit == "metric"));

        prefs.device_list_width = 250;
        let outcome = write::<Preferences>(&store, "u1", 1, &prefs).unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(ref p) if p.version == 2 && p.device_list_width == 250));

        // Replays are not deduplicated for preferences; a stale version conflicts
        let outcome = write::<Preferences>(&store, "u1", 1, &prefs).unwrap();
        assert!(matches!(outcome, WriteOutcome::Conflict(ref p) if p.version == 2));

        let outcome = write::<Preferences>(&store, "u1", 0, &prefs).unwrap();
        assert!(matches!(outcome, WriteOutcome::Conflict(_)));

        assert_eq!(
            write::<Preferences>(&store, "u2", 5, &prefs).unwrap(),
            WriteOutcome::NotFound
        );
    }

    #[test]
    fn test_device_patch() {
        let store = Store::open_in_memory().unwrap();
        let device = store
            .insert_device(&DeviceRecord::new("abc", datetime!(2024-01-01 0:00 UTC)))
            .unwrap();

        let patch = json!({"display_name": "Van"});
        let patch = patch.as_object().unwrap();

        let outcome = write::<Devices>(&store, &device.id, 0, patch).unwrap();
        let WriteOutcome::Applied(updated) = outcome else {
            panic!("expected Applied, got {:?}", outcome);
        };
        assert_eq!(updated.version, 1);
        assert_eq!(updated.record.attributes["display_name"], json!("Van"));

        let outcome = write::<Devices>(&store, &device.id, 0, patch).unwrap();
        assert!(matches!(outcome, WriteOutcome::Conflict(ref d) if d.version == 1));

        assert_eq!(
            write::<Devices>(&store, "00000000-0000-0000-0000-000000000000", 0, patch).unwrap(),
            WriteOutcome::NotFound
        );
    }

    #[test]
    fn test_device_version_zero_does_not_create() {
        let store = Store::open_in_memory().unwrap();
        let patch = Map::new();
        assert_eq!(
            write::<Devices>(&store, "missing", 0, &patch).unwrap(),
            WriteOutcome::NotFound
        );
        assert_eq!(store.count_devices().unwrap(), 0);
    }
}
