//! Answering client polls: "has anything changed since T?".

use std::collections::BTreeMap;

use serde::Serialize;
use time::OffsetDateTime;
use tracksync_types::DeviceSummary;

use crate::state::{AppState, StoreTimeout};

/// Errors answering a change poll.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Store error: {0}")]
    Store(#[from] tracksync_store::Error),
    #[error(transparent)]
    StoreTimeout(#[from] StoreTimeout),
}

/// Response to a change poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    /// Whether anything was ingested after the client's timestamp.
    pub needs_update: bool,
    /// The process-wide last-checked stamp. Clients send it back next time.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Devices with `updated_at` strictly after the client's timestamp.
    /// Present only when `needs_update` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_devices: Option<Vec<DeviceSummary>>,
    /// `device_id` to icon URL for every known device.
    pub icon_map: BTreeMap<String, String>,
}

/// Compare `since` against the last ingestion stamp and, if the client is
/// behind, fetch the devices that changed after `since`.
///
/// `last_checked` is read before the store is touched so the returned stamp
/// never runs ahead of the device set. The icon map is refreshed on every
/// call.
pub async fn check_for_updates(
    state: &AppState,
    since: OffsetDateTime,
) -> Result<UpdateCheck, QueryError> {
    let last_update = state.freshness.last_checked().await;
    let needs_update = since < last_update;

    let store = state.store().await?;
    let icon_map = store.icon_map()?;
    let updated_devices = if needs_update {
        Some(store.devices_updated_since(since)?)
    } else {
        None
    };

    Ok(UpdateCheck {
        needs_update,
        last_update,
        updated_devices,
        icon_map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use time::macros::datetime;

    use crate::ingestor::Ingestor;
    use crate::ingestor::tests::test_state;

    fn fixture() -> Vec<serde_json::Value> {
        vec![
            json!({
                "device_id": "a",
                "updated_at": "2024-01-01T00:00:00Z",
                "online": true,
                "odometer": 1200,
            }),
            json!({
                "device_id": "b",
                "updated_at": "2024-01-02T00:00:00Z",
                "latest_device_point": {"lat": 1.0, "lng": 2.0},
            }),
            json!({
                "device_id": "c",
                "updated_at": "2024-01-03T00:00:00Z",
                "active_state": "driving",
            }),
        ]
    }

    #[tokio::test]
    async fn test_client_up_to_date() {
        let (state, source) = test_state();
        source.set(fixture());
        Ingestor::new(Arc::clone(&state)).run_once().await.unwrap();

        let last_checked = state.freshness.last_checked().await;
        for since in [last_checked, last_checked + time::Duration::hours(1)] {
            let check = check_for_updates(&state, since).await.unwrap();
            assert!(!check.needs_update);
            assert_eq!(check.last_update, last_checked);
            assert!(check.updated_devices.is_none());
            assert_eq!(check.icon_map.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_returns_exactly_the_changed_devices() {
        let (state, source) = test_state();
        source.set(fixture());
        Ingestor::new(Arc::clone(&state)).run_once().await.unwrap();

        let check = check_for_updates(&state, datetime!(2024-01-01 12:00 UTC))
            .await
            .unwrap();
        assert!(check.needs_update);

        let devices = check.updated_devices.unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
        assert_eq!(devices[0].latest_device_point, Some(json!({"lat": 1.0, "lng": 2.0})));
        assert_eq!(devices[1].active_state, Some(json!("driving")));
    }

    #[tokio::test]
    async fn test_boundary_is_exclusive() {
        let (state, source) = test_state();
        source.set(fixture());
        Ingestor::new(Arc::clone(&state)).run_once().await.unwrap();

        let check = check_for_updates(&state, datetime!(2024-01-03 0:00 UTC))
            .await
            .unwrap();
        assert!(check.needs_update);
        assert_eq!(check.updated_devices, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_projection_drops_other_fields() {
        let (state, source) = test_state();
        source.set(fixture());
        Ingestor::new(Arc::clone(&state)).run_once().await.unwrap();

        let check = check_for_updates(&state, OffsetDateTime::UNIX_EPOCH)
            .await
            .unwrap();
        let json = serde_json::to_value(&check).unwrap();
        let first = &json["updatedDevices"][0];
        assert_eq!(first["device_id"], "a");
        assert_eq!(first["online"], true);
        assert!(first.get("odometer").is_none());
        assert!(json.get("iconMap").is_some());
        assert!(json.get("lastUpdate").is_some());
    }

    #[tokio::test]
    async fn test_far_past_bound_returns_everything() {
        let (state, source) = test_state();
        source.set(fixture());
        Ingestor::new(Arc::clone(&state)).run_once().await.unwrap();

        let zero = tracksync_types::parse_rfc3339("lastUpdate", "0001-01-01T00:00:00Z").unwrap();
        let check = check_for_updates(&state, zero).await.unwrap();
        assert!(check.needs_update);
        assert_eq!(check.updated_devices.map(|d| d.len()), Some(3));
    }

    #[tokio::test]
    async fn test_store_timeout_is_reported() {
        let mut config = crate::config::Config::default();
        config.storage.op_timeout_ms = 20;
        let state = AppState::with_source(
            tracksync_store::Store::open_in_memory().unwrap(),
            config,
            Arc::new(crate::ingestor::tests::StaticSource::default()),
        );

        let _held = state.store.lock().await;
        let result = check_for_updates(&state, OffsetDateTime::UNIX_EPOCH).await;
        assert!(matches!(result, Err(QueryError::StoreTimeout(_))));
    }

    #[tokio::test]
    async fn test_icon_map_reflects_settings() {
        let (state, source) = test_state();
        source.set(fixture());
        Ingestor::new(Arc::clone(&state)).run_once().await.unwrap();
        {
            let store = state.store().await.unwrap();
            let mut settings = store.get_settings("b").unwrap().unwrap();
            settings.icon_url = "/icons/truck.png".to_string();
            store.put_settings(&settings).unwrap();
        }

        let last_checked = state.freshness.last_checked().await;
        let check = check_for_updates(&state, last_checked).await.unwrap();
        assert_eq!(check.icon_map["a"], "");
        assert_eq!(check.icon_map["b"], "/icons/truck.png");
    }
}
