//! In-memory per-device freshness index.
//!
//! Maps each `device_id` to the `updated_at` of the last record the ingestor
//! wrote for it, plus one process-wide "last checked" stamp. Polling clients
//! compare their own timestamp against `last_checked` before anything touches
//! the store.
//!
//! The map and the stamp live behind a single [`RwLock`]. Every accessor takes
//! the lock only for the lookup or update itself; callers never hold it
//! across store or network I/O.

use std::collections::HashMap;

use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Last-observed update time per device.
#[derive(Debug)]
pub struct FreshnessIndex {
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<String, OffsetDateTime>,
    last_checked: OffsetDateTime,
}

impl FreshnessIndex {
    /// Create an empty index whose `last_checked` is `started_at`.
    pub fn new(started_at: OffsetDateTime) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                last_checked: started_at,
            }),
        }
    }

    /// Last recorded update time for a device. `None` means never seen.
    pub async fn get(&self, device_id: &str) -> Option<OffsetDateTime> {
        self.inner.read().await.entries.get(device_id).copied()
    }

    /// Record the update time of a record that was just written.
    pub async fn set(&self, device_id: &str, updated_at: OffsetDateTime) {
        self.inner
            .write()
            .await
            .entries
            .insert(device_id.to_string(), updated_at);
    }

    /// Whether `candidate` is strictly newer than what the index holds for
    /// the device. Unknown devices accept any timestamp.
    pub async fn is_newer(&self, device_id: &str, candidate: OffsetDateTime) -> bool {
        self.get(device_id)
            .await
            .is_none_or(|recorded| candidate > recorded)
    }

    /// Upper bound of what has been ingested.
    pub async fn last_checked(&self) -> OffsetDateTime {
        self.inner.read().await.last_checked
    }

    /// Stamp the end of an ingestion pass.
    pub async fn mark_checked(&self, at: OffsetDateTime) {
        self.inner.write().await.last_checked = at;
    }

    /// Number of devices with an entry.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Forget every device. `last_checked` is kept.
    pub async fn clear(&self) {
        self.inner.write().await.entries.clear();
    }
}
