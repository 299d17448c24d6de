//! Application state shared across handlers and the ingestor.
//!
//! # Lock Ordering
//!
//! When more than one lock is needed, acquire in this order:
//! 1. `ingestor` pass lock (ingestion passes only)
//! 2. `config`
//! 3. `store`
//! 4. `freshness`
//!
//! The freshness index is never held across a store call; the store guard is
//! never held across a telemetry fetch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};
use tracksync_store::Store;

use crate::config::Config;
use crate::freshness::FreshnessIndex;
use crate::ingestor::TickReport;
use crate::telemetry::{HttpSource, TelemetryError, TelemetrySource};

/// The store could not be acquired before the operation deadline.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("store busy: not acquired within {0:?}")]
pub struct StoreTimeout(pub Duration);

/// Shared application state.
pub struct AppState {
    /// The data store.
    pub store: Mutex<Store>,
    /// Configuration.
    pub config: RwLock<Config>,
    /// Per-device freshness and the process-wide last-checked stamp.
    pub freshness: FreshnessIndex,
    /// Ingestor control state and statistics.
    pub ingestor: IngestorState,
    /// Where snapshots come from.
    pub source: Arc<dyn TelemetrySource>,
    store_timeout: Duration,
}

impl AppState {
    /// Create application state fetching from the configured telemetry URL.
    pub fn new(store: Store, config: Config) -> Result<Arc<Self>, TelemetryError> {
        let source = HttpSource::new(config.telemetry.endpoint(), config.telemetry.timeout())?;
        Ok(Self::with_source(store, config, Arc::new(source)))
    }

    /// Create application state with an explicit telemetry source.
    pub fn with_source(
        store: Store,
        config: Config,
        source: Arc<dyn TelemetrySource>,
    ) -> Arc<Self> {
        let store_timeout = config.storage.op_timeout();
        Arc::new(Self {
            store: Mutex::new(store),
            config: RwLock::new(config),
            freshness: FreshnessIndex::new(OffsetDateTime::now_utc()),
            ingestor: IngestorState::new(),
            source,
            store_timeout,
        })
    }

    /// Acquire the store, giving up after the configured operation timeout.
    pub async fn store(&self) -> Result<MutexGuard<'_, Store>, StoreTimeout> {
        tokio::time::timeout(self.store_timeout, self.store.lock())
            .await
            .map_err(|_| StoreTimeout(self.store_timeout))
    }
}

/// State for tracking and controlling the ingestor.
pub struct IngestorState {
    /// Whether the background loop is running.
    running: AtomicBool,
    /// When the loop was started (Unix timestamp).
    started_at: AtomicU64,
    /// Channel to signal the loop to stop.
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    /// Serialises ingestion passes so two never interleave writes.
    pub(crate) pass_lock: Mutex<()>,
    /// Pass statistics.
    stats: RwLock<IngestStats>,
}

impl IngestorState {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            running: AtomicBool::new(false),
            started_at: AtomicU64::new(0),
            stop_tx,
            stop_rx,
            pass_lock: Mutex::new(()),
            stats: RwLock::new(IngestStats::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the loop as started or stopped.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        if running {
            let now = OffsetDateTime::now_utc().unix_timestamp() as u64;
            self.started_at.store(now, Ordering::SeqCst);
        }
    }

    pub fn started_at(&self) -> Option<OffsetDateTime> {
        let ts = self.started_at.load(Ordering::SeqCst);
        if ts == 0 {
            None
        } else {
            OffsetDateTime::from_unix_timestamp(ts as i64).ok()
        }
    }

    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    /// Signal the loop to stop.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Reset the stop signal (for restarting).
    pub fn reset_stop(&self) {
        let _ = self.stop_tx.send(false);
    }

    /// Snapshot of the pass statistics.
    pub async fn stats(&self) -> IngestStats {
        self.stats.read().await.clone()
    }

    pub(crate) async fn record_success(&self, report: TickReport) {
        let mut stats = self.stats.write().await;
        stats.passes += 1;
        stats.consecutive_failures = 0;
        stats.last_report = Some(report);
    }

    /// Record a failed pass and return how many have failed in a row.
    pub(crate) async fn record_failure(&self, error: String) -> u32 {
        let mut stats = self.stats.write().await;
        stats.failures += 1;
        stats.consecutive_failures += 1;
        stats.last_error = Some(error);
        stats.last_error_at = Some(OffsetDateTime::now_utc());
        stats.consecutive_failures
    }
}

impl Default for IngestorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Ingestion statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    /// Completed passes.
    pub passes: u64,
    /// Passes aborted by an upstream or store failure.
    pub failures: u64,
    /// Failures since the last completed pass.
    pub consecutive_failures: u32,
    /// Report of the last completed pass.
    pub last_report: Option<TickReport>,
    /// Last pass-level error message.
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_error_at: Option<OffsetDateTime>,
}
