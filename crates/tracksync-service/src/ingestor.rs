//! Background ingestion of telemetry snapshots.
//!
//! Each pass fetches the whole fleet, inserts devices seen for the first
//! time, replaces devices whose `updated_at` is strictly newer than what the
//! freshness index holds, and finally stamps the index's `last_checked`.
//! A malformed record or a failed write skips that device only; a failed
//! fetch skips the pass.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use tracksync_store::ClearCounts;
use tracksync_types::{DeviceSettings, IncomingDevice};

use crate::state::{AppState, StoreTimeout};
use crate::telemetry::TelemetryError;

/// Outcome counts of one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Entries in the snapshot.
    pub fetched: usize,
    /// Devices seen for the first time.
    pub inserted: usize,
    /// Existing devices replaced with newer data.
    pub updated: usize,
    /// Existing devices whose `updated_at` was not newer.
    pub unchanged: usize,
    /// Entries rejected by validation.
    pub malformed: usize,
    /// Entries whose store write failed.
    pub failed: usize,
    /// Settings documents created from the snapshot.
    pub settings_seeded: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

/// Errors that abort a whole pass, or a single device within one.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Upstream(#[from] TelemetryError),
    #[error("Store error: {0}")]
    Store(#[from] tracksync_store::Error),
    #[error(transparent)]
    StoreTimeout(#[from] StoreTimeout),
    #[error("device {0} was removed while being replaced")]
    Vanished(String),
}

enum Written {
    Inserted { settings_seeded: bool },
    Updated { settings_seeded: bool },
}

/// Runs ingestion passes against the shared state.
pub struct Ingestor {
    state: Arc<AppState>,
}

impl Ingestor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Start the background loop.
    ///
    /// Returns `None` if it is already running. The first pass runs
    /// immediately, then one per configured interval until
    /// [`IngestorState::signal_stop`](crate::state::IngestorState::signal_stop).
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        if self.state.ingestor.is_running() {
            return None;
        }

        let period = self.state.config.read().await.ingest.interval();
        self.state.ingestor.reset_stop();
        self.state.ingestor.set_running(true);

        info!("Starting ingestor (interval: {}s)", period.as_secs());

        let state = Arc::clone(&self.state);
        Some(tokio::spawn(async move {
            let ingestor = Ingestor::new(Arc::clone(&state));
            let mut stop_rx = state.ingestor.subscribe_stop();
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            info!("Ingestor stopped");
                            break;
                        }
                        continue;
                    }
                }

                let had_failures = state.ingestor.stats().await.consecutive_failures > 0;
                match ingestor.run_once().await {
                    Ok(_) if had_failures => info!("Ingestion recovered"),
                    Ok(_) => {}
                    Err(e) => {
                        let failures = state.ingestor.stats().await.consecutive_failures;
                        if failures <= 3 {
                            warn!("Ingestion pass failed: {} (attempt {})", e, failures);
                        } else if failures == 4 {
                            error!(
                                "Ingestion failed {} times in a row, will continue trying silently",
                                failures
                            );
                        }
                    }
                }
            }
        }))
    }

    /// Run one pass now.
    pub async fn run_once(&self) -> Result<TickReport, IngestError> {
        let _pass = self.state.ingestor.pass_lock.lock().await;
        self.pass().await
    }

    /// Clear devices, settings, preferences and the freshness index, then
    /// run one pass.
    pub async fn resync(&self) -> Result<(ClearCounts, TickReport), IngestError> {
        let _pass = self.state.ingestor.pass_lock.lock().await;

        let cleared = {
            let store = self.state.store().await?;
            store.clear_all()?
        };
        self.state.freshness.clear().await;
        info!("Forced resync: store and freshness index cleared");

        let report = self.pass().await?;
        Ok((cleared, report))
    }

    async fn pass(&self) -> Result<TickReport, IngestError> {
        match self.ingest().await {
            Ok(report) => {
                self.state.ingestor.record_success(report.clone()).await;
                Ok(report)
            }
            Err(e) => {
                self.state.ingestor.record_failure(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn ingest(&self) -> Result<TickReport, IngestError> {
        let snapshot = self.state.source.fetch_snapshot().await?;

        let mut known: HashSet<String> = {
            let store = self.state.store().await?;
            store.device_ids()?
        };

        let mut report = TickReport {
            fetched: snapshot.result_list.len(),
            ..TickReport::default()
        };

        for raw in snapshot.result_list {
            let incoming = match IncomingDevice::from_value(raw) {
                Ok(incoming) => incoming,
                Err(e) => {
                    warn!("Skipping malformed device record: {}", e);
                    report.malformed += 1;
                    continue;
                }
            };

            let device_id = incoming.record.device_id.clone();
            let updated_at = incoming.record.updated_at;

            if let Some(reason) = &incoming.settings_error {
                warn!("Ignoring settings carried by {}: {}", device_id, reason);
            }

            let existing = known.contains(&device_id);
            if existing && !self.state.freshness.is_newer(&device_id, updated_at).await {
                report.unchanged += 1;
                continue;
            }

            let written = if existing {
                self.replace(&incoming).await
            } else {
                self.insert(&incoming).await
            };

            match written {
                Ok(Written::Inserted { settings_seeded }) => {
                    debug!("Inserted device {} at {}", device_id, updated_at);
                    report.inserted += 1;
                    report.settings_seeded += usize::from(settings_seeded);
                    known.insert(device_id.clone());
                }
                Ok(Written::Updated { settings_seeded }) => {
                    debug!("Updated device {} to {}", device_id, updated_at);
                    report.updated += 1;
                    report.settings_seeded += usize::from(settings_seeded);
                }
                Err(e) => {
                    warn!("Failed to store device {}: {}", device_id, e);
                    report.failed += 1;
                    continue;
                }
            }

            self.state.freshness.set(&device_id, updated_at).await;
        }

        let finished_at = OffsetDateTime::now_utc();
        self.state.freshness.mark_checked(finished_at).await;
        report.finished_at = Some(finished_at);

        info!(
            "Ingested {} devices: {} inserted, {} updated, {} unchanged, {} malformed, {} failed",
            report.fetched,
            report.inserted,
            report.updated,
            report.unchanged,
            report.malformed,
            report.failed
        );
        Ok(report)
    }

    /// First sighting: store the record and its settings. Settings come from
    /// the snapshot when present, otherwise the defaults.
    async fn insert(&self, incoming: &IncomingDevice) -> Result<Written, IngestError> {
        let device_id = &incoming.record.device_id;
        let settings = DeviceSettings {
            device_id: device_id.clone(),
            version: 1,
            ..incoming
                .settings
                .clone()
                .unwrap_or_else(|| DeviceSettings::defaults_for(device_id.as_str()))
        };

        let store = self.state.store().await?;
        store.insert_device(&incoming.record)?;
        store.put_settings(&settings)?;

        Ok(Written::Inserted {
            settings_seeded: true,
        })
    }

    /// Newer sighting: replace the record. Settings carried by the snapshot
    /// only seed a device that has none; existing settings are never touched.
    async fn replace(&self, incoming: &IncomingDevice) -> Result<Written, IngestError> {
        let store = self.state.store().await?;
        if store.replace_device(&incoming.record)?.is_none() {
            return Err(IngestError::Vanished(incoming.record.device_id.clone()));
        }

        let settings_seeded = match &incoming.settings {
            Some(settings) => store.insert_settings_if_absent(&DeviceSettings {
                version: 1,
                ..settings.clone()
            })?,
            None => false,
        };

        Ok(Written::Updated { settings_seeded })
    }
}
