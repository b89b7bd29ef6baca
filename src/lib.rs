//! Keeps a meditation band and the app's practice ledger in agreement.
//!
//! The band records sessions while untethered and queues them; the app pulls
//! that queue over BLE, applies each session to the ledger and hour bank
//! exactly once, acknowledges what it applied and pushes back today's plans
//! and the authoritative practice total.

pub mod db;
pub mod device;
pub mod ledger;
pub mod link;
pub mod protocol;
pub mod scheduler;
pub mod settings;
pub mod sync;
pub mod utils;

#[cfg(feature = "tauri")]
pub mod commands;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use db::{Database, SessionRecord};
use device::{DeviceStateHandle, MeditationDevice};
use link::{LinkBackend, LinkManager};
use scheduler::SyncScheduler;
use settings::SettingsStore;
use sync::SyncOrchestrator;

pub use utils::logging::init_logging;

const DB_FILE: &str = "bandsync.sqlite3";
const SETTINGS_FILE: &str = "settings.json";

/// Everything the host app needs, wired together once at startup.
#[derive(Clone)]
pub struct SyncService {
    pub db: Database,
    pub settings: Arc<SettingsStore>,
    pub link: LinkManager,
    pub device: DeviceStateHandle,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub scheduler: SyncScheduler,
}

impl SyncService {
    /// Opens the ledger and settings under `data_dir`. Must be called inside
    /// a tokio runtime.
    pub fn open(data_dir: &Path, backend: Arc<dyn LinkBackend>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let db = Database::new(data_dir.join(DB_FILE))?;
        let settings = Arc::new(SettingsStore::new(data_dir.join(SETTINGS_FILE))?);
        Ok(Self::new(db, settings, backend))
    }

    pub fn new(db: Database, settings: Arc<SettingsStore>, backend: Arc<dyn LinkBackend>) -> Self {
        let sync_settings = settings.sync();

        let link = LinkManager::from_settings(backend, &sync_settings);
        let device = DeviceStateHandle::spawn(settings.clone());
        let ledger = Arc::new(db.clone());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(link.clone(), ledger.clone(), ledger.clone(), ledger)
                .with_apply_concurrency(sync_settings.apply_concurrency),
        );
        let scheduler = SyncScheduler::new(
            link.clone(),
            device.clone(),
            orchestrator.clone(),
            sync_settings.sync_interval(),
        );

        Self {
            db,
            settings,
            link,
            device,
            orchestrator,
            scheduler,
        }
    }

    pub async fn pair(&self, device: MeditationDevice) -> Result<()> {
        if let Some(previous) = self.device.snapshot().device_id() {
            if previous != device.id {
                self.link.disconnect(previous).await;
            }
        }
        self.device.pair(device).await
    }

    /// Closes the link before forgetting the band.
    pub async fn unpair(&self) -> Result<()> {
        if let Some(id) = self.device.snapshot().device_id() {
            self.link.disconnect(id).await;
        }
        self.device.unpair().await
    }

    /// Stores a session practiced in the app and lets the band know.
    pub async fn record_local_session(
        &self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        pose: Option<String>,
        discipline: Option<String>,
    ) -> Result<SessionRecord> {
        let record = self
            .db
            .record_local_session(started_at, ended_at, pose, discipline)
            .await?;
        self.scheduler.notify_session_recorded();
        Ok(record)
    }
}
