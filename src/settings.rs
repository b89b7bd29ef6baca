use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::device::MeditationDevice;

const DEBUG_SYNC_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Period of the foreground reconnect-and-sync timer.
    pub sync_interval_secs: u64,
    /// Upper bound for any single link operation.
    pub link_timeout_ms: u64,
    pub scan_window_secs: u64,
    /// Sessions applied in parallel within one cycle.
    pub apply_concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
            link_timeout_ms: 5_000,
            scan_window_secs: 10,
            apply_concurrency: 4,
        }
    }
}

impl SyncSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms.max(1))
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    /// `BANDSYNC_DEBUG=1` shortens the periodic sync so changes show up on
    /// the band quickly during development.
    pub fn with_env_overrides(mut self) -> Self {
        let debug_mode = std::env::var("BANDSYNC_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.sync_interval_secs = self.sync_interval_secs.min(DEBUG_SYNC_INTERVAL_SECS);
        }
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UserSettings {
    sync: SyncSettings,
    paired_device: Option<MeditationDevice>,
}

/// JSON-backed settings plus the paired band identity.
///
/// A store without a path keeps everything in memory.
pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(data) => data,
                Err(err) => {
                    log::warn!(
                        "Ignoring unreadable settings at {}: {err}",
                        path.display()
                    );
                    UserSettings::default()
                }
            }
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(UserSettings::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, UserSettings>> {
        self.data
            .read()
            .map_err(|_| anyhow!("settings lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, UserSettings>> {
        self.data
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))
    }

    pub fn sync(&self) -> SyncSettings {
        self.read()
            .map(|guard| guard.sync.clone())
            .unwrap_or_default()
            .with_env_overrides()
    }

    pub fn update_sync(&self, settings: SyncSettings) -> Result<()> {
        let mut guard = self.write()?;
        guard.sync = settings;
        self.persist(&guard)
    }

    pub fn paired_device(&self) -> Option<MeditationDevice> {
        self.read()
            .ok()
            .and_then(|guard| guard.paired_device.clone())
    }

    pub fn set_paired_device(&self, device: Option<MeditationDevice>) -> Result<()> {
        let mut guard = self.write()?;
        guard.paired_device = device;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }
}
