use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use crate::protocol::DeviceStatus;
use crate::settings::SettingsStore;

use super::{DeviceSnapshot, MeditationDevice};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

enum DeviceCommand {
    Pair(MeditationDevice, oneshot::Sender<Result<()>>),
    Unpair(oneshot::Sender<Result<()>>),
    SetConnected(bool, oneshot::Sender<()>),
    SetStatus(DeviceStatus, oneshot::Sender<()>),
    RecordSync {
        at: DateTime<Utc>,
        ok: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the task that owns the band's state.
///
/// All mutations go through the owning task in arrival order; readers get
/// snapshots from a `watch` channel and never mutate directly. The identity
/// is written through to the settings store, everything else starts from
/// scratch each process.
#[derive(Clone)]
pub struct DeviceStateHandle {
    commands: mpsc::UnboundedSender<DeviceCommand>,
    snapshot: watch::Receiver<DeviceSnapshot>,
}

struct DeviceState {
    current: DeviceSnapshot,
    settings: Arc<SettingsStore>,
}

impl DeviceStateHandle {
    /// Restores the paired identity from `settings` and starts the owning
    /// task. Must be called inside a tokio runtime.
    pub fn spawn(settings: Arc<SettingsStore>) -> Self {
        let initial = DeviceSnapshot {
            device: settings.paired_device(),
            ..DeviceSnapshot::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial.clone());
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let state = DeviceState {
            current: initial,
            settings,
        };
        tokio::spawn(run(state, command_rx, snapshot_tx));

        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    pub async fn pair(&self, device: MeditationDevice) -> Result<()> {
        self.request(|reply| DeviceCommand::Pair(device, reply))
            .await?
    }

    /// Forgets the band. Does not touch the link; disconnect first.
    pub async fn unpair(&self) -> Result<()> {
        self.request(DeviceCommand::Unpair).await?
    }

    pub async fn set_connected(&self, connected: bool) {
        if let Err(err) = self
            .request(|reply| DeviceCommand::SetConnected(connected, reply))
            .await
        {
            log_warn!("dropping connection update: {err}");
        }
    }

    pub async fn set_status(&self, status: DeviceStatus) {
        if let Err(err) = self
            .request(|reply| DeviceCommand::SetStatus(status, reply))
            .await
        {
            log_warn!("dropping status update: {err}");
        }
    }

    pub async fn record_sync(&self, at: DateTime<Utc>, ok: bool) {
        if let Err(err) = self
            .request(|reply| DeviceCommand::RecordSync { at, ok, reply })
            .await
        {
            log_warn!("dropping sync record: {err}");
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DeviceCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| anyhow!("device state task has stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("device state task dropped the request"))
    }
}

async fn run(
    mut state: DeviceState,
    mut commands: mpsc::UnboundedReceiver<DeviceCommand>,
    snapshot: watch::Sender<DeviceSnapshot>,
) {
    while let Some(command) = commands.recv().await {
        // Replies go out only after the snapshot is published, so a caller
        // that awaited a mutation always reads its effect.
        let reply: Box<dyn FnOnce() + Send> = match command {
            DeviceCommand::Pair(device, reply) => {
                let result = state.pair(device);
                Box::new(move || {
                    let _ = reply.send(result);
                })
            }
            DeviceCommand::Unpair(reply) => {
                let result = state.unpair();
                Box::new(move || {
                    let _ = reply.send(result);
                })
            }
            DeviceCommand::SetConnected(connected, reply) => {
                state.set_connected(connected);
                Box::new(move || {
                    let _ = reply.send(());
                })
            }
            DeviceCommand::SetStatus(status, reply) => {
                state.current.status = Some(status);
                Box::new(move || {
                    let _ = reply.send(());
                })
            }
            DeviceCommand::RecordSync { at, ok, reply } => {
                state.current.last_sync_at = Some(at);
                state.current.last_sync_ok = Some(ok);
                Box::new(move || {
                    let _ = reply.send(());
                })
            }
        };

        publish(&snapshot, &state.current);
        reply();
    }
}

fn publish(snapshot: &watch::Sender<DeviceSnapshot>, current: &DeviceSnapshot) {
    snapshot.send_if_modified(|published| {
        if published == current {
            false
        } else {
            *published = current.clone();
            true
        }
    });
}

impl DeviceState {
    fn pair(&mut self, device: MeditationDevice) -> Result<()> {
        self.settings.set_paired_device(Some(device.clone()))?;

        let same_band = self.current.device_id() == Some(device.id.as_str());
        if !same_band {
            // A connection or phase belongs to the band that was paired before.
            self.current.is_connected = false;
            self.current.status = None;
            self.current.last_sync_at = None;
            self.current.last_sync_ok = None;
        }
        log_info!("paired with {} ({})", device.name, device.id);
        self.current.device = Some(device);
        Ok(())
    }

    fn unpair(&mut self) -> Result<()> {
        self.settings.set_paired_device(None)?;
        if let Some(device) = self.current.device.take() {
            log_info!("unpaired {}", device.id);
        }
        self.current = DeviceSnapshot::default();
        Ok(())
    }

    fn set_connected(&mut self, connected: bool) {
        if connected && self.current.device.is_none() {
            log_warn!("ignoring connect notice with no paired band");
            return;
        }
        self.current.is_connected = connected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(id: &str) -> MeditationDevice {
        MeditationDevice {
            id: id.into(),
            name: "Meditation Band".into(),
            rssi: Some(-48),
        }
    }

    #[tokio::test]
    async fn identity_is_restored_but_connection_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        {
            let settings = Arc::new(SettingsStore::new(path.clone()).unwrap());
            let state = DeviceStateHandle::spawn(settings);
            state.pair(band("band-1")).await.unwrap();
            state.set_connected(true).await;
            state.set_status(DeviceStatus::Active).await;
            assert!(state.snapshot().is_connected);
        }

        let settings = Arc::new(SettingsStore::new(path).unwrap());
        let restarted = DeviceStateHandle::spawn(settings);
        let snapshot = restarted.snapshot();
        assert_eq!(snapshot.device, Some(band("band-1")));
        assert!(!snapshot.is_connected);
        assert_eq!(snapshot.status, None);
    }

    #[tokio::test]
    async fn unpair_clears_identity_and_forces_disconnected() {
        let settings = Arc::new(SettingsStore::in_memory());
        let state = DeviceStateHandle::spawn(settings.clone());
        state.pair(band("band-1")).await.unwrap();
        state.set_connected(true).await;

        state.unpair().await.unwrap();
        let snapshot = state.snapshot();
        assert!(!snapshot.is_paired());
        assert!(!snapshot.is_connected);
        assert!(settings.paired_device().is_none());
    }

    #[tokio::test]
    async fn connection_requires_a_paired_band() {
        let state = DeviceStateHandle::spawn(Arc::new(SettingsStore::in_memory()));
        state.set_connected(true).await;
        assert!(!state.snapshot().is_connected);
    }

    #[tokio::test]
    async fn pairing_another_band_resets_ephemeral_fields() {
        let state = DeviceStateHandle::spawn(Arc::new(SettingsStore::in_memory()));
        state.pair(band("band-1")).await.unwrap();
        state.set_connected(true).await;
        state.set_status(DeviceStatus::Settling).await;

        state.pair(band("band-1")).await.unwrap();
        assert!(state.snapshot().is_connected);

        state.pair(band("band-2")).await.unwrap();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.device_id(), Some("band-2"));
        assert!(!snapshot.is_connected);
        assert_eq!(snapshot.status, None);
    }

    #[tokio::test]
    async fn observers_see_changes() {
        let state = DeviceStateHandle::spawn(Arc::new(SettingsStore::in_memory()));
        let mut observer = state.subscribe();
        state.pair(band("band-1")).await.unwrap();

        observer.changed().await.unwrap();
        assert!(observer.borrow_and_update().is_paired());

        let at = Utc::now();
        state.record_sync(at, true).await;
        observer.changed().await.unwrap();
        assert_eq!(observer.borrow().last_sync_at, Some(at));
        assert_eq!(observer.borrow().last_sync_ok, Some(true));
    }
}
