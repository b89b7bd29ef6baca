//! Decides when a sync cycle runs.
//!
//! While the app is in the foreground a ticker re-attempts connect-and-sync
//! at a fixed interval; backgrounding cancels the ticker but leaves the link
//! alone. A session recorded in the app triggers an immediate attempt. All
//! attempts share one lock, so a new connect is never started while another
//! is pending.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::device::DeviceStateHandle;
use crate::link::{LinkEvent, LinkManager};
use crate::protocol::{decode_status, Characteristic};
use crate::sync::{SyncOrchestrator, SyncResult};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const RESULT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    SessionRecorded,
    Manual,
}

#[derive(Clone)]
pub struct SyncScheduler {
    link: LinkManager,
    device: DeviceStateHandle,
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
    attempt: Arc<Mutex<()>>,
    ticker: Arc<Mutex<Option<(JoinHandle<()>, CancellationToken)>>>,
    status_watch: Arc<Mutex<Option<JoinHandle<()>>>>,
    results: broadcast::Sender<SyncResult>,
}

impl SyncScheduler {
    /// Must be called inside a tokio runtime; a task is spawned to mirror
    /// link drops into the device state.
    pub fn new(
        link: LinkManager,
        device: DeviceStateHandle,
        orchestrator: Arc<SyncOrchestrator>,
        interval: Duration,
    ) -> Self {
        let (results, _) = broadcast::channel(RESULT_CAPACITY);
        let scheduler = Self {
            link,
            device,
            orchestrator,
            interval,
            attempt: Arc::new(Mutex::new(())),
            ticker: Arc::new(Mutex::new(None)),
            status_watch: Arc::new(Mutex::new(None)),
            results,
        };

        tokio::spawn(pump_link_events(
            scheduler.device.clone(),
            scheduler.status_watch.clone(),
            scheduler.link.events(),
        ));
        scheduler
    }

    /// Every cycle that actually ran, in completion order.
    pub fn results(&self) -> broadcast::Receiver<SyncResult> {
        self.results.subscribe()
    }

    pub async fn is_foreground(&self) -> bool {
        self.ticker.lock().await.is_some()
    }

    /// Starts the periodic connect-and-sync loop. The first attempt runs
    /// right away; the ticker stays armed even if it fails.
    pub async fn on_foreground(&self) {
        let mut ticker = self.ticker.lock().await;
        if let Some((handle, token)) = ticker.take() {
            token.cancel();
            handle.abort();
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let scheduler = self.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.attempt(Trigger::Timer).await;
                    }
                }
            }
        });

        log_info!("foregrounded; syncing every {}s", period.as_secs());
        *ticker = Some((handle, token));
    }

    /// Stops the ticker. An attempt already under way finishes; the link is
    /// left to the platform.
    pub async fn on_background(&self) {
        if let Some((_handle, token)) = self.ticker.lock().await.take() {
            token.cancel();
            log_info!("backgrounded; periodic sync stopped");
        }
    }

    /// Out-of-band attempt after the app recorded a session. Waits for any
    /// attempt in progress rather than being dropped.
    pub fn notify_session_recorded(&self) -> JoinHandle<Option<SyncResult>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.attempt(Trigger::SessionRecorded).await })
    }

    /// Connects if needed and runs one cycle now. `None` when there is no
    /// paired band or it could not be reached.
    pub async fn sync_now(&self) -> Option<SyncResult> {
        self.attempt(Trigger::Manual).await
    }

    async fn attempt(&self, trigger: Trigger) -> Option<SyncResult> {
        let _attempt = match trigger {
            Trigger::Timer => match self.attempt.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    log_info!("previous attempt still pending; skipping tick");
                    return None;
                }
            },
            Trigger::SessionRecorded | Trigger::Manual => self.attempt.lock().await,
        };

        let device_id = self.device.snapshot().device_id().map(str::to_owned)?;

        if self.link.connected_id().await.as_deref() != Some(device_id.as_str()) {
            if !self.link.connect(&device_id).await {
                self.device.set_connected(false).await;
                return None;
            }
            self.device.set_connected(true).await;
            self.watch_status().await;
        }

        let result = match trigger {
            Trigger::SessionRecorded => self.orchestrator.sync_after_local_session().await,
            Trigger::Timer | Trigger::Manual => self.orchestrator.perform_full_sync().await,
        };

        if !result.is_already_running() {
            self.device
                .record_sync(result.started_at, result.is_success())
                .await;
            let _ = self.results.send(result.clone());
        }
        Some(result)
    }

    /// Reads the band's phase once and then follows its notifications.
    async fn watch_status(&self) {
        let mut watch = self.status_watch.lock().await;
        if let Some(handle) = watch.take() {
            handle.abort();
        }

        match self.link.read(Characteristic::DeviceStatus).await {
            Ok(bytes) => match decode_status(&bytes) {
                Ok(status) => self.device.set_status(status).await,
                Err(err) => log_warn!("discarding status read: {err}"),
            },
            Err(err) => log_warn!("status read failed: {err}"),
        }

        let mut notifications = match self.link.subscribe(Characteristic::DeviceStatus).await {
            Ok(rx) => rx,
            Err(err) => {
                log_warn!("status subscription failed: {err}");
                return;
            }
        };

        let device = self.device.clone();
        *watch = Some(tokio::spawn(async move {
            while let Some(bytes) = notifications.recv().await {
                match decode_status(&bytes) {
                    Ok(status) => device.set_status(status).await,
                    Err(err) => log_warn!("discarding status notification: {err}"),
                }
            }
        }));
    }
}

async fn pump_link_events(
    device: DeviceStateHandle,
    status_watch: Arc<Mutex<Option<JoinHandle<()>>>>,
    mut events: broadcast::Receiver<LinkEvent>,
) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::Disconnected(id)) => {
                if device.snapshot().device_id() == Some(id.as_str()) {
                    log_info!("band {id} dropped the link");
                    if let Some(handle) = status_watch.lock().await.take() {
                        handle.abort();
                    }
                    device.set_connected(false).await;
                }
            }
            Ok(LinkEvent::Connected(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log_warn!("missed {skipped} link event(s)");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
