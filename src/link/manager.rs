use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, RwLock},
    time,
};

use crate::protocol::{Characteristic, Direction};
use crate::settings::SyncSettings;

use super::{DiscoveredPeripheral, LinkBackend, LinkError, LinkEvent, ScanFilter};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const EVENT_CAPACITY: usize = 32;
const SCAN_CHANNEL_CAPACITY: usize = 16;

/// Identifier-addressed access to one peripheral at a time.
///
/// Cloning is cheap and every clone shares the same connection slot. The
/// manager never reconnects on its own; a dropped link shows up as a
/// [`LinkEvent::Disconnected`] and the next caller decides what to do.
#[derive(Clone)]
pub struct LinkManager {
    backend: Arc<dyn LinkBackend>,
    connected: Arc<RwLock<Option<String>>>,
    events: broadcast::Sender<LinkEvent>,
    op_timeout: Duration,
    scan_window: Duration,
}

impl LinkManager {
    /// Must be called from inside a tokio runtime; a task is spawned to track
    /// connection drops reported by the backend.
    pub fn new(backend: Arc<dyn LinkBackend>, op_timeout: Duration, scan_window: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connected = Arc::new(RwLock::new(None));

        tokio::spawn(track_connection(
            backend.events(),
            connected.clone(),
            events.clone(),
        ));

        Self {
            backend,
            connected,
            events,
            op_timeout,
            scan_window,
        }
    }

    pub fn from_settings(backend: Arc<dyn LinkBackend>, settings: &SyncSettings) -> Self {
        Self::new(backend, settings.link_timeout(), settings.scan_window())
    }

    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub async fn connected_id(&self) -> Option<String> {
        self.connected.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.connected.read().await.is_some()
    }

    /// Discovers bands for one scan window. Only peripherals advertising the
    /// band service are yielded, each at most once; the channel closes when
    /// the window ends.
    pub async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredPeripheral>, LinkError> {
        let filter = filter.with_band_service();
        let mut advertisements = self
            .bounded("scan", self.backend.start_scan(&filter))
            .await?;

        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let backend = self.backend.clone();
        let window = self.scan_window;

        tokio::spawn(async move {
            let deadline = time::sleep(window);
            tokio::pin!(deadline);
            let mut seen = HashSet::new();

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    next = advertisements.recv() => match next {
                        Some(peripheral) => {
                            if !filter.matches(&peripheral) || !seen.insert(peripheral.id.clone()) {
                                continue;
                            }
                            if tx.send(peripheral).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }

            if let Err(err) = backend.stop_scan().await {
                log_warn!("failed to stop scan: {err}");
            }
        });

        Ok(rx)
    }

    /// Connects to `id`, dropping any other peripheral first. Failures are
    /// logged and reported as `false`.
    pub async fn connect(&self, id: &str) -> bool {
        match self.try_connect(id).await {
            Ok(()) => true,
            Err(err) => {
                log_warn!("connect to {id} failed: {err}");
                false
            }
        }
    }

    pub async fn try_connect(&self, id: &str) -> Result<(), LinkError> {
        let current = self.connected_id().await;
        match current {
            Some(current) if current == id => return Ok(()),
            Some(other) => self.disconnect(&other).await,
            None => {}
        }

        self.bounded("connect", self.backend.connect(id)).await?;
        *self.connected.write().await = Some(id.to_string());
        log_info!("connected to {id}");
        Ok(())
    }

    pub async fn disconnect(&self, id: &str) {
        if let Err(err) = self.bounded("disconnect", self.backend.disconnect(id)).await {
            log_warn!("disconnect from {id} failed: {err}");
        }
        self.clear_slot(id).await;
    }

    pub async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
        if !characteristic.is_readable() {
            return Err(LinkError::Unsupported {
                characteristic,
                operation: "read",
            });
        }
        let id = self.require_connected().await?;
        let result = self
            .bounded("read", self.backend.read(&id, characteristic))
            .await;
        self.observe(&id, &result).await;
        result
    }

    pub async fn write(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), LinkError> {
        if !characteristic.is_writable() {
            return Err(LinkError::Unsupported {
                characteristic,
                operation: "write",
            });
        }
        let id = self.require_connected().await?;
        let result = self
            .bounded("write", self.backend.write(&id, characteristic, value))
            .await;
        self.observe(&id, &result).await;
        result
    }

    pub async fn subscribe(
        &self,
        characteristic: Characteristic,
    ) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        if characteristic.direction() != Direction::ReadNotify {
            return Err(LinkError::Unsupported {
                characteristic,
                operation: "subscribe",
            });
        }
        let id = self.require_connected().await?;
        let result = self
            .bounded("subscribe", self.backend.subscribe(&id, characteristic))
            .await;
        self.observe(&id, &result).await;
        result
    }

    async fn require_connected(&self) -> Result<String, LinkError> {
        self.connected_id().await.ok_or(LinkError::NotConnected)
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, LinkError>
    where
        F: Future<Output = Result<T, LinkError>>,
    {
        match time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout {
                operation,
                after_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }

    async fn observe<T>(&self, id: &str, result: &Result<T, LinkError>) {
        if let Err(err) = result {
            if err.is_connection_loss() {
                log_warn!("link to {id} lost: {err}");
                // The backend may never report this drop itself.
                if self.clear_slot(id).await {
                    let _ = self.events.send(LinkEvent::Disconnected(id.to_string()));
                }
            }
        }
    }

    /// Returns whether `id` held the slot.
    async fn clear_slot(&self, id: &str) -> bool {
        let mut slot = self.connected.write().await;
        if slot.as_deref() == Some(id) {
            *slot = None;
            return true;
        }
        false
    }
}

impl ScanFilter {
    fn with_band_service(mut self) -> Self {
        if !self.services.contains(&crate::protocol::SERVICE_UUID) {
            self.services.push(crate::protocol::SERVICE_UUID);
        }
        self
    }
}

async fn track_connection(
    mut backend_events: broadcast::Receiver<LinkEvent>,
    connected: Arc<RwLock<Option<String>>>,
    events: broadcast::Sender<LinkEvent>,
) {
    loop {
        match backend_events.recv().await {
            Ok(event) => {
                if let LinkEvent::Disconnected(id) = &event {
                    let mut slot = connected.write().await;
                    if slot.as_deref() == Some(id.as_str()) {
                        *slot = None;
                        log_info!("peripheral {id} disconnected");
                    }
                }
                let _ = events.send(event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log_warn!("link event stream lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
