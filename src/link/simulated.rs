//! In-process stand-in for the band firmware.
//!
//! Reproduces what the firmware does with each characteristic: pending
//! sessions are kept until acknowledged (oldest dropped past capacity), plan
//! writes replace the stored list, total writes overwrite the counter and
//! status changes are pushed to subscribers. Faults can be injected per
//! characteristic so reconciliation can be exercised without a radio.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::protocol::{
    decode_ack, decode_plans, encode_seconds, encode_sessions, encode_status, Characteristic,
    DevicePlan, DeviceSession, DeviceStatus, SERVICE_UUID,
};

use super::{DiscoveredPeripheral, LinkBackend, LinkError, LinkEvent, ScanFilter};

/// Matches the firmware's fixed pending-session buffer.
pub const MAX_PENDING_SESSIONS: usize = 50;

#[derive(Debug, Default)]
struct BandState {
    id: String,
    name: String,
    rssi: i16,
    reachable: bool,
    connected: bool,
    scanning: Option<mpsc::Sender<DiscoveredPeripheral>>,
    advertisements_per_scan: usize,
    neighbours: Vec<DiscoveredPeripheral>,

    total_seconds: u32,
    status: DeviceStatus,
    pending: Vec<DeviceSession>,
    plans: Vec<DevicePlan>,
    status_subscribers: Vec<mpsc::Sender<Vec<u8>>>,

    latency: Option<Duration>,
    failing_reads: HashSet<Characteristic>,
    failing_writes: HashSet<Characteristic>,
    read_overrides: Vec<(Characteristic, Vec<u8>)>,
    writes: Vec<(Characteristic, Vec<u8>)>,
    operations: usize,
    connects: usize,
}

#[derive(Clone)]
pub struct SimulatedBand {
    state: Arc<Mutex<BandState>>,
    events: broadcast::Sender<LinkEvent>,
}

impl SimulatedBand {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            state: Arc::new(Mutex::new(BandState {
                id: id.into(),
                name: name.into(),
                rssi: -55,
                reachable: true,
                advertisements_per_scan: 1,
                ..BandState::default()
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BandState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    /// Mirrors the firmware finishing a session: queued for sync and added to
    /// the band's own running total.
    pub fn record_session(&self, session: DeviceSession) {
        let mut state = self.lock();
        if state.pending.len() >= MAX_PENDING_SESSIONS {
            state.pending.remove(0);
        }
        state.total_seconds = state.total_seconds.saturating_add(session.duration_seconds);
        state.pending.push(session);
    }

    pub fn set_total_seconds(&self, seconds: u32) {
        self.lock().total_seconds = seconds;
    }

    pub fn set_status(&self, status: DeviceStatus) {
        let mut state = self.lock();
        state.status = status;
        let payload = encode_status(status);
        state
            .status_subscribers
            .retain(|subscriber| subscriber.try_send(payload.clone()).is_ok());
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    pub fn set_advertisements_per_scan(&self, count: usize) {
        self.lock().advertisements_per_scan = count;
    }

    /// Another peripheral in radio range that does not run the band service.
    pub fn add_neighbour(&self, peripheral: DiscoveredPeripheral) {
        self.lock().neighbours.push(peripheral);
    }

    pub fn fail_reads_of(&self, characteristic: Characteristic) {
        self.lock().failing_reads.insert(characteristic);
    }

    pub fn fail_writes_of(&self, characteristic: Characteristic) {
        self.lock().failing_writes.insert(characteristic);
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.failing_reads.clear();
        state.failing_writes.clear();
        state.read_overrides.clear();
        state.latency = None;
    }

    /// Serves `payload` verbatim for the next reads of `characteristic`.
    pub fn override_read(&self, characteristic: Characteristic, payload: Vec<u8>) {
        let mut state = self.lock();
        state.read_overrides.retain(|(c, _)| *c != characteristic);
        state.read_overrides.push((characteristic, payload));
    }

    /// The radio link drops without the central asking.
    pub fn drop_connection(&self) {
        let id = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.status_subscribers.clear();
            state.id.clone()
        };
        let _ = self.events.send(LinkEvent::Disconnected(id));
    }

    /// The link goes away and the stack never says so; the next operation
    /// finds out.
    pub fn lose_link_silently(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.status_subscribers.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning.is_some()
    }

    pub fn pending(&self) -> Vec<DeviceSession> {
        self.lock().pending.clone()
    }

    pub fn plans(&self) -> Vec<DevicePlan> {
        self.lock().plans.clone()
    }

    pub fn total_seconds(&self) -> u32 {
        self.lock().total_seconds
    }

    /// Every payload written to `characteristic`, oldest first.
    pub fn writes_to(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Characteristic reads, writes and subscriptions served so far.
    pub fn operation_count(&self) -> usize {
        self.lock().operations
    }

    /// Connection attempts made, successful or not.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    fn advertisement(state: &BandState) -> DiscoveredPeripheral {
        DiscoveredPeripheral {
            id: state.id.clone(),
            name: Some(state.name.clone()),
            rssi: Some(state.rssi),
            services: vec![SERVICE_UUID],
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn connected_state(&self, id: &str) -> Result<MutexGuard<'_, BandState>, LinkError> {
        let state = self.lock();
        if state.id != id {
            return Err(LinkError::UnknownPeripheral(id.to_string()));
        }
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        Ok(state)
    }
}

#[async_trait]
impl LinkBackend for SimulatedBand {
    async fn start_scan(
        &self,
        _filter: &ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredPeripheral>, LinkError> {
        let mut state = self.lock();
        let capacity = state.advertisements_per_scan + state.neighbours.len() + 1;
        let (tx, rx) = mpsc::channel(capacity);

        for neighbour in &state.neighbours {
            let _ = tx.try_send(neighbour.clone());
        }
        if state.reachable {
            for _ in 0..state.advertisements_per_scan {
                let _ = tx.try_send(Self::advertisement(&state));
            }
        }

        state.scanning = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.lock().scanning = None;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), LinkError> {
        self.lock().connects += 1;
        self.simulate_latency().await;
        {
            let mut state = self.lock();
            if state.id != id {
                return Err(LinkError::UnknownPeripheral(id.to_string()));
            }
            if !state.reachable {
                return Err(LinkError::ConnectFailed(format!("{id} out of range")));
            }
            state.connected = true;
        }
        let _ = self.events.send(LinkEvent::Connected(id.to_string()));
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), LinkError> {
        let was_connected = {
            let mut state = self.lock();
            if state.id != id {
                return Err(LinkError::UnknownPeripheral(id.to_string()));
            }
            state.status_subscribers.clear();
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            let _ = self.events.send(LinkEvent::Disconnected(id.to_string()));
        }
        Ok(())
    }

    async fn read(&self, id: &str, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
        self.simulate_latency().await;
        let mut state = self.connected_state(id)?;
        state.operations += 1;

        if state.failing_reads.contains(&characteristic) {
            return Err(LinkError::Backend(format!("GATT read of {characteristic} failed")));
        }
        if let Some((_, payload)) = state
            .read_overrides
            .iter()
            .find(|(c, _)| *c == characteristic)
        {
            return Ok(payload.clone());
        }

        match characteristic {
            Characteristic::CumulativeSeconds => Ok(encode_seconds(state.total_seconds)),
            Characteristic::DeviceStatus => Ok(encode_status(state.status)),
            Characteristic::PendingSessions => Ok(encode_sessions(&state.pending)),
            other => Err(LinkError::Unsupported {
                characteristic: other,
                operation: "read",
            }),
        }
    }

    async fn write(
        &self,
        id: &str,
        characteristic: Characteristic,
        value: &[u8],
    ) -> Result<(), LinkError> {
        self.simulate_latency().await;
        let mut state = self.connected_state(id)?;
        state.operations += 1;

        if state.failing_writes.contains(&characteristic) {
            return Err(LinkError::Backend(format!("GATT write of {characteristic} failed")));
        }
        state.writes.push((characteristic, value.to_vec()));

        // Payloads the firmware cannot parse are ignored, as on the device.
        match characteristic {
            Characteristic::PlannedSessions => {
                if let Ok(plans) = decode_plans(value) {
                    state.plans = plans;
                }
            }
            Characteristic::SyncAck => {
                if let Ok(acknowledged) = decode_ack(value) {
                    state
                        .pending
                        .retain(|session| !acknowledged.contains(&session.uuid));
                }
            }
            Characteristic::TotalSeconds => {
                if let Some(raw) = value.get(..4) {
                    let mut bytes = [0u8; 4];
                    bytes.copy_from_slice(raw);
                    state.total_seconds = u32::from_le_bytes(bytes);
                }
            }
            other => {
                return Err(LinkError::Unsupported {
                    characteristic: other,
                    operation: "write",
                })
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        id: &str,
        characteristic: Characteristic,
    ) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        let mut state = self.connected_state(id)?;
        state.operations += 1;
        if characteristic != Characteristic::DeviceStatus {
            return Err(LinkError::Unsupported {
                characteristic,
                operation: "subscribe",
            });
        }
        let (tx, rx) = mpsc::channel(8);
        state.status_subscribers.push(tx);
        Ok(rx)
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}
