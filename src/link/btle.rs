//! Radio backend over the platform Bluetooth stack (BlueZ, CoreBluetooth,
//! WinRT) via `btleplug`.

use std::sync::Mutex;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic as GattCharacteristic, Manager as _, Peripheral as _,
    ScanFilter as PlatformScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::protocol::Characteristic;

use super::{DiscoveredPeripheral, LinkBackend, LinkError, LinkEvent, ScanFilter};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub struct BtleBackend {
    adapter: Adapter,
    events: broadcast::Sender<LinkEvent>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

fn platform_error(err: btleplug::Error) -> LinkError {
    match err {
        btleplug::Error::NotConnected => LinkError::NotConnected,
        btleplug::Error::DeviceNotFound => LinkError::UnknownPeripheral("device not found".into()),
        btleplug::Error::TimedOut(after) => LinkError::Timeout {
            operation: "gatt",
            after_ms: after.as_millis() as u64,
        },
        other => LinkError::Backend(other.to_string()),
    }
}

/// Stable string form of the platform identifier.
fn peripheral_key(id: &PeripheralId) -> String {
    format!("{id:?}")
}

impl BtleBackend {
    /// Uses the first adapter the platform reports.
    pub async fn first_adapter() -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(platform_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform_error)?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Backend("no bluetooth adapter available".into()))?;

        let (events, _) = broadcast::channel(32);
        let mut central_events = adapter.events().await.map_err(platform_error)?;
        let tx = events.clone();
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceConnected(id) => {
                        let _ = tx.send(LinkEvent::Connected(peripheral_key(&id)));
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let _ = tx.send(LinkEvent::Disconnected(peripheral_key(&id)));
                    }
                    _ => {}
                }
            }
            log_info!("bluetooth adapter event stream ended");
        });

        Ok(Self {
            adapter,
            events,
            scan_task: Mutex::new(None),
        })
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral, LinkError> {
        self.adapter
            .peripherals()
            .await
            .map_err(platform_error)?
            .into_iter()
            .find(|peripheral| peripheral_key(&peripheral.id()) == id)
            .ok_or_else(|| LinkError::UnknownPeripheral(id.to_string()))
    }

    async fn gatt_characteristic(
        &self,
        id: &str,
        characteristic: Characteristic,
    ) -> Result<(Peripheral, GattCharacteristic), LinkError> {
        let peripheral = self.peripheral(id).await?;
        if !peripheral.is_connected().await.map_err(platform_error)? {
            return Err(LinkError::NotConnected);
        }
        let gatt = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid())
            .ok_or(LinkError::MissingCharacteristic(characteristic))?;
        Ok((peripheral, gatt))
    }

    fn replace_scan_task(&self, task: Option<JoinHandle<()>>) {
        let mut guard = match self.scan_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = task;
    }
}

#[async_trait]
impl LinkBackend for BtleBackend {
    async fn start_scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredPeripheral>, LinkError> {
        let mut central_events = self
            .adapter
            .events()
            .await
            .map_err(|err| LinkError::ScanFailed(err.to_string()))?;
        self.adapter
            .start_scan(PlatformScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(|err| LinkError::ScanFailed(err.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    Ok(None) => continue,
                    Err(err) => {
                        log_warn!("failed to read advertisement properties: {err}");
                        continue;
                    }
                };
                let discovered = DiscoveredPeripheral {
                    id: peripheral_key(&id),
                    name: properties.local_name,
                    rssi: properties.rssi,
                    services: properties.services,
                };
                if tx.send(discovered).await.is_err() {
                    break;
                }
            }
        });
        self.replace_scan_task(Some(task));
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.replace_scan_task(None);
        self.adapter.stop_scan().await.map_err(platform_error)
    }

    async fn connect(&self, id: &str) -> Result<(), LinkError> {
        let peripheral = self.peripheral(id).await?;
        peripheral
            .connect()
            .await
            .map_err(|err| LinkError::ConnectFailed(err.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|err| LinkError::ConnectFailed(err.to_string()))?;
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), LinkError> {
        let peripheral = self.peripheral(id).await?;
        peripheral.disconnect().await.map_err(platform_error)
    }

    async fn read(&self, id: &str, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
        let (peripheral, gatt) = self.gatt_characteristic(id, characteristic).await?;
        peripheral.read(&gatt).await.map_err(platform_error)
    }

    async fn write(
        &self,
        id: &str,
        characteristic: Characteristic,
        value: &[u8],
    ) -> Result<(), LinkError> {
        let (peripheral, gatt) = self.gatt_characteristic(id, characteristic).await?;
        peripheral
            .write(&gatt, value, WriteType::WithResponse)
            .await
            .map_err(platform_error)
    }

    async fn subscribe(
        &self,
        id: &str,
        characteristic: Characteristic,
    ) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        let (peripheral, gatt) = self.gatt_characteristic(id, characteristic).await?;
        peripheral.subscribe(&gatt).await.map_err(platform_error)?;
        let mut notifications = peripheral.notifications().await.map_err(platform_error)?;

        let (tx, rx) = mpsc::channel(8);
        let uuid = characteristic.uuid();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}
