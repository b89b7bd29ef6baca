pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::link::DiscoveredPeripheral;
use crate::protocol::DeviceStatus;

pub use state::DeviceStateHandle;

/// Identity of the paired band. Persisted until an explicit unpair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeditationDevice {
    pub id: String,
    pub name: String,
    /// Signal strength when last seen, in dBm.
    pub rssi: Option<i16>,
}

impl From<DiscoveredPeripheral> for MeditationDevice {
    fn from(peripheral: DiscoveredPeripheral) -> Self {
        Self {
            name: peripheral
                .name
                .unwrap_or_else(|| "Meditation Band".to_string()),
            id: peripheral.id,
            rssi: peripheral.rssi,
        }
    }
}

/// What the rest of the app may observe about the band.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device: Option<MeditationDevice>,
    pub is_connected: bool,
    /// Last phase the band reported; kept after a disconnect.
    pub status: Option<DeviceStatus>,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Whether the last finished cycle completed every step.
    pub last_sync_ok: Option<bool>,
}

impl DeviceSnapshot {
    pub fn is_paired(&self) -> bool {
        self.device.is_some()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device.as_ref().map(|device| device.id.as_str())
    }
}
