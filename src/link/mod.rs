//! Physical half of the band connection.
//!
//! ```text
//! SyncOrchestrator / SyncScheduler
//!            │
//!            ▼
//!      LinkManager ── timeouts, scan de-dup, connected-peripheral slot
//!            │
//!            ▼
//!   dyn LinkBackend ── SimulatedBand | BtleBackend (feature "btleplug")
//! ```
//!
//! The manager only moves bytes for a [`Characteristic`]; it has no idea what
//! a session or a plan is.

#[cfg(feature = "btleplug")]
pub mod btle;
pub mod manager;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::protocol::{Characteristic, SERVICE_UUID};

pub use manager::LinkManager;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("no peripheral connected")]
    NotConnected,
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("unknown peripheral {0}")]
    UnknownPeripheral(String),
    #[error("{characteristic} does not support {operation}")]
    Unsupported {
        characteristic: Characteristic,
        operation: &'static str,
    },
    #[error("characteristic {0} not found on peripheral")]
    MissingCharacteristic(Characteristic),
    #[error("bluetooth adapter error: {0}")]
    Backend(String),
}

impl LinkError {
    /// Whether the failure says the peripheral is gone rather than that one
    /// operation misbehaved.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, LinkError::NotConnected | LinkError::UnknownPeripheral(_))
    }
}

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            services: vec![SERVICE_UUID],
        }
    }
}

impl ScanFilter {
    pub fn matches(&self, peripheral: &DiscoveredPeripheral) -> bool {
        self.services
            .iter()
            .all(|service| peripheral.services.contains(service))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(String),
    Disconnected(String),
}

/// Platform side of the link. Implementations address peripherals by the
/// opaque identifier they reported while scanning.
#[async_trait]
pub trait LinkBackend: Send + Sync {
    /// Starts discovery. Advertisements arrive on the returned channel until
    /// [`LinkBackend::stop_scan`] is called.
    async fn start_scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredPeripheral>, LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    async fn connect(&self, id: &str) -> Result<(), LinkError>;

    async fn disconnect(&self, id: &str) -> Result<(), LinkError>;

    async fn read(&self, id: &str, characteristic: Characteristic) -> Result<Vec<u8>, LinkError>;

    async fn write(
        &self,
        id: &str,
        characteristic: Characteristic,
        value: &[u8],
    ) -> Result<(), LinkError>;

    async fn subscribe(
        &self,
        id: &str,
        characteristic: Characteristic,
    ) -> Result<mpsc::Receiver<Vec<u8>>, LinkError>;

    /// Connection lifecycle events, including drops the central did not ask for.
    fn events(&self) -> broadcast::Receiver<LinkEvent>;
}
