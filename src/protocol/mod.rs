//! GATT layout and byte encodings shared with the band firmware.
//!
//! Everything that knows the wire format lives here: the service and
//! characteristic UUIDs, the fixed-width integer fields and the JSON record
//! payloads. Nothing in this module performs I/O.

pub mod codec;
pub mod records;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use codec::{
    decode_ack, decode_plans, decode_seconds, decode_sessions, decode_status, encode_ack,
    encode_plans, encode_seconds, encode_sessions, encode_status, CodecError,
};
pub use records::{DevicePlan, DeviceSession};

/// Primary service advertised by the band.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x10000001_0000_1000_8000_00805f9b34fb);

const CUMULATIVE_SECONDS_UUID: Uuid = Uuid::from_u128(0x10000002_0000_1000_8000_00805f9b34fb);
const DEVICE_STATUS_UUID: Uuid = Uuid::from_u128(0x10000003_0000_1000_8000_00805f9b34fb);
const PENDING_SESSIONS_UUID: Uuid = Uuid::from_u128(0x10000004_0000_1000_8000_00805f9b34fb);
const PLANNED_SESSIONS_UUID: Uuid = Uuid::from_u128(0x10000005_0000_1000_8000_00805f9b34fb);
const SYNC_ACK_UUID: Uuid = Uuid::from_u128(0x10000006_0000_1000_8000_00805f9b34fb);
const TOTAL_SECONDS_UUID: Uuid = Uuid::from_u128(0x10000007_0000_1000_8000_00805f9b34fb);

/// Largest attribute value a peripheral is required to accept in one write.
pub const MAX_ATTRIBUTE_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Characteristic {
    CumulativeSeconds,
    DeviceStatus,
    PendingSessions,
    PlannedSessions,
    SyncAck,
    TotalSeconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peripheral to central.
    Read,
    /// Peripheral to central, also pushed as notifications.
    ReadNotify,
    /// Central to peripheral.
    Write,
}

impl Characteristic {
    pub const ALL: [Characteristic; 6] = [
        Characteristic::CumulativeSeconds,
        Characteristic::DeviceStatus,
        Characteristic::PendingSessions,
        Characteristic::PlannedSessions,
        Characteristic::SyncAck,
        Characteristic::TotalSeconds,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Characteristic::CumulativeSeconds => CUMULATIVE_SECONDS_UUID,
            Characteristic::DeviceStatus => DEVICE_STATUS_UUID,
            Characteristic::PendingSessions => PENDING_SESSIONS_UUID,
            Characteristic::PlannedSessions => PLANNED_SESSIONS_UUID,
            Characteristic::SyncAck => SYNC_ACK_UUID,
            Characteristic::TotalSeconds => TOTAL_SECONDS_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    pub fn direction(self) -> Direction {
        match self {
            Characteristic::CumulativeSeconds | Characteristic::PendingSessions => Direction::Read,
            Characteristic::DeviceStatus => Direction::ReadNotify,
            Characteristic::PlannedSessions
            | Characteristic::SyncAck
            | Characteristic::TotalSeconds => Direction::Write,
        }
    }

    pub fn is_readable(self) -> bool {
        matches!(self.direction(), Direction::Read | Direction::ReadNotify)
    }

    pub fn is_writable(self) -> bool {
        self.direction() == Direction::Write
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Characteristic::CumulativeSeconds => "cumulative-seconds",
            Characteristic::DeviceStatus => "device-status",
            Characteristic::PendingSessions => "pending-sessions",
            Characteristic::PlannedSessions => "planned-sessions",
            Characteristic::SyncAck => "sync-ack",
            Characteristic::TotalSeconds => "total-seconds",
        }
    }
}

impl std::fmt::Display for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase reported by the band. The discriminants are the wire ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum DeviceStatus {
    #[default]
    Idle = 0,
    /// Squeeze detected, about to start.
    Pending = 1,
    Active = 2,
    /// Session just finished; completion glow.
    Settling = 3,
}

impl DeviceStatus {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeviceStatus::Idle),
            1 => Some(DeviceStatus::Pending),
            2 => Some(DeviceStatus::Active),
            3 => Some(DeviceStatus::Settling),
            _ => None,
        }
    }
}
