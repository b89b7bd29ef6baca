//! Pure encode/decode functions for every characteristic payload.
//!
//! Integers are fixed-width little-endian, records are flat UTF-8 JSON arrays
//! with no envelope. There is no version byte, so a schema change has to be
//! shipped as a new characteristic rather than a reinterpretation of these.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use super::{Characteristic, DevicePlan, DeviceSession, DeviceStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed {characteristic} payload: {reason}")]
    MalformedPayload {
        characteristic: Characteristic,
        reason: String,
    },
}

impl CodecError {
    fn malformed(characteristic: Characteristic, reason: impl Into<String>) -> Self {
        CodecError::MalformedPayload {
            characteristic,
            reason: reason.into(),
        }
    }

    pub fn characteristic(&self) -> Characteristic {
        match self {
            CodecError::MalformedPayload { characteristic, .. } => *characteristic,
        }
    }
}

pub fn encode_seconds(seconds: u32) -> Vec<u8> {
    seconds.to_le_bytes().to_vec()
}

/// Decodes either seconds field (cumulative or total).
pub fn decode_seconds(characteristic: Characteristic, bytes: &[u8]) -> Result<u32, CodecError> {
    let raw: [u8; 4] = bytes.try_into().map_err(|_| {
        CodecError::malformed(
            characteristic,
            format!("expected 4 bytes, got {}", bytes.len()),
        )
    })?;
    Ok(u32::from_le_bytes(raw))
}

pub fn encode_status(status: DeviceStatus) -> Vec<u8> {
    vec![status.ordinal()]
}

pub fn decode_status(bytes: &[u8]) -> Result<DeviceStatus, CodecError> {
    let [ordinal] = bytes else {
        return Err(CodecError::malformed(
            Characteristic::DeviceStatus,
            format!("expected 1 byte, got {}", bytes.len()),
        ));
    };
    DeviceStatus::from_ordinal(*ordinal).ok_or_else(|| {
        CodecError::malformed(
            Characteristic::DeviceStatus,
            format!("unknown status ordinal {ordinal}"),
        )
    })
}

pub fn encode_sessions(sessions: &[DeviceSession]) -> Vec<u8> {
    encode_json(sessions)
}

/// An empty characteristic value reads as an empty list: the band leaves the
/// value unset until its first refresh after boot.
pub fn decode_sessions(bytes: &[u8]) -> Result<Vec<DeviceSession>, CodecError> {
    decode_json_list(Characteristic::PendingSessions, bytes)
}

pub fn encode_plans(plans: &[DevicePlan]) -> Vec<u8> {
    encode_json(plans)
}

pub fn decode_plans(bytes: &[u8]) -> Result<Vec<DevicePlan>, CodecError> {
    decode_json_list(Characteristic::PlannedSessions, bytes)
}

pub fn encode_ack<S: AsRef<str>>(identifiers: &[S]) -> Vec<u8> {
    let ids: Vec<&str> = identifiers.iter().map(AsRef::as_ref).collect();
    encode_json(&ids)
}

pub fn decode_ack(bytes: &[u8]) -> Result<Vec<String>, CodecError> {
    decode_json_list(Characteristic::SyncAck, bytes)
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    // Plain data records with string keys; serialization cannot fail.
    serde_json::to_vec(value).unwrap_or_else(|_| b"[]".to_vec())
}

fn decode_json_list<T: DeserializeOwned>(
    characteristic: Characteristic,
    bytes: &[u8],
) -> Result<Vec<T>, CodecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| CodecError::malformed(characteristic, format!("invalid UTF-8: {err}")))?;
    let text = text.trim_end_matches('\0').trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text)
        .map_err(|err| CodecError::malformed(characteristic, format!("invalid JSON: {err}")))
}
