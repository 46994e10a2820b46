//! Persisted record layouts.
//!
//! Records are decoupled from the in-memory state machines and encoded as
//! `[version] ++ bincode(record)` with bincode's fixed-width little-endian
//! integers, so a layout change means a version bump, not a silent misread.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::blob::ServerPhase;
use crate::chunk::{Bitfield, Transfer};
use crate::dfu::{DfuEffect, DfuPhase};
use crate::network::Addr;

use super::error::{SettingsError, SettingsResult};

pub const RECORD_VERSION: u8 = 1;

/// BLOB server progress, written on every phase change and block completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedXfer {
    pub transfer_id: u64,
    pub ttl: u8,
    pub timeout_base: u16,
    pub mtu_size: u16,
    pub client: Addr,
    pub app_idx: u16,
    /// Transfer shape; `chunk_size` is zero until the first block starts.
    pub xfer: Transfer,
    pub blocks: Bitfield,
    pub phase: ServerPhase,
}

/// DFU server update record, written on every DFU phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedUpdate {
    pub phase: DfuPhase,
    pub image_index: u8,
    pub ttl: u8,
    pub timeout_base: u16,
    pub blob_id: u64,
    pub metadata_hash: [u8; 32],
    pub effect: DfuEffect,
}

pub fn encode_record<T: Serialize>(record: &T) -> SettingsResult<Vec<u8>> {
    let mut buf = vec![RECORD_VERSION];
    buf.extend(bincode::serialize(record)?);
    Ok(buf)
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> SettingsResult<T> {
    match bytes.split_first() {
        Some((&RECORD_VERSION, body)) => Ok(bincode::deserialize(body)?),
        Some((&version, _)) => Err(SettingsError::UnsupportedVersion(version)),
        None => Err(SettingsError::SerializationError("empty record".into())),
    }
}
