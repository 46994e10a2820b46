//! Typed model messages exchanged between BLOB/DFU clients and servers.

use serde::{Deserialize, Serialize};

use crate::blob::{BlobCaps, BlobStatus, MissingChunks, ServerPhase};
use crate::chunk::{Bitfield, XferMode};
use crate::dfu::{DfuEffect, DfuPhase, DfuStatus, ImageInfo};

use super::error::{NetworkError, NetworkResult};

const WIRE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Blob(BlobMessage),
    Dfu(DfuMessage),
}

/// Transfer parameters echoed in a transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferSummary {
    pub id: u64,
    pub size: u32,
    pub block_size_log: u8,
    pub mtu_size: u16,
    pub mode: XferMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XferStatus {
    pub status: BlobStatus,
    pub phase: ServerPhase,
    pub xfer: Option<XferSummary>,
    /// Blocks received so far; absent while no transfer is known.
    pub blocks: Option<Bitfield>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlobMessage {
    InfoGet,
    InfoStatus {
        caps: BlobCaps,
    },
    XferGet,
    XferStart {
        id: u64,
        size: u32,
        block_size_log: u8,
        mtu_size: u16,
        mode: XferMode,
    },
    XferCancel {
        id: u64,
    },
    XferStatus(XferStatus),
    BlockGet,
    BlockStart {
        block: u16,
        chunk_size: u16,
    },
    ChunkTransfer {
        chunk: u16,
        data: Vec<u8>,
    },
    BlockStatus {
        status: BlobStatus,
        block: u16,
        chunk_size: u16,
        missing: MissingChunks,
    },
    /// Pull mode: chunks the server wants next. Empty means the block is done.
    PartialBlockReport {
        chunks: Vec<u16>,
    },
}

/// Parameters of the update a server is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub ttl: u8,
    pub timeout_base: u16,
    pub blob_id: u64,
    pub index: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub status: DfuStatus,
    pub phase: DfuPhase,
    pub effect: DfuEffect,
    pub update: Option<UpdateInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DfuMessage {
    UpdateInfoGet {
        first: u8,
        limit: u8,
    },
    UpdateInfoStatus {
        total: u8,
        first: u8,
        images: Vec<ImageInfo>,
    },
    UpdateMetadataCheck {
        index: u8,
        metadata: Vec<u8>,
    },
    UpdateMetadataStatus {
        status: DfuStatus,
        effect: DfuEffect,
        index: u8,
    },
    UpdateGet,
    UpdateStart {
        ttl: u8,
        timeout_base: u16,
        blob_id: u64,
        index: u8,
        metadata: Vec<u8>,
    },
    UpdateCancel,
    UpdateApply,
    UpdateStatus(UpdateStatus),
}

impl Message {
    /// Short opcode name, for logs and simulation filters.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Blob(m) => match m {
                BlobMessage::InfoGet => "blob_info_get",
                BlobMessage::InfoStatus { .. } => "blob_info_status",
                BlobMessage::XferGet => "blob_xfer_get",
                BlobMessage::XferStart { .. } => "blob_xfer_start",
                BlobMessage::XferCancel { .. } => "blob_xfer_cancel",
                BlobMessage::XferStatus(_) => "blob_xfer_status",
                BlobMessage::BlockGet => "blob_block_get",
                BlobMessage::BlockStart { .. } => "blob_block_start",
                BlobMessage::ChunkTransfer { .. } => "blob_chunk",
                BlobMessage::BlockStatus { .. } => "blob_block_status",
                BlobMessage::PartialBlockReport { .. } => "blob_partial_block_report",
            },
            Message::Dfu(m) => match m {
                DfuMessage::UpdateInfoGet { .. } => "dfu_info_get",
                DfuMessage::UpdateInfoStatus { .. } => "dfu_info_status",
                DfuMessage::UpdateMetadataCheck { .. } => "dfu_metadata_check",
                DfuMessage::UpdateMetadataStatus { .. } => "dfu_metadata_status",
                DfuMessage::UpdateGet => "dfu_update_get",
                DfuMessage::UpdateStart { .. } => "dfu_update_start",
                DfuMessage::UpdateCancel => "dfu_update_cancel",
                DfuMessage::UpdateApply => "dfu_update_apply",
                DfuMessage::UpdateStatus(_) => "dfu_update_status",
            },
        }
    }

    pub fn encode(&self) -> NetworkResult<Vec<u8>> {
        let mut buf = vec![WIRE_VERSION];
        buf.extend(bincode::serialize(self)?);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> NetworkResult<Self> {
        match bytes.split_first() {
            Some((&WIRE_VERSION, body)) => Ok(bincode::deserialize(body)?),
            Some((&version, _)) => Err(NetworkError::UnsupportedVersion(version)),
            None => Err(NetworkError::SerializationError("empty payload".into())),
        }
    }
}

impl From<BlobMessage> for Message {
    fn from(msg: BlobMessage) -> Self {
        Message::Blob(msg)
    }
}

impl From<DfuMessage> for Message {
    fn from(msg: DfuMessage) -> Self {
        Message::Dfu(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_message_survives_codec() {
        let msg = Message::Blob(BlobMessage::ChunkTransfer {
            chunk: 4,
            data: vec![1, 2, 3, 4, 5],
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = Message::Blob(BlobMessage::XferGet).encode().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            Message::decode(&bytes),
            Err(NetworkError::UnsupportedVersion(9))
        ));
        assert!(Message::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_bitfield_with_wrong_length() {
        let msg = Message::Blob(BlobMessage::BlockStatus {
            status: BlobStatus::Success,
            block: 0,
            chunk_size: 377,
            missing: MissingChunks::Partial(Bitfield::new(0)),
        });
        let mut bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);

        // The field's bit count sits just before its (empty) byte vector.
        let n = bytes.len();
        bytes[n - 12..n - 8].copy_from_slice(&64u32.to_le_bytes());
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn test_names() {
        assert_eq!(Message::Dfu(DfuMessage::UpdateGet).name(), "dfu_update_get");
        assert_eq!(
            Message::from(BlobMessage::BlockGet).name(),
            "blob_block_get"
        );
    }
}
