use serde::{Deserialize, Serialize};

use crate::chunk::{
    chunk_size_max_for_mtu, Bitfield, Transfer, XferMode, XferModes, BLOCK_SIZE_LOG_MAX,
    BLOCK_SIZE_LOG_MIN, CHUNK_SIZE_MAX, SDU_MAX,
};
use crate::network::Addr;

/// Status codes carried in BLOB responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BlobStatus {
    Success,
    InvalidBlockNumber,
    InvalidBlockSize,
    InvalidChunkSize,
    WrongPhase,
    InvalidParam,
    WrongBlobId,
    BlobTooLarge,
    UnsupportedMode,
    Internal,
    InfoUnavailable,
}

impl BlobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, BlobStatus::Success)
    }
}

/// Phase of a BLOB server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerPhase {
    Inactive,
    WaitingForStart,
    WaitingForBlock,
    WaitingForChunk,
    Complete,
    Suspended,
    /// `resumable` is set when the received blocks are still trustworthy and
    /// the same transfer can pick up from the last completed block.
    TransferError { resumable: bool },
}

impl ServerPhase {
    /// Whether a new `recv()` must be refused.
    pub fn is_busy(&self) -> bool {
        !matches!(
            self,
            ServerPhase::Inactive | ServerPhase::Complete | ServerPhase::TransferError { .. }
        )
    }

    pub fn is_receiving(&self) -> bool {
        matches!(
            self,
            ServerPhase::WaitingForBlock | ServerPhase::WaitingForChunk
        )
    }
}

/// Chunks still missing from a block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MissingChunks {
    /// Every chunk of the block has been received.
    Complete,
    All,
    Partial(Bitfield),
}

impl MissingChunks {
    pub fn from_received(received: &Bitfield) -> Self {
        if received.is_full() {
            MissingChunks::Complete
        } else if received.none_set() {
            MissingChunks::All
        } else {
            let mut missing = Bitfield::full(received.len());
            for i in received.iter_set() {
                missing.clear(i);
            }
            MissingChunks::Partial(missing)
        }
    }

    /// Whether this report can describe a block of `chunk_count` chunks.
    pub fn fits(&self, chunk_count: u16) -> bool {
        match self {
            MissingChunks::Partial(missing) => missing.len() == chunk_count as u32,
            _ => true,
        }
    }

    /// Expand into a bitfield of missing chunks for a block of `chunk_count`.
    /// A partial report that does not fit the block counts as missing all.
    pub fn to_bitfield(&self, chunk_count: u16) -> Bitfield {
        match self {
            MissingChunks::Complete => Bitfield::new(chunk_count as u32),
            MissingChunks::All => Bitfield::full(chunk_count as u32),
            MissingChunks::Partial(missing) if self.fits(chunk_count) => missing.clone(),
            MissingChunks::Partial(_) => Bitfield::full(chunk_count as u32),
        }
    }
}

/// Transfer capabilities of a server, or the aggregate of several.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobCaps {
    pub block_size_log_min: u8,
    pub block_size_log_max: u8,
    pub max_chunks: u16,
    pub max_chunk_size: u16,
    pub max_size: u32,
    pub mtu_size: u16,
    pub modes: XferModes,
}

impl Default for BlobCaps {
    fn default() -> Self {
        Self {
            block_size_log_min: 12,
            block_size_log_max: 12,
            max_chunks: 256,
            max_chunk_size: CHUNK_SIZE_MAX,
            max_size: 4 * 1024 * 1024,
            mtu_size: SDU_MAX,
            modes: XferModes::ALL,
        }
    }
}

impl BlobCaps {
    /// Most restrictive combination of two capability sets.
    pub fn merge(&self, other: &BlobCaps) -> BlobCaps {
        BlobCaps {
            block_size_log_min: self.block_size_log_min.max(other.block_size_log_min),
            block_size_log_max: self.block_size_log_max.min(other.block_size_log_max),
            max_chunks: self.max_chunks.min(other.max_chunks),
            max_chunk_size: self.max_chunk_size.min(other.max_chunk_size),
            max_size: self.max_size.min(other.max_size),
            mtu_size: self.mtu_size.min(other.mtu_size),
            modes: self.modes.intersect(&other.modes),
        }
    }

    /// Whether any transfer at all fits these caps.
    pub fn is_usable(&self) -> bool {
        self.block_size_log_min <= self.block_size_log_max && !self.modes.is_empty()
    }

    pub fn chunk_size_limit(&self) -> u16 {
        self.max_chunk_size.min(chunk_size_max_for_mtu(self.mtu_size))
    }

    /// Validate the parameters of a transfer start.
    pub fn check_start(&self, size: u32, block_size_log: u8, mode: XferMode) -> Result<(), BlobStatus> {
        if size == 0 || size > self.max_size {
            return Err(BlobStatus::BlobTooLarge);
        }
        if block_size_log < BLOCK_SIZE_LOG_MIN
            || block_size_log > BLOCK_SIZE_LOG_MAX
            || block_size_log < self.block_size_log_min
            || block_size_log > self.block_size_log_max
        {
            return Err(BlobStatus::InvalidBlockSize);
        }
        if !self.modes.supports(mode) {
            return Err(BlobStatus::UnsupportedMode);
        }
        Ok(())
    }

    /// Validate a chunk size for blocks of `2^block_size_log` bytes.
    pub fn check_chunk_size(&self, block_size_log: u8, chunk_size: u16) -> Result<(), BlobStatus> {
        if chunk_size == 0 || chunk_size > self.chunk_size_limit() {
            return Err(BlobStatus::InvalidChunkSize);
        }
        let chunks = (1u32 << block_size_log).div_ceil(chunk_size as u32);
        if chunks > self.max_chunks as u32 {
            return Err(BlobStatus::InvalidChunkSize);
        }
        Ok(())
    }

    /// Validate a complete transfer descriptor.
    pub fn check_transfer(&self, xfer: &Transfer) -> Result<(), BlobStatus> {
        self.check_start(xfer.size, xfer.block_size_log, xfer.mode)?;
        self.check_chunk_size(xfer.block_size_log, xfer.chunk_size)
    }

    /// Largest block and chunk sizes these caps allow, for a transfer of
    /// `size` bytes in `mode`.
    pub fn transfer_for(&self, id: u64, size: u32, mode: XferMode) -> Transfer {
        let block_size_log = self.block_size_log_max;
        let by_count = (1u32 << block_size_log)
            .div_ceil(self.max_chunks.max(1) as u32)
            .min(u16::MAX as u32) as u16;
        let chunk_size = self.chunk_size_limit().max(by_count);
        Transfer::new(id, size, block_size_log, chunk_size, mode)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobSrvConfig {
    /// Local limits advertised to clients.
    pub caps: BlobCaps,

    /// Idle retransmission windows tolerated before suspending.
    pub suspend_after_windows: u32,

    /// Chunks requested per partial block report in pull mode.
    pub pull_chunks_per_report: u16,

    /// Key of the persisted progress record.
    pub settings_key: String,
}

impl Default for BlobSrvConfig {
    fn default() -> Self {
        Self {
            caps: BlobCaps::default(),
            suspend_after_windows: 3,
            pull_chunks_per_report: 8,
            settings_key: "blob_srv/0".into(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobCliConfig {
    /// Extra broadcast rounds after the first before a target times out.
    pub retries: u8,

    pub max_targets: usize,

    /// Consecutive timed-out block passes before a target is dropped.
    pub max_consecutive_timeouts: u8,

    /// Passes over one block before incomplete targets are dropped.
    pub max_block_passes: u8,

    /// Pull mode: push every missing chunk right after the block starts
    /// instead of waiting for the first partial block report.
    pub prefill_pull: bool,
}

impl Default for BlobCliConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            max_targets: 32,
            max_consecutive_timeouts: 2,
            max_block_passes: 8,
            prefill_pull: false,
        }
    }
}

/// Addressing and target set of one client procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInputs {
    pub targets: Vec<Addr>,
    /// Send each round once to this group instead of unicast per target.
    pub group: Option<Addr>,
    pub app_idx: u16,
    pub ttl: u8,
    pub timeout_base: u16,
}

impl BlobInputs {
    pub fn unicast(targets: Vec<Addr>) -> Self {
        Self {
            targets,
            group: None,
            app_idx: 0,
            ttl: 5,
            timeout_base: 10,
        }
    }
}

/// Client procedure stage, as seen in lost-target reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CliStage {
    Caps,
    XferStart,
    BlockStart,
    BlockSend,
    BlockCheck,
    XferCheck,
}

/// Why a client dropped a target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LostReason {
    /// Exhausted its retry budget without answering.
    Timeout(CliStage),
    /// Answered with an error status.
    Rejected(BlobStatus),
    /// Its capabilities cannot carry the transfer.
    Unsupported,
    /// Still missing chunks after the allowed number of block passes.
    BlockIncomplete(u16),
    /// The data sink failed for this target.
    Io,
}

/// Transfer-level phase of a client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CliPhase {
    None,
    Caps,
    Transferring,
    Suspended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_merge_is_most_restrictive() {
        let a = BlobCaps::default();
        let b = BlobCaps {
            block_size_log_min: 10,
            block_size_log_max: 13,
            max_chunks: 64,
            max_chunk_size: 200,
            max_size: 1024,
            mtu_size: 150,
            modes: XferModes::only(XferMode::Push),
        };
        let merged = a.merge(&b);
        assert_eq!(merged.block_size_log_min, 12);
        assert_eq!(merged.block_size_log_max, 12);
        assert_eq!(merged.max_chunks, 64);
        assert_eq!(merged.max_chunk_size, 200);
        assert_eq!(merged.max_size, 1024);
        assert_eq!(merged.chunk_size_limit(), 147);
        assert!(!merged.modes.supports(XferMode::Pull));
        assert!(merged.is_usable());
    }

    #[test]
    fn test_check_start() {
        let caps = BlobCaps::default();
        assert_eq!(caps.check_start(8192, 12, XferMode::Push), Ok(()));
        assert_eq!(
            caps.check_start(8192, 11, XferMode::Push),
            Err(BlobStatus::InvalidBlockSize)
        );
        assert_eq!(
            caps.check_start(u32::MAX, 12, XferMode::Push),
            Err(BlobStatus::BlobTooLarge)
        );
        let push_only = BlobCaps {
            modes: XferModes::only(XferMode::Push),
            ..caps
        };
        assert_eq!(
            push_only.check_start(10, 12, XferMode::Pull),
            Err(BlobStatus::UnsupportedMode)
        );
    }

    #[test]
    fn test_check_chunk_size() {
        let caps = BlobCaps::default();
        assert_eq!(caps.check_chunk_size(12, 377), Ok(()));
        assert_eq!(caps.check_chunk_size(12, 378), Err(BlobStatus::InvalidChunkSize));
        // 4096 / 8 = 512 chunks, over the 256 limit
        assert_eq!(caps.check_chunk_size(12, 8), Err(BlobStatus::InvalidChunkSize));
    }

    #[test]
    fn test_transfer_for_caps() {
        let xfer = BlobCaps::default().transfer_for(5, 10_000, XferMode::Pull);
        assert_eq!(xfer.block_size_log, 12);
        assert_eq!(xfer.chunk_size, 377);
        assert!(BlobCaps::default().check_transfer(&xfer).is_ok());
    }

    #[test]
    fn test_missing_chunks_from_received() {
        let mut received = Bitfield::new(4);
        assert_eq!(MissingChunks::from_received(&received), MissingChunks::All);
        received.set(0);
        received.set(2);
        let missing = MissingChunks::from_received(&received).to_bitfield(4);
        assert_eq!(missing.iter_set().collect::<Vec<_>>(), vec![1, 3]);
        received.set(1);
        received.set(3);
        assert_eq!(MissingChunks::from_received(&received), MissingChunks::Complete);
    }

    #[test]
    fn test_oversized_missing_report_does_not_fit() {
        let report = MissingChunks::Partial(Bitfield::full(64));
        assert!(!report.fits(11));
        assert!(report.fits(64));
        assert!(MissingChunks::All.fits(11));
        assert_eq!(report.to_bitfield(11), Bitfield::full(11));
    }

    #[test]
    fn test_busy_phases() {
        assert!(!ServerPhase::Inactive.is_busy());
        assert!(!ServerPhase::Complete.is_busy());
        assert!(!ServerPhase::TransferError { resumable: true }.is_busy());
        assert!(ServerPhase::WaitingForStart.is_busy());
        assert!(ServerPhase::Suspended.is_busy());
    }
}
