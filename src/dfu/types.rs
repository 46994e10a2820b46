use serde::{Deserialize, Serialize};

use crate::blob::{BlobCliConfig, BlobSrvConfig, LostReason};
use crate::chunk::XferMode;
use crate::network::Addr;

/// Firmware update phase of a server, also tracked per target by clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DfuPhase {
    #[default]
    Idle,
    /// The BLOB transfer failed. `resumable` when an identical start may
    /// pick it up where it stopped.
    TransferError { resumable: bool },
    TransferActive,
    Verify,
    VerifyOk,
    VerifyFail,
    Applying,
    ApplySuccess,
    ApplyFail,
    Unknown,
}

impl DfuPhase {
    pub fn name(&self) -> &'static str {
        match self {
            DfuPhase::Idle => "idle",
            DfuPhase::TransferError { .. } => "transfer_error",
            DfuPhase::TransferActive => "transfer_active",
            DfuPhase::Verify => "verify",
            DfuPhase::VerifyOk => "verify_ok",
            DfuPhase::VerifyFail => "verify_fail",
            DfuPhase::Applying => "applying",
            DfuPhase::ApplySuccess => "apply_success",
            DfuPhase::ApplyFail => "apply_fail",
            DfuPhase::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DfuStatus {
    Success,
    Resources,
    WrongPhase,
    Internal,
    /// No image at the requested index.
    FwIndex,
    /// The metadata check rejected the image.
    Metadata,
    TemporarilyUnavailable,
    BlobXferBusy,
}

impl DfuStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, DfuStatus::Success)
    }
}

/// Consequence of applying an image, declared by the metadata check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DfuEffect {
    #[default]
    None,
    CompositionChanged {
        /// The node can be re-provisioned to pick up the new composition.
        reprovision: bool,
    },
    /// The node unprovisions itself once the image is applied.
    Unprovision,
}

/// One firmware image installed on a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    pub fwid: Vec<u8>,
    pub uri: String,
}

/// Client stage, as reported in target failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DfuStage {
    Caps,
    Start,
    Transfer,
    Refresh,
    Apply,
    Confirm,
    Cancel,
    MetadataCheck,
}

/// Why a target dropped out of a campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetFailure {
    Timeout(DfuStage),
    Rejected(DfuStatus),
    Blob(LostReason),
    VerifyFailed,
    ApplyFailed,
}

/// How a campaign ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EndReason {
    /// At least one target took the update.
    Success,
    AllTargetsLost,
    Canceled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Stop after verification and wait for an explicit apply.
    VerifyOnly,
    #[default]
    VerifyAndApply,
}

/// Image pushed by a DFU client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuImage {
    pub fwid: Vec<u8>,
    pub metadata: Vec<u8>,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DfuTargetSpec {
    pub addr: Addr,
    /// Index of the image to replace on the target.
    pub image_index: u8,
}

/// Targets and addressing of one DFU procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfuInputs {
    pub targets: Vec<DfuTargetSpec>,
    pub group: Option<Addr>,
    pub app_idx: u16,
    pub ttl: u8,
    pub timeout_base: u16,
}

/// Explicit BLOB parameters; skips the capabilities round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobParams {
    pub block_size_log: u8,
    pub chunk_size: u16,
}

/// Options of one DFU transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DfuSendOpts {
    pub policy: UpdatePolicy,
    pub mode: XferMode,
    pub blob_params: Option<BlobParams>,
    /// Transfer ID; random when unset.
    pub blob_id: Option<u64>,
}

impl Default for DfuSendOpts {
    fn default() -> Self {
        Self {
            policy: UpdatePolicy::VerifyAndApply,
            mode: XferMode::Push,
            blob_params: None,
            blob_id: None,
        }
    }
}

/// Client-side view of one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DfuTarget {
    pub addr: Addr,
    pub image_index: u8,
    pub phase: DfuPhase,
    pub status: DfuStatus,
    pub effect: DfuEffect,
    pub failure: Option<TargetFailure>,
}

impl DfuTarget {
    pub fn new(spec: DfuTargetSpec) -> Self {
        Self {
            addr: spec.addr,
            image_index: spec.image_index,
            phase: DfuPhase::Unknown,
            status: DfuStatus::Success,
            effect: DfuEffect::None,
            failure: None,
        }
    }

    pub fn active(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfuSrvConfig {
    pub blob: BlobSrvConfig,
    /// Key of the persisted update record.
    pub settings_key: String,
}

impl Default for DfuSrvConfig {
    fn default() -> Self {
        Self {
            blob: BlobSrvConfig::default(),
            settings_key: "dfu_srv/0".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfuCliConfig {
    pub blob: BlobCliConfig,
    /// Update-Get rounds spent waiting for verification before a target
    /// is dropped.
    pub max_refresh_polls: u8,
}

impl Default for DfuCliConfig {
    fn default() -> Self {
        Self {
            blob: BlobCliConfig::default(),
            max_refresh_polls: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    pub max_receivers: usize,
    pub slot_capacity: usize,
    pub client: DfuCliConfig,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            max_receivers: 16,
            slot_capacity: 4,
            client: DfuCliConfig::default(),
        }
    }
}
