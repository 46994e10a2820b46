//! Firmware update layer: DFU server and client around BLOB transfers,
//! the distributor's slot store and campaign façade.

pub mod client;
pub mod distributor;
pub mod error;
pub mod server;
pub mod slot;
pub mod types;

pub use client::{DfuCliHandler, DfuClient};
pub use distributor::{
    CampaignObserver, CampaignParams, CampaignReport, DistPhase, Distributor, ReceiverStatus,
};
pub use error::{DfuError, DfuResult};
pub use server::{DfuServer, DfuSrvHandler};
pub use slot::{Slot, SlotInfo, SlotStore};
pub use types::{
    BlobParams, DfuCliConfig, DfuEffect, DfuImage, DfuInputs, DfuPhase, DfuSendOpts, DfuSrvConfig,
    DfuStage, DfuStatus, DfuTarget, DfuTargetSpec, DistributorConfig, EndReason, ImageInfo,
    TargetFailure, UpdatePolicy,
};
