//! BLOB transfer model: chunked, resumable delivery of one binary object
//! from a client to many servers.

pub mod broadcast;
pub mod client;
pub mod error;
pub mod server;
pub mod types;

pub use broadcast::{BcastStep, Broadcast, RoundOpts};
pub use client::{BlobCliHandler, BlobClient, TargetInfo};
pub use error::{BlobError, BlobResult};
pub use server::{BlobServer, BlobSrvHandler};
pub use types::{
    BlobCaps, BlobCliConfig, BlobInputs, BlobSrvConfig, BlobStatus, CliPhase, CliStage,
    LostReason, MissingChunks, ServerPhase,
};
