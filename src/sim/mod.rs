//! Deterministic in-process mesh for exercising transfers and campaigns.

pub mod network;
pub mod runner;
pub mod target;

pub use network::{DropFilter, Envelope, SimConfig, SimLink, SimNetwork, SimStats};
pub use runner::SimRunner;
pub use target::{ImageMetadata, SimApp, SimTarget, SimTargetOpts};
