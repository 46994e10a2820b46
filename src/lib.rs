//! Resumable chunked BLOB transfer and firmware update distribution for
//! mesh networks.
//!
//! The state machines in [`blob`] and [`dfu`] are synchronous and driven by
//! inbound messages, transmit completions and timeouts; the [`sim`] module
//! wires them to an in-process mesh.

pub mod blob;
pub mod chunk;
pub mod config;
pub mod dfu;
pub mod metrics;
pub mod network;
pub mod settings;
pub mod sim;
