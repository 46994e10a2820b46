//! Metrics for BLOB transfers and DFU campaigns.
//!
//! Recorded through the `metrics` facade; the embedding application picks
//! the exporter.

pub mod recorder;

pub use recorder::{
    init_metrics, record_block_complete, record_campaign_ended, record_chunk_received,
    record_chunk_sent, record_dfu_phase, record_target_lost, record_transfer_complete,
    record_transfer_failed, record_transfer_started, set_active_receivers, TransferGauge,
};
