//! Metric names and recording helpers.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!("mesh_dfu_chunks_sent_total", "Chunks sent by BLOB clients");
    describe_counter!(
        "mesh_dfu_chunks_received_total",
        "Chunks written by BLOB servers"
    );
    describe_counter!("mesh_dfu_bytes_sent_total", "Chunk payload bytes sent");
    describe_counter!(
        "mesh_dfu_bytes_received_total",
        "Chunk payload bytes written"
    );
    describe_counter!(
        "mesh_dfu_blocks_completed_total",
        "Blocks completed by BLOB servers"
    );

    describe_counter!(
        "mesh_dfu_transfers_started_total",
        "BLOB transfers started"
    );
    describe_counter!(
        "mesh_dfu_transfers_completed_total",
        "BLOB transfers completed successfully"
    );
    describe_counter!(
        "mesh_dfu_transfers_failed_total",
        "BLOB transfers that failed or were cancelled"
    );
    describe_counter!(
        "mesh_dfu_targets_lost_total",
        "Targets dropped by BLOB clients"
    );

    describe_counter!(
        "mesh_dfu_phase_changes_total",
        "DFU server phase transitions"
    );
    describe_counter!(
        "mesh_dfu_campaigns_ended_total",
        "Distributor campaigns that reached a terminal state"
    );

    describe_gauge!(
        "mesh_dfu_active_transfers",
        "BLOB transfers currently running"
    );
    describe_gauge!(
        "mesh_dfu_receivers",
        "Receivers registered with the distributor"
    );

    describe_histogram!(
        "mesh_dfu_transfer_size_bytes",
        "Size of started BLOB transfers"
    );
}

// ============== Chunk Operations ==============

pub fn record_chunk_sent(size: usize) {
    counter!("mesh_dfu_chunks_sent_total").increment(1);
    counter!("mesh_dfu_bytes_sent_total").increment(size as u64);
}

pub fn record_chunk_received(size: usize) {
    counter!("mesh_dfu_chunks_received_total").increment(1);
    counter!("mesh_dfu_bytes_received_total").increment(size as u64);
}

pub fn record_block_complete() {
    counter!("mesh_dfu_blocks_completed_total").increment(1);
}

// ============== Transfer Operations ==============

pub fn record_transfer_started(size: u64) {
    counter!("mesh_dfu_transfers_started_total").increment(1);
    gauge!("mesh_dfu_active_transfers").increment(1.0);
    histogram!("mesh_dfu_transfer_size_bytes").record(size as f64);
}

pub fn record_transfer_complete() {
    counter!("mesh_dfu_transfers_completed_total").increment(1);
    gauge!("mesh_dfu_active_transfers").decrement(1.0);
}

pub fn record_transfer_failed(reason: &str) {
    counter!("mesh_dfu_transfers_failed_total", "reason" => reason.to_string()).increment(1);
    gauge!("mesh_dfu_active_transfers").decrement(1.0);
}

/// One transfer's share of `mesh_dfu_active_transfers`. Only a transfer
/// that was counted as started is ever counted as finished.
#[derive(Debug, Default)]
pub struct TransferGauge {
    active: bool,
}

impl TransferGauge {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn started(&mut self, size: u64) {
        if !self.active {
            self.active = true;
            record_transfer_started(size);
        }
    }

    pub fn completed(&mut self) {
        if std::mem::take(&mut self.active) {
            record_transfer_complete();
        }
    }

    pub fn failed(&mut self, reason: &str) {
        if std::mem::take(&mut self.active) {
            record_transfer_failed(reason);
        }
    }
}

pub fn record_target_lost() {
    counter!("mesh_dfu_targets_lost_total").increment(1);
}

// ============== DFU ==============

/// Record a DFU server entering `phase`.
pub fn record_dfu_phase(phase: &str) {
    counter!("mesh_dfu_phase_changes_total", "phase" => phase.to_string()).increment(1);
}

pub fn record_campaign_ended(outcome: &str) {
    counter!("mesh_dfu_campaigns_ended_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn set_active_receivers(count: usize) {
    gauge!("mesh_dfu_receivers").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        assert!(METRICS_INITIALIZED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_transfer_gauge_counts_each_transfer_once() {
        let mut gauge = TransferGauge::default();
        gauge.failed("cancelled");
        assert!(!gauge.is_active());

        gauge.started(100);
        gauge.started(100);
        assert!(gauge.is_active());
        gauge.completed();
        assert!(!gauge.is_active());
        gauge.failed("aborted");
        assert!(!gauge.is_active());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_chunk_sent(377);
        record_transfer_failed("test");
        record_dfu_phase("Verify");
    }
}
