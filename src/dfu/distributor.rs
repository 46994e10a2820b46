//! Campaign façade: slot and receiver administration on top of a
//! [`DfuClient`], with a shared per-receiver status table.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::chunk::{MemorySink, XferMode};
use crate::metrics;
use crate::network::{Addr, Message, RecvCtx, Transport};

use super::client::{DfuCliHandler, DfuClient};
use super::error::{DfuError, DfuResult};
use super::slot::SlotStore;
use super::types::{
    DfuEffect, DfuInputs, DfuPhase, DfuSendOpts, DfuStatus, DfuTargetSpec, DistributorConfig,
    EndReason, TargetFailure, UpdatePolicy,
};

/// Campaign-level phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistPhase {
    Idle,
    TransferActive,
    /// Verified everywhere; a verify-only campaign waits for `apply()`.
    TransferSuccess,
    TransferSuspended,
    ApplyActive,
    Completed,
    Canceling,
    Failed,
}

impl DistPhase {
    /// A campaign is running and the receiver list is locked.
    pub fn is_busy(&self) -> bool {
        !matches!(self, DistPhase::Idle | DistPhase::Completed | DistPhase::Failed)
    }
}

/// One row of the receiver table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverStatus {
    pub addr: Addr,
    pub image_index: u8,
    pub phase: DfuPhase,
    pub status: DfuStatus,
    pub effect: DfuEffect,
    pub failure: Option<TargetFailure>,
    pub progress: u8,
    /// Unix timestamp of the last change.
    pub updated_at: i64,
}

impl ReceiverStatus {
    fn new(addr: Addr, image_index: u8) -> Self {
        Self {
            addr,
            image_index,
            phase: DfuPhase::Unknown,
            status: DfuStatus::Success,
            effect: DfuEffect::None,
            failure: None,
            progress: 0,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignParams {
    pub slot_idx: usize,
    pub group: Option<Addr>,
    pub app_idx: u16,
    pub ttl: u8,
    pub timeout_base: u16,
    pub policy: UpdatePolicy,
    pub mode: XferMode,
}

impl CampaignParams {
    pub fn new(slot_idx: usize) -> Self {
        Self {
            slot_idx,
            group: None,
            app_idx: 0,
            ttl: 5,
            timeout_base: 10,
            policy: UpdatePolicy::VerifyAndApply,
            mode: XferMode::Push,
        }
    }
}

/// Terminal outcome of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub reason: EndReason,
    pub phase: DistPhase,
    pub slot_idx: usize,
    pub receivers: Vec<ReceiverStatus>,
}

pub trait CampaignObserver: Send + Sync {
    fn campaign_ended(&self, report: &CampaignReport);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DistEvent {
    Lost(Addr, TargetFailure),
    Suspended,
    Progress(u8),
    Verified,
    ApplyStarted,
    Ended(EndReason),
}

#[derive(Default)]
struct DistEventQueue {
    events: Vec<DistEvent>,
}

impl DfuCliHandler for DistEventQueue {
    fn lost_target(&mut self, addr: Addr, failure: TargetFailure) {
        self.events.push(DistEvent::Lost(addr, failure));
    }

    fn suspended(&mut self) {
        self.events.push(DistEvent::Suspended);
    }

    fn transfer_progress(&mut self, progress: u8) {
        self.events.push(DistEvent::Progress(progress));
    }

    fn verified(&mut self) {
        self.events.push(DistEvent::Verified);
    }

    fn apply_started(&mut self) {
        self.events.push(DistEvent::ApplyStarted);
    }

    fn ended(&mut self, reason: EndReason) {
        self.events.push(DistEvent::Ended(reason));
    }
}

pub struct Distributor {
    config: DistributorConfig,
    slots: Arc<RwLock<SlotStore>>,
    receivers: Arc<DashMap<Addr, ReceiverStatus>>,
    client: DfuClient<DistEventQueue>,
    phase: DistPhase,
    phase_tx: watch::Sender<DistPhase>,
    params: Option<CampaignParams>,
    observer: Option<Arc<dyn CampaignObserver>>,
    last_report: Option<CampaignReport>,
}

impl Distributor {
    pub fn new(config: DistributorConfig, transport: Arc<dyn Transport>) -> Self {
        let client = DfuClient::new(config.client.clone(), transport, DistEventQueue::default());
        let (phase_tx, _) = watch::channel(DistPhase::Idle);
        Self {
            slots: Arc::new(RwLock::new(SlotStore::new(config.slot_capacity))),
            receivers: Arc::new(DashMap::new()),
            config,
            client,
            phase: DistPhase::Idle,
            phase_tx,
            params: None,
            observer: None,
            last_report: None,
        }
    }

    pub fn phase(&self) -> DistPhase {
        self.phase
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<DistPhase> {
        self.phase_tx.subscribe()
    }

    pub fn set_observer(&mut self, observer: Arc<dyn CampaignObserver>) {
        self.observer = Some(observer);
    }

    pub fn last_report(&self) -> Option<&CampaignReport> {
        self.last_report.as_ref()
    }

    pub fn slots(&self) -> Arc<RwLock<SlotStore>> {
        self.slots.clone()
    }

    /// Reserve a slot and commit `data` to it in one step.
    pub fn add_slot(&self, fwid: Vec<u8>, metadata: Vec<u8>, uri: String, data: Bytes) -> DfuResult<usize> {
        let mut slots = self.slots.write();
        let index = slots.add(fwid, metadata, uri, data.len() as u32)?;
        if let Err(e) = slots.commit(index, data) {
            slots.delete(index)?;
            return Err(e);
        }
        Ok(index)
    }

    /// Live receiver table, shared with operator readers.
    pub fn receiver_table(&self) -> Arc<DashMap<Addr, ReceiverStatus>> {
        self.receivers.clone()
    }

    pub fn receivers_add(&mut self, addr: Addr, image_index: u8) -> DfuResult<()> {
        if self.phase.is_busy() {
            return Err(DfuError::Busy);
        }
        if !self.receivers.contains_key(&addr) && self.receivers.len() >= self.config.max_receivers {
            return Err(DfuError::TooManyTargets(self.config.max_receivers));
        }
        self.receivers
            .insert(addr, ReceiverStatus::new(addr, image_index));
        metrics::set_active_receivers(self.receivers.len());
        Ok(())
    }

    pub fn receivers_delete_all(&mut self) -> DfuResult<()> {
        if self.phase.is_busy() {
            return Err(DfuError::Busy);
        }
        self.receivers.clear();
        metrics::set_active_receivers(0);
        Ok(())
    }

    /// Snapshot of the receiver table, sorted by address.
    pub fn receivers(&self) -> Vec<ReceiverStatus> {
        let mut rows: Vec<ReceiverStatus> = self.receivers.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|r| r.addr);
        rows
    }

    /// Start distributing the image in `params.slot_idx` to every receiver.
    pub fn start(&mut self, params: CampaignParams) -> DfuResult<()> {
        if self.phase.is_busy() {
            return Err(DfuError::Busy);
        }
        if self.receivers.is_empty() {
            return Err(DfuError::NoTargets);
        }
        let (image, data) = self.slots.read().image(params.slot_idx)?;

        let targets: Vec<DfuTargetSpec> = self
            .receivers()
            .into_iter()
            .map(|r| DfuTargetSpec {
                addr: r.addr,
                image_index: r.image_index,
            })
            .collect();
        for mut row in self.receivers.iter_mut() {
            let (addr, image_index) = (row.addr, row.image_index);
            *row = ReceiverStatus::new(addr, image_index);
        }

        let inputs = DfuInputs {
            targets,
            group: params.group,
            app_idx: params.app_idx,
            ttl: params.ttl,
            timeout_base: params.timeout_base,
        };
        let opts = DfuSendOpts {
            policy: params.policy,
            mode: params.mode,
            blob_params: None,
            blob_id: None,
        };
        tracing::info!(
            slot = params.slot_idx,
            receivers = inputs.targets.len(),
            policy = ?params.policy,
            "Starting distribution"
        );
        self.client
            .send(inputs, image, Box::new(MemorySink::from_bytes(data)), opts)?;
        self.params = Some(params);
        self.last_report = None;
        self.set_phase(DistPhase::TransferActive);
        self.drain_events();
        Ok(())
    }

    /// Apply the image of a verify-only campaign.
    pub fn apply(&mut self) -> DfuResult<()> {
        if self.phase != DistPhase::TransferSuccess {
            return Err(DfuError::InvalidState(format!(
                "cannot apply in phase {:?}",
                self.phase
            )));
        }
        self.client.apply()?;
        self.drain_events();
        Ok(())
    }

    pub fn cancel(&mut self) -> DfuResult<()> {
        if !self.phase.is_busy() {
            return Err(DfuError::InvalidState("no campaign to cancel".into()));
        }
        self.client.cancel()?;
        self.set_phase(DistPhase::Canceling);
        self.drain_events();
        Ok(())
    }

    pub fn resume(&mut self) -> DfuResult<()> {
        if self.phase != DistPhase::TransferSuspended {
            return Err(DfuError::InvalidState("campaign is not suspended".into()));
        }
        self.client.resume()?;
        self.set_phase(DistPhase::TransferActive);
        self.drain_events();
        Ok(())
    }

    pub fn tx_complete(&mut self) {
        self.client.tx_complete();
        self.drain_events();
    }

    pub fn retry_timeout(&mut self) {
        self.client.retry_timeout();
        self.drain_events();
    }

    pub fn handle_message(&mut self, ctx: &RecvCtx, msg: &Message) {
        self.client.handle_message(ctx, msg);
        self.drain_events();
    }

    fn drain_events(&mut self) {
        let events = std::mem::take(&mut self.client.handler_mut().events);
        if events.is_empty() {
            return;
        }
        for event in events {
            match event {
                DistEvent::Lost(addr, failure) => {
                    tracing::info!(addr, ?failure, "Receiver dropped out");
                }
                DistEvent::Suspended => self.set_phase(DistPhase::TransferSuspended),
                DistEvent::Progress(progress) => {
                    for mut row in self.receivers.iter_mut().filter(|r| r.failure.is_none()) {
                        row.progress = progress;
                    }
                }
                DistEvent::Verified => self.set_phase(DistPhase::TransferSuccess),
                DistEvent::ApplyStarted => self.set_phase(DistPhase::ApplyActive),
                DistEvent::Ended(reason) => {
                    self.sync_receivers();
                    self.ended(reason);
                }
            }
        }
        self.sync_receivers();
    }

    /// Copy the client's per-target records into the receiver table.
    fn sync_receivers(&self) {
        let now = chrono::Utc::now().timestamp();
        for target in self.client.targets() {
            let Some(mut row) = self.receivers.get_mut(&target.addr) else {
                continue;
            };
            let changed = row.phase != target.phase
                || row.status != target.status
                || row.effect != target.effect
                || row.failure != target.failure;
            if changed {
                row.phase = target.phase;
                row.status = target.status;
                row.effect = target.effect;
                row.failure = target.failure;
                row.updated_at = now;
            }
        }
    }

    fn ended(&mut self, reason: EndReason) {
        let phase = match reason {
            EndReason::Success => DistPhase::Completed,
            EndReason::AllTargetsLost => DistPhase::Failed,
            EndReason::Canceled => DistPhase::Idle,
        };
        self.set_phase(phase);

        let report = CampaignReport {
            reason,
            phase,
            slot_idx: self.params.map(|p| p.slot_idx).unwrap_or(0),
            receivers: self.receivers(),
        };
        let outcome = match reason {
            EndReason::Success => "success",
            EndReason::AllTargetsLost => "failed",
            EndReason::Canceled => "canceled",
        };
        tracing::info!(?reason, receivers = report.receivers.len(), "Distribution ended");
        metrics::record_campaign_ended(outcome);
        if let Some(observer) = self.observer.as_ref() {
            observer.campaign_ended(&report);
        }
        self.last_report = Some(report);
    }

    fn set_phase(&mut self, phase: DistPhase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "Distributor phase");
        }
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::RecordingTransport;

    fn distributor(max_receivers: usize) -> Distributor {
        let config = DistributorConfig {
            max_receivers,
            ..DistributorConfig::default()
        };
        Distributor::new(config, Arc::new(RecordingTransport::new()))
    }

    #[test]
    fn test_receiver_capacity() {
        let mut dist = distributor(2);
        dist.receivers_add(0x0102, 0).unwrap();
        dist.receivers_add(0x0101, 1).unwrap();
        // re-adding an existing receiver only updates it
        dist.receivers_add(0x0101, 0).unwrap();
        assert!(matches!(
            dist.receivers_add(0x0103, 0),
            Err(DfuError::TooManyTargets(2))
        ));
        let rows = dist.receivers();
        assert_eq!(rows.iter().map(|r| r.addr).collect::<Vec<_>>(), vec![0x0101, 0x0102]);
        assert_eq!(rows[0].image_index, 0);

        dist.receivers_delete_all().unwrap();
        assert!(dist.receivers().is_empty());
    }

    #[test]
    fn test_start_needs_receivers_and_valid_slot() {
        let mut dist = distributor(4);
        assert!(matches!(
            dist.start(CampaignParams::new(0)),
            Err(DfuError::NoTargets)
        ));
        dist.receivers_add(0x0101, 0).unwrap();
        assert!(matches!(
            dist.start(CampaignParams::new(0)),
            Err(DfuError::SlotNotFound(0))
        ));
        let idx = dist
            .slots()
            .write()
            .add(b"fw".to_vec(), vec![], String::new(), 10)
            .unwrap();
        assert!(matches!(
            dist.start(CampaignParams::new(idx)),
            Err(DfuError::SlotInvalid(_))
        ));
        assert_eq!(dist.phase(), DistPhase::Idle);
    }

    #[tokio::test]
    async fn test_phase_observers_and_locked_receivers() {
        let mut dist = distributor(4);
        let mut rx = dist.subscribe_phase();
        dist.receivers_add(0x0101, 0).unwrap();
        let idx = dist
            .add_slot(b"fw".to_vec(), vec![], String::new(), Bytes::from(vec![1u8; 64]))
            .unwrap();
        dist.start(CampaignParams::new(idx)).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), DistPhase::TransferActive);
        assert!(matches!(dist.receivers_add(0x0102, 0), Err(DfuError::Busy)));
        assert!(matches!(dist.start(CampaignParams::new(idx)), Err(DfuError::Busy)));
        assert!(matches!(dist.apply(), Err(DfuError::InvalidState(_))));

        dist.cancel().unwrap();
        assert_eq!(dist.phase(), DistPhase::Canceling);
    }
}
