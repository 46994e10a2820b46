//! DFU client: drives a firmware image to many targets.
//!
//! Each campaign runs start, transfer, refresh, apply and confirm stages.
//! A target that fails any stage is dropped with a [`TargetFailure`] and
//! the others carry on; the campaign ends once every target is done.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::blob::{
    BcastStep, BlobCaps, BlobCliHandler, BlobClient, BlobInputs, Broadcast, CliStage,
    LostReason, RoundOpts,
};
use crate::chunk::{DataSink, Transfer};
use crate::metrics;
use crate::network::{Addr, DfuMessage, Message, RecvCtx, SendCtx, Transport, UpdateStatus};

use super::error::{DfuError, DfuResult};
use super::types::{
    DfuCliConfig, DfuEffect, DfuImage, DfuInputs, DfuPhase, DfuSendOpts, DfuStage, DfuStatus,
    DfuTarget, EndReason, TargetFailure, UpdatePolicy,
};

/// Application callbacks of a DFU client.
pub trait DfuCliHandler: Send {
    /// Fires exactly once per dropped target.
    fn lost_target(&mut self, _addr: Addr, _failure: TargetFailure) {}

    /// The image transfer suspended; `resume()` continues it.
    fn suspended(&mut self) {}

    fn transfer_progress(&mut self, _progress: u8) {}

    /// Every remaining target verified the image. Only fires for
    /// verify-only campaigns, which then wait for `apply()`.
    fn verified(&mut self) {}

    /// The apply round started.
    fn apply_started(&mut self) {}

    /// Outcome of a standalone metadata check for one target.
    fn metadata_checked(&mut self, _addr: Addr, _result: Result<DfuEffect, TargetFailure>) {}

    /// Fires once per campaign.
    fn ended(&mut self, reason: EndReason);
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CliEvent {
    Caps(Option<BlobCaps>),
    Lost(Addr, LostReason),
    Suspended,
    TargetSuspended(Addr),
    Progress(u8),
    End(bool),
}

/// BLOB client callbacks, queued until the DFU layer drains them.
#[derive(Default)]
struct CliEventQueue {
    events: Vec<CliEvent>,
}

impl BlobCliHandler for CliEventQueue {
    fn caps(&mut self, caps: Option<&BlobCaps>) {
        self.events.push(CliEvent::Caps(caps.copied()));
    }

    fn lost_target(&mut self, addr: Addr, reason: LostReason) {
        self.events.push(CliEvent::Lost(addr, reason));
    }

    fn suspended(&mut self) {
        self.events.push(CliEvent::Suspended);
    }

    fn target_suspended(&mut self, addr: Addr) {
        self.events.push(CliEvent::TargetSuspended(addr));
    }

    fn block_complete(&mut self, _block: u16, progress: u8) {
        self.events.push(CliEvent::Progress(progress));
    }

    fn end(&mut self, _xfer: &Transfer, success: bool) {
        self.events.push(CliEvent::End(success));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Caps,
    Start,
    Transfer,
    Refresh,
    /// Verify-only campaign waiting for `apply()`.
    Verified,
    Apply,
    Confirm,
    Cancel,
    MetadataCheck,
}

pub struct DfuClient<H: DfuCliHandler> {
    config: DfuCliConfig,
    transport: Arc<dyn Transport>,
    handler: H,
    blob: BlobClient<CliEventQueue>,
    bcast: Broadcast,
    stage: Stage,
    inputs: Option<DfuInputs>,
    targets: BTreeMap<Addr, DfuTarget>,
    image: Option<DfuImage>,
    metadata: Vec<u8>,
    opts: DfuSendOpts,
    blob_id: u64,
    xfer: Option<Transfer>,
    io: Option<Box<dyn DataSink>>,
    polls: u8,
    progress: u8,
}

impl<H: DfuCliHandler> DfuClient<H> {
    pub fn new(config: DfuCliConfig, transport: Arc<dyn Transport>, handler: H) -> Self {
        let blob = BlobClient::new(config.blob.clone(), transport.clone(), CliEventQueue::default());
        Self {
            config,
            transport,
            handler,
            blob,
            bcast: Broadcast::new(),
            stage: Stage::Idle,
            inputs: None,
            targets: BTreeMap::new(),
            image: None,
            metadata: Vec::new(),
            opts: DfuSendOpts::default(),
            blob_id: 0,
            xfer: None,
            io: None,
            polls: 0,
            progress: 0,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    /// Waiting for `apply()` after a verify-only transfer.
    pub fn is_verified(&self) -> bool {
        self.stage == Stage::Verified
    }

    pub fn targets(&self) -> Vec<DfuTarget> {
        self.targets.values().cloned().collect()
    }

    pub fn target(&self, addr: Addr) -> Option<&DfuTarget> {
        self.targets.get(&addr)
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.xfer.as_ref()
    }

    /// Block progress of the image transfer.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Start a campaign pushing `image` from `io` to every target.
    pub fn send(
        &mut self,
        inputs: DfuInputs,
        image: DfuImage,
        io: Box<dyn DataSink>,
        opts: DfuSendOpts,
    ) -> DfuResult<()> {
        self.prepare(&inputs)?;
        self.blob_id = opts.blob_id.unwrap_or_else(Transfer::generate_id);
        tracing::info!(
            blob_id = self.blob_id,
            size = image.size,
            targets = self.targets.len(),
            policy = ?opts.policy,
            "Starting DFU campaign"
        );

        self.metadata = image.metadata.clone();
        self.image = Some(image);
        self.opts = opts;
        self.io = Some(io);
        self.inputs = Some(inputs);
        self.polls = 0;
        self.progress = 0;
        self.xfer = None;

        match opts.blob_params {
            Some(params) => {
                let size = self.image.as_ref().map(|i| i.size).unwrap_or(0);
                let xfer = Transfer::new(
                    self.blob_id,
                    size,
                    params.block_size_log,
                    params.chunk_size,
                    opts.mode,
                );
                xfer.validate().map_err(crate::blob::BlobError::from)?;
                self.xfer = Some(xfer);
                let step = self.start_round(Stage::Start, self.active_targets());
                self.drive(step);
            }
            None => {
                self.stage = Stage::Caps;
                let blob_inputs = self.blob_inputs();
                if let Err(e) = self.blob.caps_get(blob_inputs, false) {
                    self.reset();
                    return Err(e.into());
                }
                self.drain_events();
            }
        }
        Ok(())
    }

    /// Apply a verified image on every remaining target.
    pub fn apply(&mut self) -> DfuResult<()> {
        if self.stage != Stage::Verified {
            return Err(DfuError::InvalidState("no verified update to apply".into()));
        }
        self.handler.apply_started();
        let step = self.start_round(Stage::Apply, self.active_targets());
        self.drive(step);
        Ok(())
    }

    /// Stop the campaign and cancel the update on every target.
    /// `ended(Canceled)` fires once the cancel round is over.
    pub fn cancel(&mut self) -> DfuResult<()> {
        match self.stage {
            Stage::Idle | Stage::MetadataCheck => {
                return Err(DfuError::InvalidState("no campaign to cancel".into()));
            }
            Stage::Cancel => return Ok(()),
            _ => {}
        }
        tracing::info!(blob_id = self.blob_id, stage = ?self.stage, "Cancelling DFU campaign");
        self.blob.abort();
        self.blob.handler_mut().events.clear();
        self.close_io();

        self.stage = Stage::Cancel;
        let opts = RoundOpts {
            optional: true,
            ..self.acked_opts()
        };
        let members: Vec<Addr> = self.targets.keys().copied().collect();
        let step = self.bcast.start(opts, members);
        self.drive(step);
        Ok(())
    }

    pub fn suspend(&mut self) {
        if self.stage == Stage::Transfer {
            self.blob.suspend();
            self.drain_events();
        }
    }

    pub fn resume(&mut self) -> DfuResult<()> {
        if self.stage != Stage::Transfer {
            return Err(DfuError::InvalidState("no transfer to resume".into()));
        }
        self.blob.resume()?;
        self.drain_events();
        Ok(())
    }

    /// Ask every target whether it accepts `metadata`. Results arrive
    /// through [`DfuCliHandler::metadata_checked`].
    pub fn metadata_check(&mut self, inputs: DfuInputs, metadata: Vec<u8>) -> DfuResult<()> {
        self.prepare(&inputs)?;
        self.inputs = Some(inputs);
        self.metadata = metadata;
        let step = self.start_round(Stage::MetadataCheck, self.active_targets());
        self.drive(step);
        Ok(())
    }

    /// The transport finished the last send.
    pub fn tx_complete(&mut self) {
        match self.stage {
            Stage::Caps | Stage::Transfer => {
                self.blob.tx_complete();
                self.drain_events();
            }
            _ => {
                let step = self.bcast.tx_complete();
                self.drive(step);
            }
        }
    }

    /// The response window of the current round elapsed.
    pub fn retry_timeout(&mut self) {
        match self.stage {
            Stage::Idle | Stage::Verified => {}
            Stage::Caps | Stage::Transfer => {
                self.blob.retry_timeout();
                self.drain_events();
            }
            Stage::Refresh if !self.bcast.is_active() => {
                let step = self.start_round(Stage::Refresh, self.refresh_members());
                self.drive(step);
            }
            _ => {
                let step = self.bcast.timeout();
                self.drive(step);
            }
        }
    }

    pub fn handle_message(&mut self, ctx: &RecvCtx, msg: &Message) {
        match msg {
            Message::Blob(msg) => {
                self.blob.handle_message(ctx, msg);
                self.drain_events();
            }
            Message::Dfu(msg) => self.handle_dfu(ctx, msg),
        }
    }

    fn handle_dfu(&mut self, ctx: &RecvCtx, msg: &DfuMessage) {
        let addr = ctx.src;
        if !self.bcast.is_member(addr) || self.bcast.is_acked(addr) {
            return;
        }
        if !self.targets.get(&addr).is_some_and(|t| t.active()) && self.stage != Stage::Cancel {
            return;
        }

        match (self.stage, msg) {
            (Stage::Start, DfuMessage::UpdateStatus(status)) => self.on_started(addr, status),
            (Stage::Refresh, DfuMessage::UpdateStatus(status)) => self.on_refreshed(addr, status),
            (Stage::Apply, DfuMessage::UpdateStatus(status)) => self.on_applied(addr, status),
            (Stage::Cancel, DfuMessage::UpdateStatus(status)) => {
                if let Some(t) = self.targets.get_mut(&addr) {
                    t.phase = status.phase;
                    t.status = status.status;
                }
            }
            (Stage::Confirm, DfuMessage::UpdateInfoStatus { first, images, .. }) => {
                self.on_confirmed(addr, *first, images.first().map(|i| i.fwid.as_slice()));
            }
            (Stage::MetadataCheck, DfuMessage::UpdateMetadataStatus { status, effect, .. }) => {
                let result = if status.is_success() {
                    Ok(*effect)
                } else {
                    Err(TargetFailure::Rejected(*status))
                };
                self.handler.metadata_checked(addr, result);
            }
            _ => {
                tracing::debug!(src = addr, stage = ?self.stage, "Ignoring DFU message");
                return;
            }
        }
        self.ack(addr);
    }

    fn prepare(&mut self, inputs: &DfuInputs) -> DfuResult<()> {
        if self.stage != Stage::Idle {
            return Err(DfuError::Busy);
        }
        if inputs.targets.is_empty() {
            return Err(DfuError::NoTargets);
        }
        let targets: BTreeMap<Addr, DfuTarget> = inputs
            .targets
            .iter()
            .map(|spec| (spec.addr, DfuTarget::new(*spec)))
            .collect();
        if targets.len() > self.config.blob.max_targets {
            return Err(DfuError::TooManyTargets(self.config.blob.max_targets));
        }
        self.targets = targets;
        Ok(())
    }

    fn active_targets(&self) -> Vec<Addr> {
        self.targets
            .values()
            .filter(|t| t.active())
            .map(|t| t.addr)
            .collect()
    }

    fn blob_inputs(&self) -> BlobInputs {
        let (group, app_idx, ttl, timeout_base) = self
            .inputs
            .as_ref()
            .map(|i| (i.group, i.app_idx, i.ttl, i.timeout_base))
            .unwrap_or((None, 0, 0, 0));
        BlobInputs {
            targets: self.active_targets(),
            group,
            app_idx,
            ttl,
            timeout_base,
        }
    }

    fn acked_opts(&self) -> RoundOpts {
        RoundOpts::acked(
            self.inputs.as_ref().and_then(|i| i.group),
            self.config.blob.retries,
        )
    }

    fn start_round(&mut self, stage: Stage, members: Vec<Addr>) -> BcastStep {
        self.stage = stage;
        let opts = self.acked_opts();
        self.bcast.start(opts, members)
    }

    fn ack(&mut self, addr: Addr) {
        if let Some(step) = self.bcast.ack(addr) {
            self.drive(step);
        }
    }

    fn drive(&mut self, mut step: BcastStep) {
        loop {
            step = match step {
                BcastStep::Wait => return,
                BcastStep::Done => match self.round_done() {
                    Some(next) => next,
                    None => return,
                },
                BcastStep::Send(dst) => match self.outbound(dst) {
                    Some(msg) => {
                        let ctx = self.send_ctx(dst);
                        match self.transport.send(&ctx, msg.into()) {
                            Ok(()) => return,
                            Err(e) => {
                                tracing::warn!(dst, "DFU client send failed: {}", e);
                                self.bcast.tx_complete()
                            }
                        }
                    }
                    None => self.bcast.tx_complete(),
                },
            };
        }
    }

    fn send_ctx(&self, dst: Addr) -> SendCtx {
        let (app_idx, ttl) = self
            .inputs
            .as_ref()
            .map(|i| (i.app_idx, i.ttl))
            .unwrap_or((0, 0));
        SendCtx { dst, app_idx, ttl }
    }

    /// Image index for a destination. Group sends use the first target's.
    fn index_for(&self, dst: Addr) -> u8 {
        self.targets
            .get(&dst)
            .or_else(|| self.targets.values().next())
            .map(|t| t.image_index)
            .unwrap_or(0)
    }

    fn outbound(&self, dst: Addr) -> Option<DfuMessage> {
        let index = self.index_for(dst);
        match self.stage {
            Stage::Start => {
                let inputs = self.inputs.as_ref()?;
                Some(DfuMessage::UpdateStart {
                    ttl: inputs.ttl,
                    timeout_base: inputs.timeout_base,
                    blob_id: self.blob_id,
                    index,
                    metadata: self.metadata.clone(),
                })
            }
            Stage::Refresh => Some(DfuMessage::UpdateGet),
            Stage::Apply => Some(DfuMessage::UpdateApply),
            Stage::Confirm => Some(DfuMessage::UpdateInfoGet {
                first: index,
                limit: 1,
            }),
            Stage::Cancel => Some(DfuMessage::UpdateCancel),
            Stage::MetadataCheck => Some(DfuMessage::UpdateMetadataCheck {
                index,
                metadata: self.metadata.clone(),
            }),
            Stage::Idle | Stage::Caps | Stage::Transfer | Stage::Verified => None,
        }
    }

    fn round_done(&mut self) -> Option<BcastStep> {
        match self.stage {
            Stage::Start => self.start_done(),
            Stage::Refresh => self.refresh_done(),
            Stage::Apply => self.apply_done(),
            Stage::Confirm => self.confirm_done(),
            Stage::Cancel => self.finish(EndReason::Canceled),
            Stage::MetadataCheck => {
                for addr in self.bcast.timed_out() {
                    self.handler
                        .metadata_checked(addr, Err(TargetFailure::Timeout(DfuStage::MetadataCheck)));
                }
                self.stage = Stage::Idle;
                None
            }
            Stage::Idle | Stage::Caps | Stage::Transfer | Stage::Verified => None,
        }
    }

    fn lose(&mut self, addr: Addr, failure: TargetFailure) {
        let Some(target) = self.targets.get_mut(&addr) else {
            return;
        };
        if target.failure.is_some() {
            return;
        }
        target.failure = Some(failure);
        tracing::warn!(addr, ?failure, "Lost DFU target");
        if !matches!(failure, TargetFailure::Blob(_)) {
            metrics::record_target_lost();
        }
        self.handler.lost_target(addr, failure);
    }

    fn lose_timed_out(&mut self, stage: DfuStage) {
        for addr in self.bcast.timed_out() {
            let unprovisioned = self
                .targets
                .get(&addr)
                .is_some_and(|t| t.effect == DfuEffect::Unprovision);
            if unprovisioned && matches!(stage, DfuStage::Apply | DfuStage::Confirm) {
                // Gone silent after unprovisioning itself: that is success.
                if let Some(t) = self.targets.get_mut(&addr) {
                    t.phase = DfuPhase::ApplySuccess;
                }
                continue;
            }
            self.lose(addr, TargetFailure::Timeout(stage));
        }
    }

    fn drain_events(&mut self) {
        loop {
            let events = std::mem::take(&mut self.blob.handler_mut().events);
            if events.is_empty() {
                return;
            }
            for event in events {
                match event {
                    CliEvent::Caps(caps) => self.caps_done(caps),
                    CliEvent::Lost(addr, reason) => {
                        let failure = match (self.stage, reason) {
                            (Stage::Caps, LostReason::Timeout(CliStage::Caps)) => {
                                TargetFailure::Timeout(DfuStage::Caps)
                            }
                            (_, reason) => TargetFailure::Blob(reason),
                        };
                        self.lose(addr, failure);
                    }
                    CliEvent::Suspended => {
                        tracing::info!(blob_id = self.blob_id, "Image transfer suspended");
                        self.handler.suspended();
                    }
                    CliEvent::TargetSuspended(addr) => {
                        tracing::debug!(addr, "Target suspended its transfer");
                    }
                    CliEvent::Progress(progress) => {
                        self.progress = progress;
                        self.handler.transfer_progress(progress);
                    }
                    CliEvent::End(success) => self.transfer_done(success),
                }
            }
        }
    }

    fn caps_done(&mut self, caps: Option<BlobCaps>) {
        if self.stage != Stage::Caps {
            return;
        }
        let Some(caps) = caps else {
            tracing::warn!(blob_id = self.blob_id, "No target reported capabilities");
            self.end_if_lost();
            return;
        };
        let size = self.image.as_ref().map(|i| i.size).unwrap_or(0);
        let xfer = caps.transfer_for(self.blob_id, size, self.opts.mode);
        if let Err(status) = caps.check_transfer(&xfer) {
            tracing::warn!(?status, size, "Image does not fit the targets' capabilities");
            for addr in self.active_targets() {
                self.lose(addr, TargetFailure::Blob(LostReason::Unsupported));
            }
            self.end_if_lost();
            return;
        }
        self.xfer = Some(xfer);
        let step = self.start_round(Stage::Start, self.active_targets());
        self.drive(step);
    }

    fn on_started(&mut self, addr: Addr, status: &UpdateStatus) {
        let accepted = status.status.is_success()
            && matches!(
                status.phase,
                DfuPhase::TransferActive | DfuPhase::Verify | DfuPhase::VerifyOk
            )
            && status.update.is_some_and(|u| u.blob_id == self.blob_id);
        if let Some(t) = self.targets.get_mut(&addr) {
            t.phase = status.phase;
            t.status = status.status;
            t.effect = status.effect;
        }
        if !accepted {
            let reason = if status.status.is_success() {
                DfuStatus::WrongPhase
            } else {
                status.status
            };
            self.lose(addr, TargetFailure::Rejected(reason));
        }
    }

    fn start_done(&mut self) -> Option<BcastStep> {
        self.lose_timed_out(DfuStage::Start);
        if self.active_targets().is_empty() {
            return self.finish(EndReason::AllTargetsLost);
        }

        let (Some(xfer), Some(io)) = (self.xfer, self.io.take()) else {
            return self.finish(EndReason::AllTargetsLost);
        };
        self.stage = Stage::Transfer;
        let blob_inputs = self.blob_inputs();
        if let Err(e) = self.blob.send(blob_inputs, xfer, io) {
            tracing::warn!(blob_id = self.blob_id, "Failed to start image transfer: {}", e);
            for addr in self.active_targets() {
                self.lose(addr, TargetFailure::Blob(LostReason::Io));
            }
            return self.finish(EndReason::AllTargetsLost);
        }
        self.drain_events();
        None
    }

    fn transfer_done(&mut self, success: bool) {
        if self.stage != Stage::Transfer {
            return;
        }
        // The BLOB client reports each loss before ending.
        if !success || self.active_targets().is_empty() {
            self.end_if_lost();
            return;
        }
        tracing::info!(blob_id = self.blob_id, "Image transferred, polling verification");
        self.polls = 0;
        let step = self.start_round(Stage::Refresh, self.refresh_members());
        self.drive(step);
    }

    fn refresh_members(&self) -> Vec<Addr> {
        self.targets
            .values()
            .filter(|t| t.active() && !matches!(t.phase, DfuPhase::VerifyOk))
            .map(|t| t.addr)
            .collect()
    }

    fn on_refreshed(&mut self, addr: Addr, status: &UpdateStatus) {
        if let Some(t) = self.targets.get_mut(&addr) {
            t.phase = status.phase;
            t.status = status.status;
        }
        match status.phase {
            DfuPhase::Verify | DfuPhase::VerifyOk => {}
            DfuPhase::VerifyFail => self.lose(addr, TargetFailure::VerifyFailed),
            _ => self.lose(addr, TargetFailure::Rejected(DfuStatus::WrongPhase)),
        }
    }

    fn refresh_done(&mut self) -> Option<BcastStep> {
        self.lose_timed_out(DfuStage::Refresh);
        if self.active_targets().is_empty() {
            return self.finish(EndReason::AllTargetsLost);
        }

        let verifying = self.refresh_members();
        if !verifying.is_empty() {
            self.polls += 1;
            if self.polls < self.config.max_refresh_polls {
                // Polled again on the next retry timeout.
                tracing::debug!(pending = verifying.len(), polls = self.polls, "Targets still verifying");
                return None;
            }
            for addr in verifying {
                self.lose(addr, TargetFailure::Timeout(DfuStage::Refresh));
            }
            if self.active_targets().is_empty() {
                return self.finish(EndReason::AllTargetsLost);
            }
        }

        match self.opts.policy {
            UpdatePolicy::VerifyAndApply => {
                self.handler.apply_started();
                Some(self.start_round(Stage::Apply, self.active_targets()))
            }
            UpdatePolicy::VerifyOnly => {
                tracing::info!(blob_id = self.blob_id, "Image verified, waiting for apply");
                self.stage = Stage::Verified;
                self.handler.verified();
                None
            }
        }
    }

    fn on_applied(&mut self, addr: Addr, status: &UpdateStatus) {
        if let Some(t) = self.targets.get_mut(&addr) {
            t.phase = status.phase;
            t.status = status.status;
        }
        let applying = match (status.status, status.phase) {
            (DfuStatus::Success, DfuPhase::Applying | DfuPhase::ApplySuccess | DfuPhase::Idle) => true,
            // Already applied by an earlier attempt of this round.
            (DfuStatus::WrongPhase, DfuPhase::Idle) => true,
            _ => false,
        };
        if !applying {
            let failure = match status.phase {
                DfuPhase::ApplyFail | DfuPhase::VerifyOk => TargetFailure::ApplyFailed,
                _ => TargetFailure::Rejected(status.status),
            };
            self.lose(addr, failure);
        }
    }

    fn apply_done(&mut self) -> Option<BcastStep> {
        self.lose_timed_out(DfuStage::Apply);
        if self.active_targets().is_empty() {
            return self.finish(EndReason::AllTargetsLost);
        }
        let members: Vec<Addr> = self
            .targets
            .values()
            .filter(|t| t.active() && t.phase != DfuPhase::ApplySuccess)
            .map(|t| t.addr)
            .collect();
        if members.is_empty() {
            return self.finish(EndReason::Success);
        }
        Some(self.start_round(Stage::Confirm, members))
    }

    fn on_confirmed(&mut self, addr: Addr, first: u8, fwid: Option<&[u8]>) {
        let expected = self.image.as_ref().map(|i| i.fwid.as_slice());
        let Some(t) = self.targets.get_mut(&addr) else {
            return;
        };
        if first != t.image_index {
            tracing::debug!(addr, first, "Image info for another index");
        }
        if fwid.is_some() && fwid == expected {
            t.phase = DfuPhase::ApplySuccess;
            tracing::info!(addr, "Update confirmed");
        } else {
            t.phase = DfuPhase::ApplyFail;
            self.lose(addr, TargetFailure::ApplyFailed);
        }
    }

    fn confirm_done(&mut self) -> Option<BcastStep> {
        self.lose_timed_out(DfuStage::Confirm);
        let reason = if self.active_targets().is_empty() {
            EndReason::AllTargetsLost
        } else {
            EndReason::Success
        };
        self.finish(reason)
    }

    fn end_if_lost(&mut self) {
        if self.active_targets().is_empty() {
            self.finish(EndReason::AllTargetsLost);
        }
    }

    fn close_io(&mut self) {
        self.io = None;
    }

    fn reset(&mut self) {
        self.bcast.reset();
        self.close_io();
        self.stage = Stage::Idle;
    }

    fn finish(&mut self, reason: EndReason) -> Option<BcastStep> {
        self.blob.abort();
        self.blob.handler_mut().events.clear();
        self.reset();
        let succeeded = self
            .targets
            .values()
            .filter(|t| t.active())
            .count();
        tracing::info!(blob_id = self.blob_id, ?reason, succeeded, "DFU campaign ended");
        self.handler.ended(reason);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{MemorySink, XferMode};
    use crate::dfu::types::{BlobParams, DfuTargetSpec};
    use crate::network::testing::RecordingTransport;
    use crate::network::{BlobMessage, UpdateInfo};
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        lost: Vec<(Addr, TargetFailure)>,
        checked: Vec<(Addr, Result<DfuEffect, TargetFailure>)>,
        verified: u32,
        ended: Vec<EndReason>,
    }

    impl DfuCliHandler for Recorder {
        fn lost_target(&mut self, addr: Addr, failure: TargetFailure) {
            self.lost.push((addr, failure));
        }

        fn verified(&mut self) {
            self.verified += 1;
        }

        fn metadata_checked(&mut self, addr: Addr, result: Result<DfuEffect, TargetFailure>) {
            self.checked.push((addr, result));
        }

        fn ended(&mut self, reason: EndReason) {
            self.ended.push(reason);
        }
    }

    fn inputs(addrs: &[Addr]) -> DfuInputs {
        DfuInputs {
            targets: addrs
                .iter()
                .map(|a| DfuTargetSpec {
                    addr: *a,
                    image_index: 0,
                })
                .collect(),
            group: None,
            app_idx: 0,
            ttl: 5,
            timeout_base: 10,
        }
    }

    fn image() -> DfuImage {
        DfuImage {
            fwid: b"fw-2.0".to_vec(),
            metadata: b"board-a".to_vec(),
            size: 100,
        }
    }

    fn from(src: Addr) -> RecvCtx {
        RecvCtx {
            src,
            dst: 0x0001,
            app_idx: 0,
        }
    }

    fn client(net: &Arc<RecordingTransport>) -> DfuClient<Recorder> {
        DfuClient::new(DfuCliConfig::default(), net.clone(), Recorder::default())
    }

    fn flush(cli: &mut DfuClient<Recorder>, net: &RecordingTransport) -> Vec<(Addr, Message)> {
        let mut sent = Vec::new();
        loop {
            let batch = net.take();
            if batch.is_empty() {
                return sent;
            }
            for (ctx, msg) in batch {
                sent.push((ctx.dst, msg));
                cli.tx_complete();
            }
        }
    }

    fn status(phase: DfuPhase, status: DfuStatus) -> Message {
        DfuMessage::UpdateStatus(UpdateStatus {
            status,
            phase,
            effect: DfuEffect::None,
            update: Some(UpdateInfo {
                ttl: 5,
                timeout_base: 10,
                blob_id: 9,
                index: 0,
            }),
        })
        .into()
    }

    fn explicit() -> DfuSendOpts {
        DfuSendOpts {
            blob_id: Some(9),
            blob_params: Some(BlobParams {
                block_size_log: 12,
                chunk_size: 377,
            }),
            ..DfuSendOpts::default()
        }
    }

    fn io() -> Box<dyn DataSink> {
        Box::new(MemorySink::from_bytes(Bytes::from(vec![7u8; 100])))
    }

    #[test]
    fn test_target_set_checks() {
        let net = Arc::new(RecordingTransport::new());
        let mut cli = client(&net);
        assert!(matches!(
            cli.send(inputs(&[]), image(), io(), explicit()),
            Err(DfuError::NoTargets)
        ));
        let many: Vec<Addr> = (1..=40).collect();
        assert!(matches!(
            cli.send(inputs(&many), image(), io(), explicit()),
            Err(DfuError::TooManyTargets(32))
        ));
        cli.send(inputs(&[2]), image(), io(), explicit()).unwrap();
        assert!(matches!(
            cli.send(inputs(&[3]), image(), io(), explicit()),
            Err(DfuError::Busy)
        ));
    }

    #[test]
    fn test_start_rejection_drops_only_that_target() {
        let net = Arc::new(RecordingTransport::new());
        let mut cli = client(&net);
        cli.send(inputs(&[2, 3]), image(), io(), explicit()).unwrap();
        let sent = flush(&mut cli, &net);
        assert!(sent
            .iter()
            .all(|(_, m)| matches!(m, Message::Dfu(DfuMessage::UpdateStart { blob_id: 9, .. }))));

        cli.handle_message(&from(2), &status(DfuPhase::TransferActive, DfuStatus::Success));
        cli.handle_message(&from(3), &status(DfuPhase::Idle, DfuStatus::Metadata));

        assert_eq!(
            cli.handler().lost,
            vec![(3, TargetFailure::Rejected(DfuStatus::Metadata))]
        );
        // the image transfer starts with the remaining target only
        let sent = flush(&mut cli, &net);
        assert!(sent.iter().all(|(dst, _)| *dst == 2));
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(m, Message::Blob(BlobMessage::InfoGet | BlobMessage::XferStart { .. }))));
    }

    #[test]
    fn test_all_targets_rejecting_ends_campaign() {
        let net = Arc::new(RecordingTransport::new());
        let mut cli = client(&net);
        cli.send(inputs(&[2]), image(), io(), explicit()).unwrap();
        flush(&mut cli, &net);
        cli.handle_message(&from(2), &status(DfuPhase::Verify, DfuStatus::WrongPhase));
        assert_eq!(cli.handler().ended, vec![EndReason::AllTargetsLost]);
        assert!(cli.is_idle());
    }

    #[test]
    fn test_cancel_round_is_optional() {
        let net = Arc::new(RecordingTransport::new());
        let mut cli = client(&net);
        cli.send(inputs(&[2, 3]), image(), io(), explicit()).unwrap();
        flush(&mut cli, &net);
        cli.cancel().unwrap();
        let sent = flush(&mut cli, &net);
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, m)| matches!(m, Message::Dfu(DfuMessage::UpdateCancel))));

        cli.handle_message(&from(2), &status(DfuPhase::Idle, DfuStatus::Success));
        for _ in 0..=DfuCliConfig::default().blob.retries {
            cli.retry_timeout();
            flush(&mut cli, &net);
        }
        assert_eq!(cli.handler().ended, vec![EndReason::Canceled]);
        assert!(cli.handler().lost.is_empty());
    }

    #[test]
    fn test_metadata_check_reports_each_target() {
        let net = Arc::new(RecordingTransport::new());
        let mut cli = client(&net);
        cli.metadata_check(inputs(&[2, 3, 4]), b"board-a".to_vec())
            .unwrap();
        flush(&mut cli, &net);
        cli.handle_message(
            &from(2),
            &DfuMessage::UpdateMetadataStatus {
                status: DfuStatus::Success,
                effect: DfuEffect::Unprovision,
                index: 0,
            }
            .into(),
        );
        cli.handle_message(
            &from(3),
            &DfuMessage::UpdateMetadataStatus {
                status: DfuStatus::Metadata,
                effect: DfuEffect::None,
                index: 0,
            }
            .into(),
        );
        for _ in 0..=DfuCliConfig::default().blob.retries {
            cli.retry_timeout();
            flush(&mut cli, &net);
        }
        assert_eq!(
            cli.handler().checked,
            vec![
                (2, Ok(DfuEffect::Unprovision)),
                (3, Err(TargetFailure::Rejected(DfuStatus::Metadata))),
                (4, Err(TargetFailure::Timeout(DfuStage::MetadataCheck))),
            ]
        );
        assert!(cli.is_idle());
        assert!(cli.handler().ended.is_empty());
    }

    #[test]
    fn test_apply_requires_verified_campaign() {
        let net = Arc::new(RecordingTransport::new());
        let mut cli = client(&net);
        assert!(matches!(cli.apply(), Err(DfuError::InvalidState(_))));
        cli.send(
            inputs(&[2]),
            image(),
            io(),
            DfuSendOpts {
                policy: UpdatePolicy::VerifyOnly,
                mode: XferMode::Push,
                ..explicit()
            },
        )
        .unwrap();
        assert!(matches!(cli.apply(), Err(DfuError::InvalidState(_))));
    }
}
