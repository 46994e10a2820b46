//! BLOB transfer client: moves one object to many servers at once.
//!
//! Every procedure is a sequence of broadcast rounds. Blocks go out in
//! ascending order; a block closes once each participating target holds it
//! or has been dropped. Targets fail independently and the transfer only
//! fails when none is left.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::chunk::{Bitfield, Block, ChunkBuf, DataSink, IoMode, Transfer, XferMode, SDU_MAX};
use crate::metrics;
use crate::network::{Addr, BlobMessage, RecvCtx, SendCtx, Transport, XferStatus};

use super::broadcast::{BcastStep, Broadcast, RoundOpts};
use super::error::{BlobError, BlobResult};
use super::types::{
    BlobCaps, BlobCliConfig, BlobInputs, BlobStatus, CliPhase, CliStage, LostReason,
    MissingChunks, ServerPhase,
};

/// Application callbacks of a BLOB client.
pub trait BlobCliHandler: Send {
    /// Result of a standalone capabilities procedure: the most restrictive
    /// caps of every responder, or `None` if nobody answered.
    fn caps(&mut self, _caps: Option<&BlobCaps>) {}

    /// Fires exactly once per dropped target.
    fn lost_target(&mut self, _addr: Addr, _reason: LostReason) {}

    /// The whole transfer suspended.
    fn suspended(&mut self) {}

    /// One server reported that it suspended on its own.
    fn target_suspended(&mut self, _addr: Addr) {}

    fn block_complete(&mut self, _block: u16, _progress: u8) {}

    fn end(&mut self, xfer: &Transfer, success: bool);
}

/// Snapshot of one target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetInfo {
    pub addr: Addr,
    pub caps: Option<BlobCaps>,
    pub lost: Option<LostReason>,
    pub blocks: Option<Bitfield>,
}

#[derive(Debug, Default)]
struct Target {
    lost: Option<LostReason>,
    /// Blocks the server holds, from its transfer status and our block
    /// rounds.
    blocks: Option<Bitfield>,
    /// Chunks of the current block still to send to this target.
    missing: Bitfield,
    block_done: bool,
    timeouts: u8,
    rearm: bool,
}

impl Target {
    fn active(&self) -> bool {
        self.lost.is_none()
    }

    fn has_block(&self, number: u16) -> bool {
        self.blocks.as_ref().is_some_and(|b| b.get(number as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Caps,
    XferStart,
    BlockStart,
    BlockSend,
    BlockCheck,
    XferCheck,
    Suspended,
}

pub struct BlobClient<H: BlobCliHandler> {
    config: BlobCliConfig,
    transport: Arc<dyn Transport>,
    handler: H,
    bcast: Broadcast,
    stage: Stage,
    inputs: Option<BlobInputs>,
    targets: BTreeMap<Addr, Target>,
    caps_cache: BTreeMap<Addr, BlobCaps>,
    caps_only: bool,
    caps_canceled: bool,
    xfer: Option<Transfer>,
    io: Option<Box<dyn DataSink>>,
    mtu_size: u16,
    block: Option<Block>,
    pass: u8,
    chunk_queue: BTreeSet<u16>,
    chunk: Option<u16>,
    chunk_data: Vec<u8>,
    gauge: metrics::TransferGauge,
}

impl<H: BlobCliHandler> BlobClient<H> {
    pub fn new(config: BlobCliConfig, transport: Arc<dyn Transport>, handler: H) -> Self {
        Self {
            config,
            transport,
            handler,
            bcast: Broadcast::new(),
            stage: Stage::Idle,
            inputs: None,
            targets: BTreeMap::new(),
            caps_cache: BTreeMap::new(),
            caps_only: false,
            caps_canceled: false,
            xfer: None,
            io: None,
            mtu_size: SDU_MAX,
            block: None,
            pass: 0,
            chunk_queue: BTreeSet::new(),
            chunk: None,
            chunk_data: Vec::new(),
            gauge: metrics::TransferGauge::default(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn config(&self) -> &BlobCliConfig {
        &self.config
    }

    pub fn phase(&self) -> CliPhase {
        match self.stage {
            Stage::Idle => CliPhase::None,
            Stage::Caps if self.caps_only => CliPhase::Caps,
            Stage::Suspended => CliPhase::Suspended,
            _ => CliPhase::Transferring,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.xfer.as_ref()
    }

    /// Cached capabilities of `addr` from an earlier procedure.
    pub fn caps_of(&self, addr: Addr) -> Option<&BlobCaps> {
        self.caps_cache.get(&addr)
    }

    pub fn lost_reason(&self, addr: Addr) -> Option<LostReason> {
        self.targets.get(&addr).and_then(|t| t.lost)
    }

    pub fn active_targets(&self) -> Vec<Addr> {
        self.targets
            .iter()
            .filter(|(_, t)| t.active())
            .map(|(a, _)| *a)
            .collect()
    }

    pub fn targets(&self) -> Vec<TargetInfo> {
        self.targets
            .iter()
            .map(|(addr, t)| TargetInfo {
                addr: *addr,
                caps: self.caps_cache.get(addr).copied(),
                lost: t.lost,
                blocks: t.blocks.clone(),
            })
            .collect()
    }

    /// Percentage of blocks held by every remaining target.
    pub fn progress(&self) -> u8 {
        let Some(xfer) = self.xfer.as_ref() else {
            return 0;
        };
        let count = xfer.block_count();
        if count == 0 {
            return 0;
        }
        let done = (0..count)
            .filter(|b| {
                self.targets
                    .values()
                    .filter(|t| t.active())
                    .all(|t| t.has_block(*b as u16))
            })
            .count() as u32;
        (done * 100 / count) as u8
    }

    /// Query the capabilities of every target. Reports through
    /// [`BlobCliHandler::caps`]; non-responders are lost unless `optional`.
    pub fn caps_get(&mut self, inputs: BlobInputs, optional: bool) -> BlobResult<()> {
        self.prepare(&inputs)?;
        for addr in &inputs.targets {
            self.caps_cache.remove(addr);
        }
        self.inputs = Some(inputs);
        self.caps_only = true;
        self.caps_canceled = false;
        self.start_caps(optional);
        Ok(())
    }

    /// Stop a standalone capabilities procedure. `caps(None)` fires once
    /// the in-flight send completes.
    pub fn caps_cancel(&mut self) {
        if self.stage != Stage::Caps || !self.caps_only {
            return;
        }
        self.caps_canceled = true;
        let step = self.bcast.cancel();
        self.drive(step);
    }

    /// Transfer `xfer` from `io` to every target in `inputs`.
    ///
    /// Runs a capabilities round first unless every target already has
    /// cached caps.
    pub fn send(
        &mut self,
        inputs: BlobInputs,
        xfer: Transfer,
        mut io: Box<dyn DataSink>,
    ) -> BlobResult<()> {
        if self.stage != Stage::Idle {
            return Err(BlobError::Busy);
        }
        xfer.validate()?;
        self.prepare(&inputs)?;
        io.open(&xfer, IoMode::Read)?;

        tracing::info!(
            id = xfer.id,
            size = xfer.size,
            mode = ?xfer.mode,
            targets = self.targets.len(),
            "Starting BLOB transfer"
        );
        self.gauge.started(xfer.size as u64);

        let cached = inputs
            .targets
            .iter()
            .all(|a| self.caps_cache.contains_key(a));
        self.inputs = Some(inputs);
        self.xfer = Some(xfer);
        self.io = Some(io);
        self.caps_only = false;
        self.block = None;
        self.pass = 0;

        if cached {
            let step = self.caps_checked();
            if let Some(step) = step {
                self.drive(step);
            }
        } else {
            self.start_caps(false);
        }
        Ok(())
    }

    /// The transport finished the last send.
    pub fn tx_complete(&mut self) {
        let step = self.bcast.tx_complete();
        self.drive(step);
    }

    /// The response window of the current round elapsed.
    pub fn retry_timeout(&mut self) {
        match self.stage {
            Stage::Idle | Stage::Suspended => {}
            Stage::BlockSend => {
                let pull = self.xfer.is_some_and(|x| x.mode == XferMode::Pull);
                if pull && !self.bcast.is_active() {
                    if let Some(step) = self.start_block_check() {
                        self.drive(step);
                    }
                }
            }
            _ => {
                let step = self.bcast.timeout();
                self.drive(step);
            }
        }
    }

    /// Suspend the transfer locally. Nothing is sent until `resume()`.
    pub fn suspend(&mut self) {
        if matches!(self.stage, Stage::Idle | Stage::Suspended | Stage::Caps) {
            return;
        }
        self.enter_suspended();
    }

    /// Continue a suspended transfer. Servers are re-armed first and blocks
    /// every remaining target already holds are skipped.
    pub fn resume(&mut self) -> BlobResult<()> {
        if self.stage != Stage::Suspended {
            return Err(BlobError::InvalidState(
                "transfer is not suspended".into(),
            ));
        }
        tracing::info!(id = ?self.xfer.map(|x| x.id), "Resuming BLOB transfer");
        for t in self.targets.values_mut() {
            t.timeouts = 0;
            t.rearm = t.active();
        }
        if let Some(step) = self.start_xfer() {
            self.drive(step);
        }
        Ok(())
    }

    /// Stop immediately. No further callbacks fire for this transfer.
    pub fn abort(&mut self) {
        if self.stage == Stage::Idle {
            return;
        }
        tracing::info!(id = ?self.xfer.map(|x| x.id), "BLOB client aborted");
        self.gauge.failed("aborted");
        self.bcast.reset();
        self.close_io();
        self.xfer = None;
        self.block = None;
        self.chunk_queue.clear();
        self.chunk = None;
        self.stage = Stage::Idle;
    }

    pub fn handle_message(&mut self, ctx: &RecvCtx, msg: &BlobMessage) {
        let addr = ctx.src;
        if !self.targets.get(&addr).is_some_and(|t| t.active()) {
            return;
        }

        match (self.stage, msg) {
            (Stage::Caps, BlobMessage::InfoStatus { caps }) => {
                self.caps_cache.insert(addr, *caps);
                self.ack(addr);
            }
            (Stage::XferStart, BlobMessage::XferStatus(status)) => {
                self.on_xfer_started(addr, status);
            }
            (Stage::XferCheck, BlobMessage::XferStatus(status)) => {
                self.on_xfer_checked(addr, status);
            }
            (
                Stage::BlockStart | Stage::BlockCheck,
                BlobMessage::BlockStatus {
                    status,
                    block,
                    missing,
                    ..
                },
            ) => self.on_block_status(addr, *status, *block, missing),
            (
                Stage::BlockStart | Stage::BlockSend | Stage::BlockCheck,
                BlobMessage::PartialBlockReport { chunks },
            ) => self.on_partial_report(addr, chunks),
            _ => tracing::debug!(src = addr, stage = ?self.stage, "Ignoring BLOB message"),
        }
    }

    fn prepare(&mut self, inputs: &BlobInputs) -> BlobResult<()> {
        if self.stage != Stage::Idle {
            return Err(BlobError::Busy);
        }
        if inputs.targets.is_empty() {
            return Err(BlobError::NoTargets);
        }
        let unique: BTreeSet<Addr> = inputs.targets.iter().copied().collect();
        if unique.len() > self.config.max_targets {
            return Err(BlobError::TooManyTargets(self.config.max_targets));
        }
        self.targets = unique
            .into_iter()
            .map(|a| (a, Target::default()))
            .collect();
        Ok(())
    }

    fn start_caps(&mut self, optional: bool) {
        self.stage = Stage::Caps;
        let opts = RoundOpts {
            optional,
            ..self.acked_opts()
        };
        let members = self.active_targets();
        let step = self.bcast.start(opts, members);
        self.drive(step);
    }

    fn acked_opts(&self) -> RoundOpts {
        RoundOpts::acked(
            self.inputs.as_ref().and_then(|i| i.group),
            self.config.retries,
        )
    }

    fn unacked_opts(&self) -> RoundOpts {
        RoundOpts::unacked(self.inputs.as_ref().and_then(|i| i.group))
    }

    fn start_round(&mut self, stage: Stage, members: Vec<Addr>) -> Option<BcastStep> {
        self.stage = stage;
        let opts = self.acked_opts();
        Some(self.bcast.start(opts, members))
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
                BcastStep::Send(dst) => match self.outbound() {
                    Some(msg) => {
                        let ctx = self.send_ctx(dst);
                        match self.transport.send(&ctx, msg.into()) {
                            Ok(()) => return,
                            Err(e) => {
                                tracing::warn!(dst, "BLOB client send failed: {}", e);
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

    fn outbound(&self) -> Option<BlobMessage> {
        let xfer = self.xfer.as_ref();
        match self.stage {
            Stage::Caps => Some(BlobMessage::InfoGet),
            Stage::XferStart => xfer.map(|x| BlobMessage::XferStart {
                id: x.id,
                size: x.size,
                block_size_log: x.block_size_log,
                mtu_size: self.mtu_size,
                mode: x.mode,
            }),
            Stage::BlockStart => match (xfer, self.block.as_ref()) {
                (Some(x), Some(b)) => Some(BlobMessage::BlockStart {
                    block: b.number,
                    chunk_size: x.chunk_size,
                }),
                _ => None,
            },
            Stage::BlockSend => self.chunk.map(|chunk| BlobMessage::ChunkTransfer {
                chunk,
                data: self.chunk_data.clone(),
            }),
            Stage::BlockCheck => Some(BlobMessage::BlockGet),
            Stage::XferCheck => Some(BlobMessage::XferGet),
            Stage::Idle | Stage::Suspended => None,
        }
    }

    fn round_done(&mut self) -> Option<BcastStep> {
        match self.stage {
            Stage::Caps => self.caps_done(),
            Stage::XferStart => self.xfer_start_done(),
            Stage::BlockStart => self.block_round_done(CliStage::BlockStart),
            Stage::BlockCheck => self.block_round_done(CliStage::BlockCheck),
            Stage::BlockSend => {
                if let Some(chunk) = self.chunk.take() {
                    tracing::trace!(chunk, "Chunk sent");
                    metrics::record_chunk_sent(self.chunk_data.len());
                }
                self.next_chunk()
            }
            Stage::XferCheck => self.xfer_check_done(),
            Stage::Idle | Stage::Suspended => None,
        }
    }

    fn lose(&mut self, addr: Addr, reason: LostReason) {
        let Some(target) = self.targets.get_mut(&addr) else {
            return;
        };
        if target.lost.is_some() {
            return;
        }
        target.lost = Some(reason);
        tracing::warn!(addr, ?reason, "Lost BLOB target");
        metrics::record_target_lost();
        self.handler.lost_target(addr, reason);
    }

    fn caps_done(&mut self) -> Option<BcastStep> {
        for addr in self.bcast.timed_out() {
            self.lose(addr, LostReason::Timeout(CliStage::Caps));
        }

        if self.caps_only {
            let caps = if self.caps_canceled {
                None
            } else {
                self.aggregate_caps()
            };
            self.caps_only = false;
            self.caps_canceled = false;
            self.stage = Stage::Idle;
            tracing::debug!(?caps, "Capabilities procedure done");
            self.handler.caps(caps.as_ref());
            return None;
        }
        self.caps_checked()
    }

    fn aggregate_caps(&self) -> Option<BlobCaps> {
        self.targets
            .iter()
            .filter(|(_, t)| t.active())
            .filter_map(|(a, _)| self.caps_cache.get(a))
            .fold(None, |acc: Option<BlobCaps>, caps| {
                Some(acc.map_or(*caps, |acc| acc.merge(caps)))
            })
    }

    /// Drop targets whose caps cannot carry the transfer, then start it.
    fn caps_checked(&mut self) -> Option<BcastStep> {
        let xfer = self.xfer?;
        let unsupported: Vec<Addr> = self
            .active_targets()
            .into_iter()
            .filter(|a| {
                self.caps_cache
                    .get(a)
                    .map_or(true, |caps| caps.check_transfer(&xfer).is_err())
            })
            .collect();
        for addr in unsupported {
            self.lose(addr, LostReason::Unsupported);
        }

        self.mtu_size = self
            .active_targets()
            .iter()
            .filter_map(|a| self.caps_cache.get(a))
            .map(|c| c.mtu_size)
            .min()
            .unwrap_or(SDU_MAX);

        for t in self.targets.values_mut() {
            t.rearm = t.active();
        }
        self.start_xfer()
    }

    /// Send a transfer start to every target flagged for re-arming.
    fn start_xfer(&mut self) -> Option<BcastStep> {
        let members: Vec<Addr> = self
            .targets
            .iter()
            .filter(|(_, t)| t.active() && t.rearm)
            .map(|(a, _)| *a)
            .collect();
        if self.active_targets().is_empty() {
            return self.finish(false);
        }
        if members.is_empty() {
            return self.next_block();
        }
        self.start_round(Stage::XferStart, members)
    }

    fn on_xfer_started(&mut self, addr: Addr, status: &XferStatus) {
        let Some(xfer) = self.xfer else {
            return;
        };
        let matches = status.xfer.is_some_and(|x| x.id == xfer.id);
        if status.status.is_success() && matches && !fits_blocks(&xfer, status) {
            self.lose(addr, LostReason::Rejected(BlobStatus::InvalidParam));
        } else if status.status.is_success() && matches {
            if let Some(t) = self.targets.get_mut(&addr) {
                t.blocks = status.blocks.clone();
                t.rearm = false;
                t.timeouts = 0;
            }
        } else {
            let reason = if status.status.is_success() {
                BlobStatus::WrongBlobId
            } else {
                status.status
            };
            self.lose(addr, LostReason::Rejected(reason));
        }
        self.ack(addr);
    }

    fn xfer_start_done(&mut self) -> Option<BcastStep> {
        for addr in self.bcast.timed_out() {
            self.lose(addr, LostReason::Timeout(CliStage::XferStart));
        }
        if self.active_targets().is_empty() {
            return self.finish(false);
        }
        self.next_block()
    }

    /// Active targets that still need the current block.
    fn participants(&self) -> Vec<Addr> {
        let Some(block) = self.block.as_ref() else {
            return Vec::new();
        };
        self.targets
            .iter()
            .filter(|(_, t)| t.active() && !t.has_block(block.number))
            .map(|(a, _)| *a)
            .collect()
    }

    fn next_block(&mut self) -> Option<BcastStep> {
        let xfer = self.xfer?;
        let next = (0..xfer.block_count()).map(|b| b as u16).find(|b| {
            self.targets
                .values()
                .any(|t| t.active() && !t.has_block(*b))
        });

        let Some(number) = next else {
            return self.start_xfer_check();
        };
        let block = match xfer.block(number) {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!("Invalid block: {}", e);
                return self.finish(false);
            }
        };
        if self.block.map(|b| b.number) != Some(number) {
            self.pass = 0;
        }
        self.block = Some(block);
        self.chunk_queue.clear();
        self.chunk = None;

        let members = self.participants();
        for addr in &members {
            if let Some(t) = self.targets.get_mut(addr) {
                t.missing = Bitfield::full(block.chunk_count as u32);
                t.block_done = false;
            }
        }
        tracing::debug!(block = number, pass = self.pass, targets = members.len(), "Block start");
        self.start_round(Stage::BlockStart, members)
    }

    fn on_block_status(&mut self, addr: Addr, status: BlobStatus, number: u16, missing: &MissingChunks) {
        let Some(block) = self.block else {
            return;
        };
        // A server outside the block phases has no block to report on.
        if status == BlobStatus::WrongPhase {
            if let Some(t) = self.targets.get_mut(&addr) {
                t.rearm = true;
                t.timeouts = 0;
            }
            tracing::info!(addr, "BLOB target suspended");
            self.handler.target_suspended(addr);
            self.ack(addr);
            return;
        }
        if number != block.number {
            tracing::debug!(src = addr, block = number, "Status for another block");
            return;
        }

        match status {
            BlobStatus::Success if !missing.fits(block.chunk_count) => {
                tracing::warn!(src = addr, block = number, "Missing-chunk map does not fit the block");
                self.lose(addr, LostReason::Rejected(BlobStatus::InvalidParam));
            }
            BlobStatus::Success => {
                if let Some(t) = self.targets.get_mut(&addr) {
                    t.missing = missing.to_bitfield(block.chunk_count);
                    t.block_done = matches!(missing, MissingChunks::Complete);
                    t.timeouts = 0;
                }
            }
            other => self.lose(addr, LostReason::Rejected(other)),
        }
        self.ack(addr);
    }

    fn on_partial_report(&mut self, addr: Addr, chunks: &[u16]) {
        if !self.xfer.is_some_and(|x| x.mode == XferMode::Pull) {
            return;
        }
        let Some(block) = self.block else {
            return;
        };
        let Some(t) = self.targets.get_mut(&addr) else {
            return;
        };
        if t.has_block(block.number) {
            return;
        }

        t.timeouts = 0;
        if chunks.is_empty() {
            t.block_done = true;
            t.missing.clear_all();
        } else {
            for &c in chunks.iter().filter(|c| **c < block.chunk_count) {
                t.missing.set(c as u32);
                self.chunk_queue.insert(c);
            }
        }

        if self.stage == Stage::BlockSend && !self.bcast.is_active() {
            if let Some(step) = self.next_chunk() {
                self.drive(step);
            }
        }
    }

    fn block_round_done(&mut self, stage: CliStage) -> Option<BcastStep> {
        let block = self.block?;
        let timed_out = self.bcast.timed_out();

        // Suspend only if no active target is left answering. Targets that
        // already hold the block sit out check rounds but still count.
        let active = self.targets.values().filter(|t| t.active()).count();
        if !timed_out.is_empty() && timed_out.len() == active {
            tracing::warn!(block = block.number, "No target answered, suspending transfer");
            self.enter_suspended();
            return None;
        }
        for addr in timed_out {
            let limit = self.config.max_consecutive_timeouts;
            let dropped = match self.targets.get_mut(&addr) {
                Some(t) => {
                    t.timeouts += 1;
                    // Nothing is known about what it holds: resend everything.
                    t.missing = Bitfield::full(block.chunk_count as u32);
                    t.block_done = false;
                    t.timeouts >= limit
                }
                None => false,
            };
            if dropped {
                self.lose(addr, LostReason::Timeout(stage));
            }
        }

        if self.active_targets().is_empty() {
            return self.finish(false);
        }
        if self.targets.values().any(|t| t.active() && t.rearm) {
            return self.start_xfer();
        }

        let pending: Vec<Addr> = self
            .participants()
            .into_iter()
            .filter(|a| self.targets.get(a).is_some_and(|t| !t.block_done))
            .collect();
        if pending.is_empty() {
            return self.block_finished();
        }

        if stage == CliStage::BlockCheck {
            self.pass += 1;
            if self.pass >= self.config.max_block_passes {
                for addr in pending {
                    self.lose(addr, LostReason::BlockIncomplete(block.number));
                }
                return self.block_finished();
            }
        }
        let pull = self.xfer.is_some_and(|x| x.mode == XferMode::Pull);
        let refill = !pull || self.config.prefill_pull || stage == CliStage::BlockCheck;
        self.start_block_send(refill)
    }

    /// Enter the sending stage. With `refill`, every chunk a target is
    /// known to miss is queued; otherwise only chunks requested by partial
    /// block reports go out.
    fn start_block_send(&mut self, refill: bool) -> Option<BcastStep> {
        self.stage = Stage::BlockSend;
        if refill {
            let missing: BTreeSet<u16> = self
                .participants()
                .iter()
                .filter_map(|a| self.targets.get(a))
                .filter(|t| !t.block_done)
                .flat_map(|t| t.missing.iter_set().map(|c| c as u16))
                .collect();
            self.chunk_queue.extend(missing);
        }
        self.next_chunk()
    }

    /// Send the next queued chunk to every target still missing it.
    fn next_chunk(&mut self) -> Option<BcastStep> {
        let block = self.block?;
        while let Some(chunk) = self.chunk_queue.pop_first() {
            let members: Vec<Addr> = self
                .participants()
                .into_iter()
                .filter(|a| {
                    self.targets
                        .get(a)
                        .is_some_and(|t| !t.block_done && t.missing.get(chunk as u32))
                })
                .collect();
            if members.is_empty() {
                continue;
            }

            if let Err(e) = self.read_chunk(&block, chunk) {
                tracing::warn!(block = block.number, chunk, "Failed to read chunk: {}", e);
                return self.io_failed();
            }
            for addr in &members {
                if let Some(t) = self.targets.get_mut(addr) {
                    t.missing.clear(chunk as u32);
                }
            }
            self.chunk = Some(chunk);
            let opts = self.unacked_opts();
            return Some(self.bcast.start(opts, members));
        }

        match self.xfer.map(|x| x.mode) {
            Some(XferMode::Push) => self.start_block_check(),
            _ => {
                let all_done = self
                    .participants()
                    .iter()
                    .all(|a| self.targets.get(a).is_some_and(|t| t.block_done));
                if all_done {
                    self.block_finished()
                } else {
                    None
                }
            }
        }
    }

    fn read_chunk(&mut self, block: &Block, chunk: u16) -> BlobResult<()> {
        let xfer = self
            .xfer
            .ok_or_else(|| BlobError::InvalidState("no transfer".into()))?;
        let len = block.chunk_len(chunk, xfer.chunk_size)?;
        self.chunk_data.resize(len, 0);
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| BlobError::InvalidState("no data source".into()))?;
        io.read(
            &xfer,
            block,
            &mut ChunkBuf {
                offset: block.chunk_offset(chunk, xfer.chunk_size),
                data: &mut self.chunk_data[..],
            },
        )?;
        Ok(())
    }

    fn start_block_check(&mut self) -> Option<BcastStep> {
        let members: Vec<Addr> = self
            .participants()
            .into_iter()
            .filter(|a| self.targets.get(a).is_some_and(|t| !t.block_done))
            .collect();
        if members.is_empty() {
            return self.block_finished();
        }
        self.start_round(Stage::BlockCheck, members)
    }

    fn block_finished(&mut self) -> Option<BcastStep> {
        let block = self.block?;
        let count = self.xfer?.block_count();
        for addr in self.participants() {
            if let Some(t) = self.targets.get_mut(&addr) {
                if t.block_done {
                    t.blocks
                        .get_or_insert_with(|| Bitfield::new(count))
                        .set(block.number as u32);
                }
            }
        }
        let progress = self.progress();
        tracing::debug!(block = block.number, progress, "Block delivered");
        self.handler.block_complete(block.number, progress);
        self.next_block()
    }

    fn start_xfer_check(&mut self) -> Option<BcastStep> {
        let members = self.active_targets();
        if members.is_empty() {
            return self.finish(false);
        }
        self.block = None;
        self.start_round(Stage::XferCheck, members)
    }

    fn on_xfer_checked(&mut self, addr: Addr, status: &XferStatus) {
        let Some(xfer) = self.xfer else {
            return;
        };
        let ours = status.xfer.is_some_and(|x| x.id == xfer.id) && fits_blocks(&xfer, status);
        let complete = status.phase == ServerPhase::Complete
            || status.blocks.as_ref().is_some_and(|b| b.is_full());
        if !(ours && complete) {
            let reason = if status.status.is_success() {
                BlobStatus::WrongPhase
            } else {
                status.status
            };
            self.lose(addr, LostReason::Rejected(reason));
        }
        self.ack(addr);
    }

    fn xfer_check_done(&mut self) -> Option<BcastStep> {
        for addr in self.bcast.timed_out() {
            self.lose(addr, LostReason::Timeout(CliStage::XferCheck));
        }
        let success = !self.active_targets().is_empty();
        self.finish(success)
    }

    fn io_failed(&mut self) -> Option<BcastStep> {
        for addr in self.active_targets() {
            self.lose(addr, LostReason::Io);
        }
        self.finish(false)
    }

    fn enter_suspended(&mut self) {
        self.bcast.reset();
        self.chunk = None;
        self.stage = Stage::Suspended;
        tracing::info!(id = ?self.xfer.map(|x| x.id), "BLOB transfer suspended");
        self.handler.suspended();
    }

    fn close_io(&mut self) {
        if let (Some(io), Some(xfer)) = (self.io.as_mut(), self.xfer.as_ref()) {
            io.close(xfer);
        }
        self.io = None;
    }

    fn finish(&mut self, success: bool) -> Option<BcastStep> {
        self.bcast.reset();
        self.close_io();
        self.stage = Stage::Idle;
        self.block = None;
        self.chunk = None;
        self.chunk_queue.clear();

        let Some(xfer) = self.xfer.take() else {
            return None;
        };
        if success {
            tracing::info!(id = xfer.id, targets = self.active_targets().len(), "BLOB transfer complete");
            self.gauge.completed();
        } else {
            tracing::warn!(id = xfer.id, "BLOB transfer failed");
            self.gauge.failed("all_targets_lost");
        }
        self.handler.end(&xfer, success);
        None
    }
}

/// A reported block map must cover exactly the blocks of the transfer.
fn fits_blocks(xfer: &Transfer, status: &XferStatus) -> bool {
    status
        .blocks
        .as_ref()
        .map_or(true, |b| b.len() == xfer.block_count())
}
