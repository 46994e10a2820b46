//! DFU server: firmware update phases around one BLOB transfer.

use std::sync::Arc;

use crate::blob::{BlobServer, BlobSrvHandler, ServerPhase};
use crate::chunk::{Bitfield, DataSink, Transfer};
use crate::metrics;
use crate::network::{
    DfuMessage, Message, RecvCtx, SendCtx, Transport, UpdateInfo, UpdateStatus,
};
use crate::settings::{decode_record, encode_record, PersistedUpdate, SettingsStore};

use super::error::{DfuError, DfuResult};
use super::types::{DfuEffect, DfuPhase, DfuSrvConfig, DfuStatus, ImageInfo};

/// Application callbacks of a DFU server.
pub trait DfuSrvHandler: Send {
    /// Inspect `metadata` for the image at `index` and declare the effect
    /// of applying it.
    fn check(&mut self, index: u8, metadata: &[u8]) -> Result<DfuEffect, DfuStatus>;

    /// An update passed the metadata check. Returns the sink the image is
    /// written to.
    fn start(&mut self, index: u8, metadata: &[u8]) -> Result<Box<dyn DataSink>, DfuStatus>;

    /// The transfer ended. On success the image must be verified and
    /// reported through [`DfuServer::verified`] or [`DfuServer::rejected`].
    fn end(&mut self, _index: u8, _success: bool) {}

    /// Re-obtain the sink of an update interrupted by a reboot.
    fn recover(&mut self, _index: u8) -> Option<Box<dyn DataSink>> {
        None
    }

    /// Apply the verified image. Completion is reported through
    /// [`DfuServer::applied`], possibly after a reboot.
    fn apply(&mut self, index: u8) -> Result<(), DfuStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlobEvent {
    End(bool),
    Suspended,
    Resume,
}

/// BLOB server callbacks, queued until the DFU layer drains them.
#[derive(Default)]
struct SrvEventQueue {
    events: Vec<BlobEvent>,
    recover_io: Option<Box<dyn DataSink>>,
}

impl BlobSrvHandler for SrvEventQueue {
    fn end(&mut self, _id: u64, success: bool) {
        self.events.push(BlobEvent::End(success));
    }

    fn suspended(&mut self) {
        self.events.push(BlobEvent::Suspended);
    }

    fn resume(&mut self) {
        self.events.push(BlobEvent::Resume);
    }

    fn recover(&mut self, _xfer: &Transfer) -> Option<Box<dyn DataSink>> {
        self.recover_io.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Update {
    index: u8,
    ttl: u8,
    timeout_base: u16,
    blob_id: u64,
    metadata_hash: [u8; 32],
    effect: DfuEffect,
}

impl Update {
    fn same_as(&self, other: &Update) -> bool {
        self.index == other.index
            && self.ttl == other.ttl
            && self.timeout_base == other.timeout_base
            && self.blob_id == other.blob_id
            && self.metadata_hash == other.metadata_hash
    }
}

impl From<PersistedUpdate> for Update {
    fn from(rec: PersistedUpdate) -> Self {
        Self {
            index: rec.image_index,
            ttl: rec.ttl,
            timeout_base: rec.timeout_base,
            blob_id: rec.blob_id,
            metadata_hash: rec.metadata_hash,
            effect: rec.effect,
        }
    }
}

pub struct DfuServer<H: DfuSrvHandler> {
    config: DfuSrvConfig,
    transport: Arc<dyn Transport>,
    settings: Arc<dyn SettingsStore>,
    handler: H,
    blob: BlobServer<SrvEventQueue>,
    images: Vec<ImageInfo>,
    phase: DfuPhase,
    update: Option<Update>,
    /// Sink recovered at boot that the BLOB server did not need yet.
    spare_io: Option<Box<dyn DataSink>>,
}

impl<H: DfuSrvHandler> DfuServer<H> {
    pub fn new(
        config: DfuSrvConfig,
        images: Vec<ImageInfo>,
        transport: Arc<dyn Transport>,
        settings: Arc<dyn SettingsStore>,
        handler: H,
    ) -> Self {
        let blob = BlobServer::new(
            config.blob.clone(),
            transport.clone(),
            settings.clone(),
            SrvEventQueue::default(),
        );
        Self {
            config,
            transport,
            settings,
            handler,
            blob,
            images,
            phase: DfuPhase::Idle,
            update: None,
            spare_io: None,
        }
    }

    pub fn phase(&self) -> DfuPhase {
        self.phase
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn images(&self) -> &[ImageInfo] {
        &self.images
    }

    /// Effect declared for the running update.
    pub fn effect(&self) -> DfuEffect {
        self.update.map(|u| u.effect).unwrap_or_default()
    }

    pub fn update_info(&self) -> Option<UpdateInfo> {
        self.update.map(|u| UpdateInfo {
            ttl: u.ttl,
            timeout_base: u.timeout_base,
            blob_id: u.blob_id,
            index: u.index,
        })
    }

    pub fn blob_phase(&self) -> ServerPhase {
        self.blob.phase()
    }

    pub fn blob_blocks(&self) -> Option<&Bitfield> {
        self.blob.blocks_received()
    }

    pub fn progress(&self) -> u8 {
        self.blob.progress()
    }

    /// Replace the firmware ID of an image, typically after applying it.
    pub fn update_image_fwid(&mut self, index: u8, fwid: Vec<u8>) -> DfuResult<()> {
        let image = self
            .images
            .get_mut(index as usize)
            .ok_or(DfuError::InvalidImageIndex(index))?;
        image.fwid = fwid;
        Ok(())
    }

    /// The received image checked out.
    pub fn verified(&mut self) {
        if self.phase != DfuPhase::Verify {
            tracing::debug!(phase = ?self.phase, "Ignoring verification outside the verify phase");
            return;
        }
        self.set_phase(DfuPhase::VerifyOk);
    }

    /// The received image failed verification.
    pub fn rejected(&mut self) {
        if self.phase != DfuPhase::Verify {
            return;
        }
        tracing::warn!(index = ?self.update.map(|u| u.index), "Image rejected");
        self.set_phase(DfuPhase::VerifyFail);
    }

    /// The image is applied. The update record is dropped.
    pub fn applied(&mut self) {
        if self.phase != DfuPhase::Applying {
            return;
        }
        tracing::info!(index = ?self.update.map(|u| u.index), "Image applied");
        self.set_phase(DfuPhase::Idle);
    }

    /// Abandon the update from any phase.
    pub fn cancel(&mut self) {
        let busy = self.phase != DfuPhase::Idle;
        self.blob.cancel();
        self.blob.handler_mut().events.clear();
        self.spare_io = None;
        if busy {
            if let Some(update) = self.update {
                tracing::info!(index = update.index, phase = ?self.phase, "Update cancelled");
                if matches!(self.phase, DfuPhase::TransferActive) {
                    self.handler.end(update.index, false);
                }
            }
        }
        self.set_phase(DfuPhase::Idle);
        self.update = None;
    }

    /// Reload the update record and BLOB progress after a reboot.
    pub fn restore(&mut self) -> DfuResult<DfuPhase> {
        let rec: Option<PersistedUpdate> = match self.settings.load(&self.config.settings_key)? {
            Some(bytes) => match decode_record(&bytes) {
                Ok(rec) => Some(rec),
                Err(e) => {
                    tracing::warn!("Discarding unreadable update record: {}", e);
                    None
                }
            },
            None => None,
        };

        let Some(rec) = rec else {
            self.settings.erase(&self.config.settings_key)?;
            self.blob.cancel();
            self.blob.handler_mut().events.clear();
            return Ok(self.phase);
        };

        let update = Update::from(rec.clone());
        if matches!(
            rec.phase,
            DfuPhase::TransferActive | DfuPhase::TransferError { .. }
        ) {
            self.blob.handler_mut().recover_io = self.handler.recover(update.index);
        }
        self.blob.restore()?;
        self.blob.handler_mut().events.clear();
        self.spare_io = self.blob.handler_mut().recover_io.take();

        let phase = match rec.phase {
            DfuPhase::TransferActive | DfuPhase::TransferError { resumable: true } => {
                let resumable = matches!(
                    self.blob.phase(),
                    ServerPhase::TransferError { resumable: true }
                        | ServerPhase::Suspended
                        | ServerPhase::WaitingForStart
                );
                DfuPhase::TransferError { resumable }
            }
            DfuPhase::Verify | DfuPhase::VerifyOk => DfuPhase::VerifyFail,
            other => other,
        };

        tracing::info!(index = update.index, stored = ?rec.phase, ?phase, "Restored update");
        self.update = Some(update);
        self.set_phase(phase);
        Ok(self.phase)
    }

    /// One retransmission window elapsed without traffic.
    pub fn link_timeout(&mut self) {
        self.blob.link_timeout();
        self.drain_events();
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
        match msg {
            DfuMessage::UpdateInfoGet { first, limit } => {
                let images = self
                    .images
                    .iter()
                    .skip(*first as usize)
                    .take(*limit as usize)
                    .cloned()
                    .collect();
                let total = self.images.len().min(u8::MAX as usize) as u8;
                self.reply(
                    ctx,
                    DfuMessage::UpdateInfoStatus {
                        total,
                        first: *first,
                        images,
                    },
                );
            }
            DfuMessage::UpdateMetadataCheck { index, metadata } => {
                let (status, effect) = if *index as usize >= self.images.len() {
                    (DfuStatus::FwIndex, DfuEffect::None)
                } else {
                    match self.handler.check(*index, metadata) {
                        Ok(effect) => (DfuStatus::Success, effect),
                        Err(status) => (status, DfuEffect::None),
                    }
                };
                self.reply(
                    ctx,
                    DfuMessage::UpdateMetadataStatus {
                        status,
                        effect,
                        index: *index,
                    },
                );
            }
            DfuMessage::UpdateGet => self.reply_status(ctx, DfuStatus::Success),
            DfuMessage::UpdateStart {
                ttl,
                timeout_base,
                blob_id,
                index,
                metadata,
            } => {
                let update = Update {
                    index: *index,
                    ttl: *ttl,
                    timeout_base: *timeout_base,
                    blob_id: *blob_id,
                    metadata_hash: blake3::hash(metadata).into(),
                    effect: DfuEffect::None,
                };
                let status = self.update_start(update, metadata);
                self.reply_status(ctx, status);
            }
            DfuMessage::UpdateCancel => {
                self.cancel();
                self.reply_status(ctx, DfuStatus::Success);
            }
            DfuMessage::UpdateApply => self.update_apply(ctx),
            DfuMessage::UpdateInfoStatus { .. }
            | DfuMessage::UpdateMetadataStatus { .. }
            | DfuMessage::UpdateStatus(_) => {
                tracing::debug!(src = ctx.src, "Ignoring client-bound DFU message");
            }
        }
    }

    fn update_start(&mut self, mut update: Update, metadata: &[u8]) -> DfuStatus {
        let same = self.update.is_some_and(|u| u.same_as(&update));

        match self.phase {
            DfuPhase::TransferActive | DfuPhase::Verify | DfuPhase::VerifyOk | DfuPhase::Applying => {
                return if same {
                    DfuStatus::Success
                } else {
                    DfuStatus::WrongPhase
                };
            }
            DfuPhase::TransferError { resumable: true } if same => return self.resume_transfer(),
            DfuPhase::VerifyFail if same => {
                tracing::info!(index = update.index, "Verifying image again");
                self.set_phase(DfuPhase::Verify);
                self.handler.end(update.index, true);
                return DfuStatus::Success;
            }
            _ => {}
        }

        if update.index as usize >= self.images.len() {
            return DfuStatus::FwIndex;
        }
        update.effect = match self.handler.check(update.index, metadata) {
            Ok(effect) => effect,
            Err(status) => {
                tracing::info!(index = update.index, ?status, "Metadata check rejected update");
                return status;
            }
        };
        let io = match self.handler.start(update.index, metadata) {
            Ok(io) => io,
            Err(status) => return status,
        };

        // A previous attempt that is not being resumed is dropped first.
        if self.phase != DfuPhase::Idle {
            self.blob.cancel();
            self.blob.handler_mut().events.clear();
        }
        self.spare_io = None;
        if let Err(e) = self
            .blob
            .recv(update.blob_id, io, update.ttl, update.timeout_base)
        {
            tracing::warn!(index = update.index, "Failed to arm BLOB server: {}", e);
            return DfuStatus::BlobXferBusy;
        }

        tracing::info!(
            index = update.index,
            blob_id = update.blob_id,
            effect = ?update.effect,
            "Update started"
        );
        self.update = Some(update);
        self.set_phase(DfuPhase::TransferActive);
        self.status_of_phase()
    }

    /// Pick up an interrupted transfer without checking the metadata again.
    fn resume_transfer(&mut self) -> DfuStatus {
        let Some(update) = self.update else {
            return DfuStatus::Internal;
        };

        if self.blob.phase() == ServerPhase::Suspended
            && self.blob.transfer_id() == Some(update.blob_id)
        {
            tracing::info!(index = update.index, "Waiting for suspended transfer to resume");
            self.set_phase(DfuPhase::TransferActive);
            return self.status_of_phase();
        }

        let io = match self
            .spare_io
            .take()
            .or_else(|| self.handler.recover(update.index))
        {
            Some(io) => io,
            None => {
                tracing::warn!(index = update.index, "No data sink to resume update");
                return DfuStatus::Internal;
            }
        };
        if let Err(e) = self
            .blob
            .recv(update.blob_id, io, update.ttl, update.timeout_base)
        {
            tracing::warn!(index = update.index, "Failed to resume BLOB transfer: {}", e);
            return DfuStatus::BlobXferBusy;
        }

        tracing::info!(index = update.index, blob_id = update.blob_id, "Update resumed");
        self.set_phase(DfuPhase::TransferActive);
        self.status_of_phase()
    }

    fn update_apply(&mut self, ctx: &RecvCtx) {
        match self.phase {
            DfuPhase::VerifyOk => {}
            DfuPhase::Applying | DfuPhase::ApplySuccess => {
                self.reply_status(ctx, DfuStatus::Success);
                return;
            }
            _ => {
                self.reply_status(ctx, DfuStatus::WrongPhase);
                return;
            }
        }
        let Some(update) = self.update else {
            self.reply_status(ctx, DfuStatus::Internal);
            return;
        };

        // The phase is stored before the response: applying may reboot us.
        self.set_phase(DfuPhase::Applying);
        self.reply_status(ctx, DfuStatus::Success);

        if let Err(status) = self.handler.apply(update.index) {
            tracing::warn!(index = update.index, ?status, "Apply failed");
            self.set_phase(DfuPhase::VerifyOk);
        }
    }

    fn drain_events(&mut self) {
        let events = std::mem::take(&mut self.blob.handler_mut().events);
        for event in events {
            let Some(update) = self.update else {
                return;
            };
            match (event, self.phase) {
                (BlobEvent::End(true), DfuPhase::TransferActive) => {
                    tracing::info!(index = update.index, "Image received, verifying");
                    self.set_phase(DfuPhase::Verify);
                    self.handler.end(update.index, true);
                }
                (BlobEvent::End(false), DfuPhase::TransferActive | DfuPhase::TransferError { .. }) => {
                    tracing::warn!(index = update.index, "Image transfer failed");
                    self.set_phase(DfuPhase::TransferError { resumable: false });
                    self.handler.end(update.index, false);
                }
                (BlobEvent::Suspended, DfuPhase::TransferActive) => {
                    self.set_phase(DfuPhase::TransferError { resumable: true });
                }
                (BlobEvent::Resume, DfuPhase::TransferError { resumable: true }) => {
                    self.set_phase(DfuPhase::TransferActive);
                }
                (event, phase) => {
                    tracing::debug!(?event, ?phase, "Ignoring BLOB event");
                }
            }
        }
    }

    /// Enter `phase` and persist the update record.
    fn set_phase(&mut self, phase: DfuPhase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "DFU server phase");
            metrics::record_dfu_phase(phase.name());
        }
        self.phase = phase;
        if let Err(e) = self.store() {
            tracing::warn!("Failed to persist update record: {}", e);
            if phase == DfuPhase::TransferActive {
                self.blob.cancel();
                self.blob.handler_mut().events.clear();
                self.phase = DfuPhase::TransferError { resumable: false };
                if let Some(update) = self.update {
                    self.handler.end(update.index, false);
                }
            }
        }
    }

    fn store(&self) -> DfuResult<()> {
        let update = match (self.phase, self.update) {
            (DfuPhase::Idle, _) | (_, None) => {
                self.settings.erase(&self.config.settings_key)?;
                return Ok(());
            }
            (_, Some(update)) => update,
        };
        let rec = PersistedUpdate {
            phase: self.phase,
            image_index: update.index,
            ttl: update.ttl,
            timeout_base: update.timeout_base,
            blob_id: update.blob_id,
            metadata_hash: update.metadata_hash,
            effect: update.effect,
        };
        self.settings
            .store(&self.config.settings_key, &encode_record(&rec)?)?;
        Ok(())
    }

    fn status_of_phase(&self) -> DfuStatus {
        match self.phase {
            DfuPhase::TransferError { .. } => DfuStatus::Internal,
            _ => DfuStatus::Success,
        }
    }

    fn reply_status(&self, ctx: &RecvCtx, status: DfuStatus) {
        let update = match self.phase {
            DfuPhase::Idle => None,
            _ => self.update_info(),
        };
        let msg = DfuMessage::UpdateStatus(UpdateStatus {
            status,
            phase: self.phase,
            effect: self.effect(),
            update,
        });
        self.reply(ctx, msg);
    }

    fn reply(&self, ctx: &RecvCtx, msg: DfuMessage) {
        let ttl = self.update.map(|u| u.ttl).unwrap_or(0);
        let send_ctx = SendCtx {
            dst: ctx.src,
            app_idx: ctx.app_idx,
            ttl,
        };
        if let Err(e) = self.transport.send(&send_ctx, msg.into()) {
            tracing::warn!(dst = ctx.src, "DFU server send failed: {}", e);
        }
    }
}
