//! BLOB transfer server: receives one object at a time into a data sink.

use std::sync::Arc;

use crate::chunk::{
    chunk_size_max_for_mtu, Bitfield, Block, Chunk, DataSink, IoMode, Transfer, XferMode,
};
use crate::metrics;
use crate::network::{
    Addr, BlobMessage, RecvCtx, SendCtx, Transport, XferStatus, XferSummary,
    ADDR_UNASSIGNED,
};
use crate::settings::{decode_record, encode_record, PersistedXfer, SettingsStore};

use super::error::{BlobError, BlobResult};
use super::types::{BlobSrvConfig, BlobStatus, MissingChunks, ServerPhase};

/// Application callbacks of a BLOB server.
pub trait BlobSrvHandler: Send {
    /// A transfer start was accepted by the protocol checks. Returning an
    /// error status rejects it.
    fn start(&mut self, _xfer: &Transfer) -> Result<(), BlobStatus> {
        Ok(())
    }

    /// The transfer ended, successfully or not.
    fn end(&mut self, id: u64, success: bool);

    fn suspended(&mut self) {}

    fn resume(&mut self) {}

    /// Re-obtain the data sink of a transfer that was interrupted by a
    /// reboot. Returning `None` abandons the transfer.
    fn recover(&mut self, _xfer: &Transfer) -> Option<Box<dyn DataSink>> {
        None
    }
}

struct ActiveBlock {
    block: Block,
    chunks: Bitfield,
    /// Chunks requested by the last partial block report (pull mode).
    window: Vec<u16>,
}

struct XferState {
    ttl: u8,
    timeout_base: u16,
    client: Addr,
    app_idx: u16,
    mtu_size: u16,
    /// Shape of the transfer. `size` is zero until the start arrives and
    /// `chunk_size` is zero until the first block starts.
    xfer: Transfer,
    blocks: Bitfield,
    block: Option<ActiveBlock>,
    io: Option<Box<dyn DataSink>>,
    io_open: bool,
    idle_windows: u32,
}

impl XferState {
    fn new(id: u64, io: Box<dyn DataSink>, ttl: u8, timeout_base: u16) -> Self {
        Self {
            ttl,
            timeout_base,
            client: ADDR_UNASSIGNED,
            app_idx: 0,
            mtu_size: 0,
            xfer: Transfer::new(id, 0, 0, 0, XferMode::Push),
            blocks: Bitfield::default(),
            block: None,
            io: Some(io),
            io_open: false,
            idle_windows: 0,
        }
    }

    fn from_record(rec: PersistedXfer) -> Self {
        Self {
            ttl: rec.ttl,
            timeout_base: rec.timeout_base,
            client: rec.client,
            app_idx: rec.app_idx,
            mtu_size: rec.mtu_size,
            xfer: rec.xfer,
            blocks: rec.blocks,
            block: None,
            io: None,
            io_open: false,
            idle_windows: 0,
        }
    }

    fn started(&self) -> bool {
        self.xfer.size > 0
    }

    fn summary(&self) -> Option<XferSummary> {
        self.started().then(|| XferSummary {
            id: self.xfer.id,
            size: self.xfer.size,
            block_size_log: self.xfer.block_size_log,
            mtu_size: self.mtu_size,
            mode: self.xfer.mode,
        })
    }

    fn close_io(&mut self) {
        if self.io_open {
            if let Some(io) = self.io.as_mut() {
                io.close(&self.xfer);
            }
            self.io_open = false;
        }
    }
}

pub struct BlobServer<H: BlobSrvHandler> {
    config: BlobSrvConfig,
    transport: Arc<dyn Transport>,
    settings: Arc<dyn SettingsStore>,
    handler: H,
    phase: ServerPhase,
    state: Option<XferState>,
    gauge: metrics::TransferGauge,
}

impl<H: BlobSrvHandler> BlobServer<H> {
    pub fn new(
        config: BlobSrvConfig,
        transport: Arc<dyn Transport>,
        settings: Arc<dyn SettingsStore>,
        handler: H,
    ) -> Self {
        Self {
            config,
            transport,
            settings,
            handler,
            phase: ServerPhase::Inactive,
            state: None,
            gauge: metrics::TransferGauge::default(),
        }
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    pub fn config(&self) -> &BlobSrvConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// ID of the armed or last transfer.
    pub fn transfer_id(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.xfer.id)
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.state.as_ref().filter(|s| s.started()).map(|s| &s.xfer)
    }

    pub fn blocks_received(&self) -> Option<&Bitfield> {
        self.state.as_ref().filter(|s| s.started()).map(|s| &s.blocks)
    }

    /// Percentage of blocks received.
    pub fn progress(&self) -> u8 {
        match self.blocks_received() {
            Some(blocks) if !blocks.is_empty() => {
                (blocks.count() as u64 * 100 / blocks.len() as u64) as u8
            }
            _ => 0,
        }
    }

    /// Arm the server for transfer `id`.
    ///
    /// Returns [`BlobError::Busy`] without touching the current transfer
    /// unless the server is inactive, complete or in error. A resumable
    /// error with the same `id` keeps the blocks already received.
    pub fn recv(
        &mut self,
        id: u64,
        io: Box<dyn DataSink>,
        ttl: u8,
        timeout_base: u16,
    ) -> BlobResult<()> {
        if self.phase.is_busy() {
            return Err(BlobError::Busy);
        }

        let resume = matches!(self.phase, ServerPhase::TransferError { resumable: true })
            && self.transfer_id() == Some(id);
        match self.state.as_mut() {
            Some(state) if resume => {
                tracing::info!(id, blocks = state.blocks.count(), "Resuming BLOB transfer");
                state.io = Some(io);
                state.io_open = false;
                state.ttl = ttl;
                state.timeout_base = timeout_base;
                state.block = None;
                state.idle_windows = 0;
            }
            old => {
                if let Some(old) = old {
                    old.close_io();
                }
                tracing::info!(id, "Armed BLOB server");
                self.state = Some(XferState::new(id, io, ttl, timeout_base));
            }
        }

        self.set_phase(ServerPhase::WaitingForStart);
        Ok(())
    }

    /// Abandon the current transfer. Idempotent.
    pub fn cancel(&mut self) {
        let notify = !matches!(self.phase, ServerPhase::Inactive | ServerPhase::Complete);
        let id = self.state.as_ref().map(|s| s.xfer.id);
        if let Some(state) = self.state.as_mut() {
            state.close_io();
        }
        self.state = None;
        self.phase = ServerPhase::Inactive;
        self.gauge.failed("cancelled");
        if let Err(e) = self.settings.erase(&self.config.settings_key) {
            tracing::warn!("Failed to erase BLOB progress: {}", e);
        }

        if let (true, Some(id)) = (notify, id) {
            tracing::info!(id, "BLOB transfer cancelled");
            self.handler.end(id, false);
        }
    }

    /// Reload persisted progress after a reboot.
    pub fn restore(&mut self) -> BlobResult<ServerPhase> {
        let bytes = match self.settings.load(&self.config.settings_key)? {
            Some(bytes) => bytes,
            None => return Ok(self.phase),
        };
        let rec: PersistedXfer = match decode_record(&bytes) {
            Ok(rec) => rec,
            Err(e) => {
                tracing::warn!("Discarding unreadable BLOB progress: {}", e);
                self.settings.erase(&self.config.settings_key)?;
                return Ok(self.phase);
            }
        };

        if rec.xfer.size > 0 && rec.blocks.len() != rec.xfer.block_count() {
            tracing::warn!(id = rec.transfer_id, "Discarding BLOB progress with a bad block map");
            self.settings.erase(&self.config.settings_key)?;
            return Ok(self.phase);
        }

        let stored = rec.phase;
        let mut state = XferState::from_record(rec);
        let phase = match stored {
            ServerPhase::Inactive => {
                self.settings.erase(&self.config.settings_key)?;
                return Ok(self.phase);
            }
            ServerPhase::WaitingForChunk => ServerPhase::TransferError { resumable: true },
            ServerPhase::WaitingForStart | ServerPhase::WaitingForBlock | ServerPhase::Suspended => {
                match self.handler.recover(&state.xfer) {
                    Some(io) => {
                        state.io = Some(io);
                        if stored == ServerPhase::WaitingForStart {
                            ServerPhase::WaitingForStart
                        } else {
                            ServerPhase::Suspended
                        }
                    }
                    None => {
                        let id = state.xfer.id;
                        tracing::warn!(id, "No data sink to recover BLOB transfer");
                        self.settings.erase(&self.config.settings_key)?;
                        self.handler.end(id, false);
                        return Ok(self.phase);
                    }
                }
            }
            other => other,
        };

        tracing::info!(id = state.xfer.id, ?stored, ?phase, "Restored BLOB transfer");
        self.state = Some(state);
        self.set_phase(phase);
        Ok(self.phase)
    }

    /// One retransmission window elapsed without traffic from the client.
    pub fn link_timeout(&mut self) {
        if !self.phase.is_receiving() {
            return;
        }
        let Some(state) = self.state.as_mut() else {
            return;
        };
        state.idle_windows += 1;
        let (id, windows, mode) = (state.xfer.id, state.idle_windows, state.xfer.mode);

        if windows >= self.config.suspend_after_windows {
            tracing::info!(id, windows, "BLOB transfer suspended");
            self.set_phase(ServerPhase::Suspended);
            if self.phase == ServerPhase::Suspended {
                self.handler.suspended();
            }
            return;
        }

        if self.phase == ServerPhase::WaitingForChunk && mode == XferMode::Pull {
            self.send_report();
        }
    }

    pub fn handle_message(&mut self, ctx: &RecvCtx, msg: &BlobMessage) {
        if let Some(state) = self.state.as_mut() {
            if state.client == ctx.src {
                state.idle_windows = 0;
            }
        }

        match msg {
            BlobMessage::InfoGet => {
                let caps = self.config.caps;
                self.reply(ctx, BlobMessage::InfoStatus { caps });
            }
            BlobMessage::XferGet => self.reply_xfer_status(ctx, BlobStatus::Success),
            BlobMessage::XferStart {
                id,
                size,
                block_size_log,
                mtu_size,
                mode,
            } => {
                let status = self.xfer_start(ctx, *id, *size, *block_size_log, *mtu_size, *mode);
                self.reply_xfer_status(ctx, status);
            }
            BlobMessage::XferCancel { id } => {
                let status = if self.transfer_id() == Some(*id) {
                    self.cancel();
                    BlobStatus::Success
                } else {
                    BlobStatus::WrongBlobId
                };
                self.reply_xfer_status(ctx, status);
            }
            BlobMessage::BlockGet => self.reply_block_status(ctx, BlobStatus::Success, None),
            BlobMessage::BlockStart { block, chunk_size } => {
                let status = self.block_start(*block, *chunk_size);
                self.reply_block_status(ctx, status, Some(*block));
                if status.is_success()
                    && self.phase == ServerPhase::WaitingForChunk
                    && self.state.as_ref().is_some_and(|s| s.xfer.mode == XferMode::Pull)
                {
                    self.send_report();
                }
            }
            BlobMessage::ChunkTransfer { chunk, data } => self.chunk(*chunk, data),
            BlobMessage::InfoStatus { .. }
            | BlobMessage::XferStatus(_)
            | BlobMessage::BlockStatus { .. }
            | BlobMessage::PartialBlockReport { .. } => {
                tracing::debug!(src = ctx.src, "Ignoring client-bound message");
            }
        }
    }

    fn xfer_start(
        &mut self,
        ctx: &RecvCtx,
        id: u64,
        size: u32,
        block_size_log: u8,
        mtu_size: u16,
        mode: XferMode,
    ) -> BlobStatus {
        let phase = self.phase;
        let Some(state) = self.state.as_mut() else {
            return BlobStatus::WrongPhase;
        };
        if state.xfer.id != id {
            return BlobStatus::WrongBlobId;
        }
        let same_shape = state.started()
            && state.xfer.size == size
            && state.xfer.block_size_log == block_size_log
            && state.xfer.mode == mode;

        match phase {
            ServerPhase::WaitingForStart => {}
            ServerPhase::Suspended if same_shape => {
                state.client = ctx.src;
                state.mtu_size = mtu_size;
                if !state.io_open {
                    if let Err(status) = Self::open_io(state) {
                        self.abort();
                        return status;
                    }
                }
                tracing::info!(id, "BLOB transfer resumed");
                self.gauge.started(size as u64);
                self.set_phase(ServerPhase::WaitingForBlock);
                if self.phase == ServerPhase::WaitingForBlock {
                    self.handler.resume();
                }
                return self.status_of_phase();
            }
            ServerPhase::WaitingForBlock | ServerPhase::WaitingForChunk | ServerPhase::Complete
                if same_shape =>
            {
                return BlobStatus::Success;
            }
            ServerPhase::Inactive | ServerPhase::TransferError { .. } => {
                return BlobStatus::WrongPhase;
            }
            _ => return BlobStatus::InvalidParam,
        }

        if let Err(status) = self.config.caps.check_start(size, block_size_log, mode) {
            tracing::debug!(id, ?status, "Rejected BLOB transfer start");
            return status;
        }
        if chunk_size_max_for_mtu(mtu_size) == 0 {
            return BlobStatus::InvalidParam;
        }

        let xfer = Transfer::new(id, size, block_size_log, 0, mode);
        if let Err(status) = self.handler.start(&xfer) {
            return status;
        }

        if !same_shape {
            state.blocks = Bitfield::new(xfer.block_count());
        }
        state.xfer = xfer;
        state.client = ctx.src;
        state.app_idx = ctx.app_idx;
        state.mtu_size = mtu_size;
        state.block = None;

        if let Err(status) = Self::open_io(state) {
            self.abort();
            return status;
        }

        tracing::info!(
            id,
            size,
            block_size_log,
            ?mode,
            resumed_blocks = state.blocks.count(),
            "BLOB transfer started"
        );
        self.gauge.started(size as u64);

        if state.blocks.is_full() {
            self.complete();
        } else {
            self.set_phase(ServerPhase::WaitingForBlock);
        }
        self.status_of_phase()
    }

    fn open_io(state: &mut XferState) -> Result<(), BlobStatus> {
        let Some(io) = state.io.as_mut() else {
            return Err(BlobStatus::Internal);
        };
        match io.open(&state.xfer, IoMode::Write) {
            Ok(()) => {
                state.io_open = true;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to open data sink: {}", e);
                Err(BlobStatus::Internal)
            }
        }
    }

    fn block_start(&mut self, number: u16, chunk_size: u16) -> BlobStatus {
        match self.phase {
            ServerPhase::WaitingForBlock | ServerPhase::WaitingForChunk | ServerPhase::Complete => {}
            _ => return BlobStatus::WrongPhase,
        }
        let Some(state) = self.state.as_mut() else {
            return BlobStatus::WrongPhase;
        };

        if number as u32 >= state.xfer.block_count() {
            return BlobStatus::InvalidBlockNumber;
        }
        if state.blocks.get(number as u32) {
            return BlobStatus::Success;
        }
        if let Some(active) = state.block.as_ref() {
            if active.block.number == number && self.phase == ServerPhase::WaitingForChunk {
                return if state.xfer.chunk_size == chunk_size {
                    BlobStatus::Success
                } else {
                    BlobStatus::InvalidChunkSize
                };
            }
        }
        if state.blocks.first_clear() != Some(number as u32) {
            tracing::debug!(block = number, "Out of order block start");
            return BlobStatus::InvalidBlockNumber;
        }
        if chunk_size > chunk_size_max_for_mtu(state.mtu_size) {
            return BlobStatus::InvalidChunkSize;
        }
        if let Err(status) = self
            .config
            .caps
            .check_chunk_size(state.xfer.block_size_log, chunk_size)
        {
            return status;
        }

        state.xfer.chunk_size = chunk_size;
        let block = match state.xfer.block(number) {
            Ok(block) => block,
            Err(_) => return BlobStatus::InvalidBlockNumber,
        };

        let started = match state.io.as_mut() {
            Some(io) => io.block_start(&state.xfer, &block),
            None => Err(crate::chunk::SinkError::NotOpen),
        };
        if let Err(e) = started {
            tracing::warn!(block = number, "Data sink refused block start: {}", e);
            self.abort();
            return BlobStatus::Internal;
        }

        tracing::debug!(block = number, chunks = block.chunk_count, "Block started");
        state.block = Some(ActiveBlock {
            block,
            chunks: Bitfield::new(block.chunk_count as u32),
            window: Vec::new(),
        });
        self.set_phase(ServerPhase::WaitingForChunk);
        self.status_of_phase()
    }

    fn chunk(&mut self, index: u16, data: &[u8]) {
        if self.phase != ServerPhase::WaitingForChunk {
            tracing::debug!(chunk = index, phase = ?self.phase, "Dropping chunk outside a block");
            return;
        }
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let Some(active) = state.block.as_mut() else {
            return;
        };

        let expected = match active.block.chunk_len(index, state.xfer.chunk_size) {
            Ok(len) => len,
            Err(e) => {
                tracing::debug!("Dropping chunk: {}", e);
                return;
            }
        };
        if data.len() != expected {
            tracing::debug!(chunk = index, len = data.len(), expected, "Dropping chunk of wrong size");
            return;
        }
        if active.chunks.get(index as u32) {
            return;
        }

        let chunk = Chunk {
            offset: active.block.chunk_offset(index, state.xfer.chunk_size),
            data,
        };
        let written = match state.io.as_mut() {
            Some(io) => io.write(&state.xfer, &active.block, &chunk),
            None => Err(crate::chunk::SinkError::NotOpen),
        };
        if let Err(e) = written {
            tracing::warn!(chunk = index, block = active.block.number, "Chunk write failed: {}", e);
            self.abort();
            return;
        }

        active.chunks.set(index as u32);
        metrics::record_chunk_received(data.len());

        if active.chunks.is_full() {
            self.block_complete();
        } else if state.xfer.mode == XferMode::Pull
            && active.window.iter().all(|c| active.chunks.get(*c as u32))
        {
            self.send_report();
        }
    }

    fn block_complete(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let Some(active) = state.block.as_ref() else {
            return;
        };
        let block = active.block;
        if let Some(io) = state.io.as_mut() {
            io.block_end(&state.xfer, &block);
        }
        state.blocks.set(block.number as u32);
        metrics::record_block_complete();
        tracing::debug!(
            block = block.number,
            received = state.blocks.count(),
            total = state.blocks.len(),
            "Block complete"
        );

        if state.xfer.mode == XferMode::Pull {
            self.send_report();
        }

        let Some(state) = self.state.as_ref() else {
            return;
        };
        if state.blocks.is_full() {
            self.complete();
        } else {
            self.set_phase(ServerPhase::WaitingForBlock);
        }
    }

    fn complete(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        state.close_io();
        let id = state.xfer.id;
        self.set_phase(ServerPhase::Complete);
        if self.phase == ServerPhase::Complete {
            tracing::info!(id, "BLOB transfer complete");
            self.gauge.completed();
            self.handler.end(id, true);
        }
    }

    /// Fail the transfer without a way back.
    fn abort(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        state.close_io();
        state.block = None;
        let id = state.xfer.id;
        self.phase = ServerPhase::TransferError { resumable: false };
        if let Err(e) = self.store() {
            tracing::warn!(id, "Failed to persist BLOB transfer error: {}", e);
        }
        tracing::warn!(id, "BLOB transfer aborted");
        self.gauge.failed("aborted");
        self.handler.end(id, false);
    }

    /// Enter `phase` and persist it. A failed write aborts the transfer.
    fn set_phase(&mut self, phase: ServerPhase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "BLOB server phase");
        }
        self.phase = phase;
        if let Err(e) = self.store() {
            tracing::warn!("Failed to persist BLOB progress: {}", e);
            self.abort();
        }
    }

    fn store(&self) -> BlobResult<()> {
        let Some(state) = self.state.as_ref() else {
            return Ok(());
        };
        let rec = PersistedXfer {
            transfer_id: state.xfer.id,
            ttl: state.ttl,
            timeout_base: state.timeout_base,
            mtu_size: state.mtu_size,
            client: state.client,
            app_idx: state.app_idx,
            xfer: state.xfer,
            blocks: state.blocks.clone(),
            phase: self.phase,
        };
        self.settings
            .store(&self.config.settings_key, &encode_record(&rec)?)?;
        Ok(())
    }

    fn status_of_phase(&self) -> BlobStatus {
        match self.phase {
            ServerPhase::TransferError { .. } => BlobStatus::Internal,
            _ => BlobStatus::Success,
        }
    }

    fn send_report(&mut self) {
        let per_report = self.config.pull_chunks_per_report.max(1) as usize;
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let chunks = match state.block.as_mut() {
            Some(active) => {
                active.window = active
                    .chunks
                    .iter_clear()
                    .take(per_report)
                    .map(|c| c as u16)
                    .collect();
                active.window.clone()
            }
            None => return,
        };
        let ctx = SendCtx {
            dst: state.client,
            app_idx: state.app_idx,
            ttl: state.ttl,
        };
        self.send(&ctx, BlobMessage::PartialBlockReport { chunks });
    }

    fn reply_xfer_status(&mut self, ctx: &RecvCtx, status: BlobStatus) {
        let state = self.state.as_ref();
        let msg = BlobMessage::XferStatus(XferStatus {
            status,
            phase: self.phase,
            xfer: state.and_then(|s| s.summary()),
            blocks: state.filter(|s| s.started()).map(|s| s.blocks.clone()),
        });
        self.reply(ctx, msg);
    }

    fn reply_block_status(&mut self, ctx: &RecvCtx, status: BlobStatus, number: Option<u16>) {
        let status = match (status, self.phase) {
            (
                BlobStatus::Success,
                ServerPhase::WaitingForBlock | ServerPhase::WaitingForChunk | ServerPhase::Complete,
            ) => BlobStatus::Success,
            (BlobStatus::Success, _) => BlobStatus::WrongPhase,
            (status, _) => status,
        };
        let (block, chunk_size, missing) = self.block_report(number);
        self.reply(
            ctx,
            BlobMessage::BlockStatus {
                status,
                block,
                chunk_size,
                missing,
            },
        );
    }

    /// Missing chunks of block `number`, or of the active block.
    fn block_report(&self, number: Option<u16>) -> (u16, u16, MissingChunks) {
        let Some(state) = self.state.as_ref() else {
            return (number.unwrap_or(0), 0, MissingChunks::All);
        };
        let chunk_size = state.xfer.chunk_size;
        let Some(number) = number.or(state.block.as_ref().map(|a| a.block.number)) else {
            return (0, chunk_size, MissingChunks::All);
        };

        if state.blocks.get(number as u32) {
            return (number, chunk_size, MissingChunks::Complete);
        }
        match state.block.as_ref() {
            Some(active) if active.block.number == number => {
                (number, chunk_size, MissingChunks::from_received(&active.chunks))
            }
            _ => (number, chunk_size, MissingChunks::All),
        }
    }

    fn reply(&self, ctx: &RecvCtx, msg: BlobMessage) {
        let ttl = self.state.as_ref().map(|s| s.ttl).unwrap_or(0);
        let send_ctx = SendCtx {
            dst: ctx.src,
            app_idx: ctx.app_idx,
            ttl,
        };
        self.send(&send_ctx, msg);
    }

    fn send(&self, ctx: &SendCtx, msg: BlobMessage) {
        if let Err(e) = self.transport.send(ctx, msg.into()) {
            tracing::warn!(dst = ctx.dst, "BLOB server send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{MemorySink, BLOCK_SIZE_MIN};
    use crate::network::testing::RecordingTransport;
    use crate::network::Message;
    use crate::settings::MemoryStore;

    const CLIENT: Addr = 0x0001;

    #[derive(Default)]
    struct Recorder {
        ends: Vec<(u64, bool)>,
        suspended: u32,
        resumed: u32,
        recover: Option<MemorySink>,
    }

    impl BlobSrvHandler for Recorder {
        fn end(&mut self, id: u64, success: bool) {
            self.ends.push((id, success));
        }

        fn suspended(&mut self) {
            self.suspended += 1;
        }

        fn resume(&mut self) {
            self.resumed += 1;
        }

        fn recover(&mut self, _xfer: &Transfer) -> Option<Box<dyn DataSink>> {
            self.recover.take().map(|s| Box::new(s) as Box<dyn DataSink>)
        }
    }

    struct Fixture {
        srv: BlobServer<Recorder>,
        net: Arc<RecordingTransport>,
        store: MemoryStore,
        sink: MemorySink,
    }

    fn fixture() -> Fixture {
        let net = Arc::new(RecordingTransport::new());
        let store = MemoryStore::new();
        let srv = BlobServer::new(
            BlobSrvConfig::default(),
            net.clone(),
            Arc::new(store.clone()),
            Recorder::default(),
        );
        Fixture {
            srv,
            net,
            store,
            sink: MemorySink::new(),
        }
    }

    fn ctx() -> RecvCtx {
        RecvCtx {
            src: CLIENT,
            dst: 0x0100,
            app_idx: 0,
        }
    }

    fn image(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn start(f: &mut Fixture, id: u64, size: u32, mode: XferMode) {
        f.srv
            .recv(id, Box::new(f.sink.clone()), 0, 10)
            .unwrap();
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::XferStart {
                id,
                size,
                block_size_log: 12,
                mtu_size: 380,
                mode,
            },
        );
    }

    fn send_block(f: &mut Fixture, data: &[u8], number: u16) {
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::BlockStart {
                block: number,
                chunk_size: 377,
            },
        );
        let offset = number as usize * BLOCK_SIZE_MIN as usize;
        let end = (offset + BLOCK_SIZE_MIN as usize).min(data.len());
        for (i, chunk) in data[offset..end].chunks(377).enumerate() {
            f.srv.handle_message(
                &ctx(),
                &BlobMessage::ChunkTransfer {
                    chunk: i as u16,
                    data: chunk.to_vec(),
                },
            );
        }
    }

    #[test]
    fn test_two_block_push_transfer() {
        let mut f = fixture();
        let data = image(2 * BLOCK_SIZE_MIN as usize);
        start(&mut f, 1, data.len() as u32, XferMode::Push);
        assert_eq!(f.srv.phase(), ServerPhase::WaitingForBlock);

        send_block(&mut f, &data, 0);
        assert_eq!(f.srv.phase(), ServerPhase::WaitingForBlock);
        assert_eq!(f.srv.progress(), 50);
        send_block(&mut f, &data, 1);

        assert_eq!(f.srv.phase(), ServerPhase::Complete);
        assert_eq!(f.srv.handler().ends, vec![(1, true)]);
        assert!(f.srv.blocks_received().unwrap().is_full());
        assert_eq!(f.sink.contents(), data);
        assert!(!f.sink.is_open());
    }

    #[test]
    fn test_second_recv_is_refused() {
        let mut f = fixture();
        f.srv.recv(1, Box::new(f.sink.clone()), 0, 10).unwrap();
        let again = f.srv.recv(2, Box::new(MemorySink::new()), 0, 10);
        assert!(matches!(again, Err(BlobError::Busy)));
        assert_eq!(f.srv.phase(), ServerPhase::WaitingForStart);
        assert_eq!(f.srv.transfer_id(), Some(1));
    }

    #[test]
    fn test_out_of_order_block_rejected() {
        let mut f = fixture();
        let data = image(2 * BLOCK_SIZE_MIN as usize);
        start(&mut f, 1, data.len() as u32, XferMode::Push);
        f.net.take();

        f.srv.handle_message(
            &ctx(),
            &BlobMessage::BlockStart {
                block: 1,
                chunk_size: 377,
            },
        );
        let replies = f.net.take_to(CLIENT);
        assert!(matches!(
            replies.as_slice(),
            [Message::Blob(BlobMessage::BlockStatus {
                status: BlobStatus::InvalidBlockNumber,
                ..
            })]
        ));
        assert_eq!(f.srv.phase(), ServerPhase::WaitingForBlock);

        f.srv.handle_message(
            &ctx(),
            &BlobMessage::ChunkTransfer {
                chunk: 0,
                data: vec![0; 377],
            },
        );
        assert_eq!(f.sink.stats().chunks_written, 0);
    }

    #[test]
    fn test_wrong_size_chunk_dropped() {
        let mut f = fixture();
        start(&mut f, 1, 1000, XferMode::Push);
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::BlockStart {
                block: 0,
                chunk_size: 377,
            },
        );
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::ChunkTransfer {
                chunk: 2,
                data: vec![0; 377],
            },
        );
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::ChunkTransfer {
                chunk: 3,
                data: vec![0; 10],
            },
        );
        assert_eq!(f.sink.stats().chunks_written, 0);
        assert_eq!(f.srv.phase(), ServerPhase::WaitingForChunk);
    }

    #[test]
    fn test_start_rejected_by_caps_keeps_waiting() {
        let mut f = fixture();
        f.srv.recv(1, Box::new(f.sink.clone()), 0, 10).unwrap();
        f.net.take();
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::XferStart {
                id: 1,
                size: 100,
                block_size_log: 9,
                mtu_size: 380,
                mode: XferMode::Push,
            },
        );
        match f.net.take_to(CLIENT).as_slice() {
            [Message::Blob(BlobMessage::XferStatus(s))] => {
                assert_eq!(s.status, BlobStatus::InvalidBlockSize);
            }
            other => panic!("unexpected replies {other:?}"),
        }
        assert_eq!(f.srv.phase(), ServerPhase::WaitingForStart);
    }

    #[test]
    fn test_write_failure_aborts() {
        let mut f = fixture();
        let data = image(BLOCK_SIZE_MIN as usize);
        start(&mut f, 3, data.len() as u32, XferMode::Push);
        f.sink.set_fail_writes(true);
        send_block(&mut f, &data, 0);
        assert_eq!(
            f.srv.phase(),
            ServerPhase::TransferError { resumable: false }
        );
        assert_eq!(f.srv.handler().ends, vec![(3, false)]);
    }

    #[test]
    fn test_persistence_failure_aborts() {
        let mut f = fixture();
        let data = image(2 * BLOCK_SIZE_MIN as usize);
        start(&mut f, 4, data.len() as u32, XferMode::Push);
        f.store.set_fail_writes(true);
        send_block(&mut f, &data, 0);
        assert!(matches!(
            f.srv.phase(),
            ServerPhase::TransferError { resumable: false }
        ));
        assert_eq!(f.srv.handler().ends, vec![(4, false)]);
    }

    #[test]
    fn test_reboot_mid_block_resumes_from_next_block() {
        let mut f = fixture();
        let data = image(3 * BLOCK_SIZE_MIN as usize);
        start(&mut f, 9, data.len() as u32, XferMode::Push);
        send_block(&mut f, &data, 0);
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::BlockStart {
                block: 1,
                chunk_size: 377,
            },
        );
        assert_eq!(f.srv.phase(), ServerPhase::WaitingForChunk);

        // power loss: a new instance on the same store
        let mut srv = BlobServer::new(
            BlobSrvConfig::default(),
            f.net.clone(),
            Arc::new(f.store.clone()),
            Recorder::default(),
        );
        assert_eq!(
            srv.restore().unwrap(),
            ServerPhase::TransferError { resumable: true }
        );
        srv.recv(9, Box::new(f.sink.clone()), 0, 10).unwrap();
        f.srv = srv;
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::XferStart {
                id: 9,
                size: data.len() as u32,
                block_size_log: 12,
                mtu_size: 380,
                mode: XferMode::Push,
            },
        );
        let blocks = f.srv.blocks_received().unwrap();
        assert!(blocks.get(0));
        assert!(!blocks.get(1));

        let written_before = f.sink.stats().chunks_written;
        send_block(&mut f, &data, 1);
        send_block(&mut f, &data, 2);
        assert_eq!(f.srv.phase(), ServerPhase::Complete);
        assert_eq!(f.sink.contents(), data);
        // block 0 was never sent again
        assert_eq!(f.sink.stats().chunks_written - written_before, 22);
    }

    #[test]
    fn test_restore_waiting_for_block_needs_recovered_sink() {
        let mut f = fixture();
        let data = image(2 * BLOCK_SIZE_MIN as usize);
        start(&mut f, 5, data.len() as u32, XferMode::Push);
        send_block(&mut f, &data, 0);

        let mut without = BlobServer::new(
            BlobSrvConfig::default(),
            f.net.clone(),
            Arc::new(f.store.clone()),
            Recorder::default(),
        );
        // keep the record for the second instance
        let saved = f.store.load("blob_srv/0").unwrap().unwrap();
        assert_eq!(without.restore().unwrap(), ServerPhase::Inactive);
        assert_eq!(without.handler().ends, vec![(5, false)]);

        f.store.store("blob_srv/0", &saved).unwrap();
        let recorder = Recorder {
            recover: Some(f.sink.clone()),
            ..Default::default()
        };
        let mut with = BlobServer::new(
            BlobSrvConfig::default(),
            f.net.clone(),
            Arc::new(f.store.clone()),
            recorder,
        );
        assert_eq!(with.restore().unwrap(), ServerPhase::Suspended);
        with.handle_message(
            &ctx(),
            &BlobMessage::XferStart {
                id: 5,
                size: data.len() as u32,
                block_size_log: 12,
                mtu_size: 380,
                mode: XferMode::Push,
            },
        );
        assert_eq!(with.phase(), ServerPhase::WaitingForBlock);
        assert_eq!(with.handler().resumed, 1);
    }

    #[test]
    fn test_idle_link_suspends_and_start_resumes() {
        let mut f = fixture();
        let data = image(2 * BLOCK_SIZE_MIN as usize);
        start(&mut f, 6, data.len() as u32, XferMode::Push);
        send_block(&mut f, &data, 0);

        for _ in 0..f.srv.config().suspend_after_windows {
            f.srv.link_timeout();
        }
        assert_eq!(f.srv.phase(), ServerPhase::Suspended);
        assert_eq!(f.srv.handler().suspended, 1);
        assert!(f.sink.is_open());

        f.srv.handle_message(
            &ctx(),
            &BlobMessage::XferStart {
                id: 6,
                size: data.len() as u32,
                block_size_log: 12,
                mtu_size: 380,
                mode: XferMode::Push,
            },
        );
        assert_eq!(f.srv.phase(), ServerPhase::WaitingForBlock);
        send_block(&mut f, &data, 1);
        assert_eq!(f.srv.phase(), ServerPhase::Complete);
        assert_eq!(f.sink.contents(), data);
    }

    #[test]
    fn test_pull_mode_reports_missing_chunks() {
        let mut f = fixture();
        start(&mut f, 7, BLOCK_SIZE_MIN, XferMode::Pull);
        f.net.take();
        f.srv.handle_message(
            &ctx(),
            &BlobMessage::BlockStart {
                block: 0,
                chunk_size: 377,
            },
        );
        let replies = f.net.take_to(CLIENT);
        assert_eq!(replies.len(), 2);
        match &replies[1] {
            Message::Blob(BlobMessage::PartialBlockReport { chunks }) => {
                assert_eq!(chunks, &(0..8).collect::<Vec<u16>>());
            }
            other => panic!("unexpected {other:?}"),
        }

        let data = image(BLOCK_SIZE_MIN as usize);
        for (i, chunk) in data.chunks(377).enumerate().take(8) {
            f.srv.handle_message(
                &ctx(),
                &BlobMessage::ChunkTransfer {
                    chunk: i as u16,
                    data: chunk.to_vec(),
                },
            );
        }
        match f.net.take_to(CLIENT).as_slice() {
            [Message::Blob(BlobMessage::PartialBlockReport { chunks })] => {
                assert_eq!(chunks, &vec![8, 9, 10]);
            }
            other => panic!("unexpected {other:?}"),
        }

        f.srv.link_timeout();
        assert_eq!(f.net.take_to(CLIENT).len(), 1);

        for (i, chunk) in data.chunks(377).enumerate().skip(8) {
            f.srv.handle_message(
                &ctx(),
                &BlobMessage::ChunkTransfer {
                    chunk: i as u16,
                    data: chunk.to_vec(),
                },
            );
        }
        match f.net.take_to(CLIENT).as_slice() {
            [Message::Blob(BlobMessage::PartialBlockReport { chunks })] => assert!(chunks.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.srv.phase(), ServerPhase::Complete);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut f = fixture();
        start(&mut f, 8, 1000, XferMode::Push);
        f.srv.cancel();
        f.srv.cancel();
        assert_eq!(f.srv.phase(), ServerPhase::Inactive);
        assert_eq!(f.srv.handler().ends, vec![(8, false)]);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_active_gauge_only_tracks_started_transfers() {
        let mut f = fixture();
        f.srv.recv(3, Box::new(f.sink.clone()), 0, 10).unwrap();
        f.srv.cancel();
        assert!(!f.srv.gauge.is_active());

        start(&mut f, 4, 1000, XferMode::Push);
        assert!(f.srv.gauge.is_active());
        f.srv.cancel();
        assert!(!f.srv.gauge.is_active());
        assert_eq!(f.srv.handler().ends, vec![(3, false), (4, false)]);
    }

    #[test]
    fn test_restore_discards_inconsistent_block_map() {
        let mut f = fixture();
        let rec = PersistedXfer {
            transfer_id: 9,
            ttl: 0,
            timeout_base: 10,
            mtu_size: 380,
            client: CLIENT,
            app_idx: 0,
            xfer: Transfer::new(9, 3 * BLOCK_SIZE_MIN, 12, 377, XferMode::Push),
            blocks: Bitfield::new(40),
            phase: ServerPhase::Suspended,
        };
        f.store
            .store(&BlobSrvConfig::default().settings_key, &encode_record(&rec).unwrap())
            .unwrap();
        f.srv.handler_mut().recover = Some(f.sink.clone());

        assert_eq!(f.srv.restore().unwrap(), ServerPhase::Inactive);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_block_get_after_completion_reports_complete() {
        let mut f = fixture();
        let data = image(2 * BLOCK_SIZE_MIN as usize);
        start(&mut f, 2, data.len() as u32, XferMode::Push);
        send_block(&mut f, &data, 0);
        f.net.take();
        f.srv.handle_message(&ctx(), &BlobMessage::BlockGet);
        match f.net.take_to(CLIENT).as_slice() {
            [Message::Blob(BlobMessage::BlockStatus {
                status, block, missing, ..
            })] => {
                assert_eq!(*status, BlobStatus::Success);
                assert_eq!(*block, 0);
                assert_eq!(*missing, MissingChunks::Complete);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
