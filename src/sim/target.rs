//! Simulated update target: a [`DfuServer`] with a RAM "flash" that
//! survives reboots.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chunk::{DataSink, MemorySink};
use crate::dfu::{
    DfuEffect, DfuPhase, DfuResult, DfuServer, DfuSrvConfig, DfuSrvHandler, DfuStatus, ImageInfo,
};
use crate::network::{Addr, Message, RecvCtx};
use crate::settings::MemoryStore;

use super::network::SimNetwork;

/// Image metadata as the simulated firmware understands it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub fwid: Vec<u8>,
    pub size: u32,
    pub digest: [u8; 32],
}

impl ImageMetadata {
    pub fn for_image(fwid: &[u8], data: &[u8]) -> Self {
        Self {
            fwid: fwid.to_vec(),
            size: data.len() as u32,
            digest: *blake3::hash(data).as_bytes(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.get(..self.size as usize)
            .is_some_and(|image| *blake3::hash(image).as_bytes() == self.digest)
    }
}

/// Fault injection and declared effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimTargetOpts {
    pub reject_metadata: bool,
    pub fail_verify: bool,
    /// Opcode the target never answers, by [`Message::name`].
    pub ignore_opcode: Option<&'static str>,
    pub effect: DfuEffect,
}

#[derive(Default)]
struct Flash {
    sink: MemorySink,
    staged: Option<ImageMetadata>,
}

/// Firmware-side callbacks of a simulated target.
pub struct SimApp {
    flash: Arc<Mutex<Flash>>,
    opts: SimTargetOpts,
    apply_pending: Option<u8>,
    checks: u32,
}

impl SimApp {
    /// Metadata checks run since boot.
    pub fn checks(&self) -> u32 {
        self.checks
    }
}

impl DfuSrvHandler for SimApp {
    fn check(&mut self, _index: u8, metadata: &[u8]) -> Result<DfuEffect, DfuStatus> {
        self.checks += 1;
        if self.opts.reject_metadata {
            return Err(DfuStatus::Metadata);
        }
        ImageMetadata::decode(metadata)
            .map(|_| self.opts.effect)
            .ok_or(DfuStatus::Metadata)
    }

    fn start(&mut self, _index: u8, metadata: &[u8]) -> Result<Box<dyn DataSink>, DfuStatus> {
        let staged = ImageMetadata::decode(metadata).ok_or(DfuStatus::Metadata)?;
        let sink = MemorySink::new();
        let mut flash = self.flash.lock();
        flash.sink = sink.clone();
        flash.staged = Some(staged);
        Ok(Box::new(sink))
    }

    fn recover(&mut self, _index: u8) -> Option<Box<dyn DataSink>> {
        let flash = self.flash.lock();
        flash.staged.as_ref()?;
        Some(Box::new(flash.sink.clone()))
    }

    fn apply(&mut self, index: u8) -> Result<(), DfuStatus> {
        if self.flash.lock().staged.is_none() {
            return Err(DfuStatus::Internal);
        }
        self.apply_pending = Some(index);
        Ok(())
    }
}

pub struct SimTarget {
    addr: Addr,
    net: SimNetwork,
    config: DfuSrvConfig,
    opts: SimTargetOpts,
    store: MemoryStore,
    flash: Arc<Mutex<Flash>>,
    server: DfuServer<SimApp>,
}

impl SimTarget {
    pub fn new(addr: Addr, net: &SimNetwork, images: Vec<ImageInfo>, opts: SimTargetOpts) -> Self {
        let config = DfuSrvConfig::default();
        let store = MemoryStore::new();
        let flash = Arc::new(Mutex::new(Flash::default()));
        let server = Self::boot(addr, net, &config, images, &store, &flash, opts);
        Self {
            addr,
            net: net.clone(),
            config,
            opts,
            store,
            flash,
            server,
        }
    }

    fn boot(
        addr: Addr,
        net: &SimNetwork,
        config: &DfuSrvConfig,
        images: Vec<ImageInfo>,
        store: &MemoryStore,
        flash: &Arc<Mutex<Flash>>,
        opts: SimTargetOpts,
    ) -> DfuServer<SimApp> {
        let app = SimApp {
            flash: flash.clone(),
            opts,
            apply_pending: None,
            checks: 0,
        };
        DfuServer::new(
            config.clone(),
            images,
            net.link(addr),
            Arc::new(store.clone()),
            app,
        )
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn server(&self) -> &DfuServer<SimApp> {
        &self.server
    }

    pub fn phase(&self) -> DfuPhase {
        self.server.phase()
    }

    pub fn fwid(&self, index: u8) -> Option<&[u8]> {
        self.server
            .images()
            .get(index as usize)
            .map(|i| i.fwid.as_slice())
    }

    /// Bytes written to the staging area so far.
    pub fn staged_image(&self) -> Vec<u8> {
        self.flash.lock().sink.contents()
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn handle_message(&mut self, ctx: &RecvCtx, msg: &Message) {
        if self.opts.ignore_opcode == Some(msg.name()) {
            tracing::trace!(addr = self.addr, msg = msg.name(), "Ignored");
            return;
        }
        self.server.handle_message(ctx, msg);
        self.settle();
    }

    pub fn link_timeout(&mut self) {
        self.server.link_timeout();
        self.settle();
    }

    /// Power-cycle: volatile state is lost, settings and flash are kept.
    pub fn reboot(&mut self) -> DfuResult<DfuPhase> {
        let images = self.server.images().to_vec();
        self.server = Self::boot(
            self.addr,
            &self.net,
            &self.config,
            images,
            &self.store,
            &self.flash,
            self.opts,
        );
        let phase = self.server.restore()?;
        tracing::info!(addr = self.addr, ?phase, "Target rebooted");
        Ok(phase)
    }

    /// Finish verification and application the firmware would run in the
    /// background.
    fn settle(&mut self) {
        if self.server.phase() == DfuPhase::Verify {
            let ok = {
                let flash = self.flash.lock();
                !self.opts.fail_verify
                    && flash
                        .staged
                        .as_ref()
                        .is_some_and(|m| m.matches(&flash.sink.contents()))
            };
            if ok {
                self.server.verified();
            } else {
                self.server.rejected();
            }
        }

        if let Some(index) = self.server.handler_mut().apply_pending.take() {
            let fwid = self.flash.lock().staged.take().map(|m| m.fwid);
            if let Some(fwid) = fwid {
                if let Err(e) = self.server.update_image_fwid(index, fwid) {
                    tracing::warn!(addr = self.addr, "Apply failed: {}", e);
                }
            }
            self.server.applied();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_digest() {
        let data = vec![7u8; 300];
        let meta = ImageMetadata::for_image(b"fw-2", &data);
        let decoded = ImageMetadata::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
        assert!(meta.matches(&data));

        let mut padded = data.clone();
        padded.extend_from_slice(&[0xff; 16]);
        assert!(meta.matches(&padded));
        assert!(!meta.matches(&data[..299]));
        assert!(ImageMetadata::decode(b"\x01").is_none());
    }

    #[test]
    fn test_reject_metadata() {
        let net = SimNetwork::new(Default::default());
        let images = vec![ImageInfo {
            fwid: b"fw-1".to_vec(),
            uri: String::new(),
        }];
        let mut target = SimTarget::new(
            2,
            &net,
            images,
            SimTargetOpts {
                reject_metadata: true,
                ..Default::default()
            },
        );
        let meta = ImageMetadata::for_image(b"fw-2", b"image").encode();
        assert_eq!(
            target.server.handler_mut().check(0, &meta),
            Err(DfuStatus::Metadata)
        );
        assert_eq!(target.phase(), DfuPhase::Idle);
        assert_eq!(target.reboot().unwrap(), DfuPhase::Idle);
    }
}
