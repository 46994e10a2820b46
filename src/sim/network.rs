//! In-process mesh channel for driving clients and servers without a radio.
//!
//! Messages are encoded on send and queued; the caller pops and decodes
//! them in order. Loss is random (seeded) and filters drop selected
//! traffic deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::network::{Addr, Message, NetworkError, NetworkResult, RecvCtx, SendCtx, Transport};

/// Channel conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Message loss rate (0.0 - 1.0)
    pub loss_rate: f32,
    /// Seed for the loss generator
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            seed: 0x5eed,
        }
    }
}

impl SimConfig {
    /// No loss at all.
    pub fn perfect() -> Self {
        Self::default()
    }

    /// A congested mesh.
    pub fn lossy() -> Self {
        Self::with_loss(0.1)
    }

    pub fn with_loss(loss_rate: f32) -> Self {
        Self {
            loss_rate,
            ..Default::default()
        }
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Channel counters.
#[derive(Debug, Default)]
pub struct SimStats {
    pub sent: AtomicU64,
    pub delivered: AtomicU64,
    pub lost: AtomicU64,
    pub filtered: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl SimStats {
    pub fn summary(&self) -> String {
        format!(
            "sent: {}, delivered: {}, lost: {}, filtered: {}, bytes: {}",
            self.sent.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
            self.lost.load(Ordering::Relaxed),
            self.filtered.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }
}

/// Drops every message matching all of its set fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropFilter {
    pub src: Option<Addr>,
    pub dst: Option<Addr>,
    pub opcode: Option<&'static str>,
}

impl DropFilter {
    pub fn to(dst: Addr) -> Self {
        Self {
            dst: Some(dst),
            ..Default::default()
        }
    }

    pub fn by(src: Addr) -> Self {
        Self {
            src: Some(src),
            ..Default::default()
        }
    }

    pub fn opcode(mut self, name: &'static str) -> Self {
        self.opcode = Some(name);
        self
    }

    fn matches(&self, src: Addr, dst: Addr, name: &str) -> bool {
        self.src.map_or(true, |s| s == src)
            && self.dst.map_or(true, |d| d == dst)
            && self.opcode.map_or(true, |o| o == name)
    }
}

/// A queued message. `ctx.dst` is the address it was sent to, which for
/// group sends differs from the receiving node `node`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub node: Addr,
    pub ctx: RecvCtx,
    pub name: &'static str,
    payload: Vec<u8>,
}

impl Envelope {
    pub fn decode(&self) -> NetworkResult<Message> {
        Message::decode(&self.payload)
    }
}

struct Inner {
    queue: VecDeque<Envelope>,
    rng: StdRng,
    filters: Vec<DropFilter>,
    groups: HashMap<Addr, Vec<Addr>>,
    down: Vec<Addr>,
    tx_pending: HashMap<Addr, u32>,
}

/// Shared simulated channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct SimNetwork {
    config: SimConfig,
    inner: Arc<Mutex<Inner>>,
    stats: Arc<SimStats>,
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Self {
        let inner = Inner {
            queue: VecDeque::new(),
            rng: StdRng::seed_from_u64(config.seed),
            filters: Vec::new(),
            groups: HashMap::new(),
            down: Vec::new(),
            tx_pending: HashMap::new(),
        };
        Self {
            config,
            inner: Arc::new(Mutex::new(inner)),
            stats: Arc::new(SimStats::default()),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Transport handle for the node at `addr`.
    pub fn link(&self, addr: Addr) -> Arc<dyn Transport> {
        Arc::new(SimLink {
            addr,
            net: self.clone(),
        })
    }

    pub fn add_filter(&self, filter: DropFilter) {
        self.inner.lock().filters.push(filter);
    }

    pub fn clear_filters(&self) {
        self.inner.lock().filters.clear();
    }

    /// Subscribe `node` to `group`.
    pub fn join_group(&self, group: Addr, node: Addr) {
        let mut inner = self.inner.lock();
        let members = inner.groups.entry(group).or_default();
        if !members.contains(&node) {
            members.push(node);
        }
    }

    /// Take a node off the air, or bring it back. Messages to a downed
    /// node are lost and its own sends go nowhere.
    pub fn set_down(&self, node: Addr, down: bool) {
        let mut inner = self.inner.lock();
        inner.down.retain(|&n| n != node);
        if down {
            inner.down.push(node);
        }
    }

    pub fn pop(&self) -> Option<Envelope> {
        let env = self.inner.lock().queue.pop_front()?;
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Some(env)
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of sends by `node` whose completion has not been reported,
    /// resetting the count.
    pub fn take_tx_complete(&self, node: Addr) -> u32 {
        self.inner.lock().tx_pending.remove(&node).unwrap_or(0)
    }

    fn enqueue(&self, src: Addr, ctx: &SendCtx, msg: &Message) -> NetworkResult<()> {
        let payload = msg.encode()?;
        let name = msg.name();
        let mut inner = self.inner.lock();

        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        *inner.tx_pending.entry(src).or_default() += 1;

        if inner.down.contains(&src) {
            self.stats.lost.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let nodes = match inner.groups.get(&ctx.dst) {
            Some(members) => members.clone(),
            None => vec![ctx.dst],
        };

        for node in nodes {
            if inner.down.contains(&node) {
                self.stats.lost.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if inner.filters.iter().any(|f| f.matches(src, node, name)) {
                tracing::trace!(src, dst = node, msg = name, "Filtered");
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if self.config.loss_rate > 0.0 && inner.rng.gen::<f32>() < self.config.loss_rate {
                self.stats.lost.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            inner.queue.push_back(Envelope {
                node,
                ctx: RecvCtx {
                    src,
                    dst: ctx.dst,
                    app_idx: ctx.app_idx,
                },
                name,
                payload: payload.clone(),
            });
        }
        Ok(())
    }
}

/// One node's attachment to a [`SimNetwork`].
pub struct SimLink {
    addr: Addr,
    net: SimNetwork,
}

impl Transport for SimLink {
    fn send(&self, ctx: &SendCtx, msg: Message) -> NetworkResult<()> {
        if ctx.dst == self.addr {
            return Err(NetworkError::Unreachable(ctx.dst));
        }
        self.net.enqueue(self.addr, ctx, &msg)
    }
}
