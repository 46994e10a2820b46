use serde::{Deserialize, Serialize};

use super::error::NetworkResult;
use super::messages::Message;

/// Mesh address: unicast, group or virtual. The transfer core treats every
/// address as one logical destination.
pub type Addr = u16;

/// Unassigned address, never a valid destination.
pub const ADDR_UNASSIGNED: Addr = 0x0000;

/// Per-send addressing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCtx {
    pub dst: Addr,
    pub app_idx: u16,
    pub ttl: u8,
}

/// Addressing of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvCtx {
    pub src: Addr,
    pub dst: Addr,
    pub app_idx: u16,
}

/// Boundary to the messaging layer (segmentation, ack, encryption).
///
/// Completion of an outbound message is signalled back out of band: the
/// integration calls `tx_complete()` on the client that issued the send.
pub trait Transport: Send + Sync {
    fn send(&self, ctx: &SendCtx, msg: Message) -> NetworkResult<()>;
}
