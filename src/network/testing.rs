//! Transport double for unit tests.

use parking_lot::Mutex;

use super::error::{NetworkError, NetworkResult};
use super::messages::Message;
use super::types::{Addr, SendCtx, Transport};

/// Records every send and can be told to refuse them.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SendCtx, Message)>>,
    fail: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Drain the recorded sends.
    pub fn take(&self) -> Vec<(SendCtx, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Drain the recorded sends, keeping only those to `dst`.
    pub fn take_to(&self, dst: Addr) -> Vec<Message> {
        self.take()
            .into_iter()
            .filter(|(ctx, _)| ctx.dst == dst)
            .map(|(_, m)| m)
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, ctx: &SendCtx, msg: Message) -> NetworkResult<()> {
        if *self.fail.lock() {
            return Err(NetworkError::Unreachable(ctx.dst));
        }
        self.sent.lock().push((*ctx, msg));
        Ok(())
    }
}
