pub mod error;
pub mod messages;
pub mod types;

pub use error::{NetworkError, NetworkResult};
pub use messages::{
    BlobMessage, DfuMessage, Message, UpdateInfo, UpdateStatus, XferStatus, XferSummary,
};
pub use types::{Addr, RecvCtx, SendCtx, Transport, ADDR_UNASSIGNED};

#[cfg(test)]
pub(crate) mod testing;
