use thiserror::Error;

use super::types::Addr;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Destination unreachable: {0:#06x}")]
    Unreachable(Addr),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unsupported message version: {0}")]
    UnsupportedVersion(u8),
}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::SerializationError(err.to_string())
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
