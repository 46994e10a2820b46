use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Invalid block size log: {0}")]
    InvalidBlockSize(u8),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Block {block} out of range (transfer has {count} blocks)")]
    BlockOutOfRange { block: u16, count: u16 },

    #[error("Chunk {chunk} out of range (block has {count} chunks)")]
    ChunkOutOfRange { chunk: u16, count: u16 },

    #[error("Empty transfer")]
    EmptyTransfer,
}

/// Failures reported by a data sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink not open")]
    NotOpen,

    #[error("Sink opened read-only")]
    ReadOnly,

    #[error("Access out of bounds: offset {offset}, len {len}, capacity {capacity}")]
    OutOfBounds { offset: u64, len: usize, capacity: u64 },

    #[error("Sink failure: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ChunkError>;
pub type SinkResult<T> = std::result::Result<T, SinkError>;
