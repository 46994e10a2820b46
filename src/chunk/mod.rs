pub mod bitfield;
pub mod error;
pub mod io;
pub mod types;

pub use bitfield::Bitfield;
pub use error::{ChunkError, Result, SinkError, SinkResult};
pub use io::{DataSink, FileSink, IoMode, MemorySink, SinkStats};
pub use types::{
    chunk_size_max_for_mtu, Block, Chunk, ChunkBuf, Transfer, XferMode, XferModes,
    BLOCK_SIZE_LOG_MAX, BLOCK_SIZE_LOG_MIN, BLOCK_SIZE_MIN, CHUNK_SIZE_MAX, CHUNK_SIZE_MIN,
    SDU_MAX,
};
