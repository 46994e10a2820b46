use serde::{Deserialize, Serialize};

use super::error::{ChunkError, Result};

/// Smallest block size exponent the protocol can express.
pub const BLOCK_SIZE_LOG_MIN: u8 = 6;
/// Largest block size exponent the protocol can express.
pub const BLOCK_SIZE_LOG_MAX: u8 = 20;
/// Largest access SDU carried by the transport (after the MIC).
pub const SDU_MAX: u16 = 380;
/// Opcode and chunk number in front of every chunk payload.
pub const CHUNK_SDU_OVERHEAD: u16 = 3;
/// Largest chunk payload that fits one SDU.
pub const CHUNK_SIZE_MAX: u16 = SDU_MAX - CHUNK_SDU_OVERHEAD;
/// Smallest useful chunk payload.
pub const CHUNK_SIZE_MIN: u16 = 8;

/// Default block size of the reference configuration (4 KiB).
pub const BLOCK_SIZE_MIN: u32 = 1 << 12;

/// Largest chunk payload a given MTU can carry.
pub fn chunk_size_max_for_mtu(mtu: u16) -> u16 {
    mtu.saturating_sub(CHUNK_SDU_OVERHEAD).min(CHUNK_SIZE_MAX)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum XferMode {
    /// Client streams chunks unsolicited.
    Push,
    /// Server requests the chunks it is missing.
    Pull,
}

/// Set of transfer modes a node supports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct XferModes {
    pub push: bool,
    pub pull: bool,
}

impl XferModes {
    pub const ALL: XferModes = XferModes {
        push: true,
        pull: true,
    };

    pub fn only(mode: XferMode) -> Self {
        match mode {
            XferMode::Push => Self {
                push: true,
                pull: false,
            },
            XferMode::Pull => Self {
                push: false,
                pull: true,
            },
        }
    }

    pub fn supports(&self, mode: XferMode) -> bool {
        match mode {
            XferMode::Push => self.push,
            XferMode::Pull => self.pull,
        }
    }

    pub fn intersect(&self, other: &XferModes) -> XferModes {
        XferModes {
            push: self.push && other.push,
            pull: self.pull && other.pull,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.push && !self.pull
    }
}

/// One binary object being moved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transfer {
    pub id: u64,
    pub size: u32,
    pub block_size_log: u8,
    pub chunk_size: u16,
    pub mode: XferMode,
}

impl Transfer {
    pub fn new(id: u64, size: u32, block_size_log: u8, chunk_size: u16, mode: XferMode) -> Self {
        Self {
            id,
            size,
            block_size_log,
            chunk_size,
            mode,
        }
    }

    /// Random transfer ID, unique enough for one collision domain.
    pub fn generate_id() -> u64 {
        uuid::Uuid::new_v4().as_u128() as u64
    }

    /// Check that the geometry describes at least one block and chunk.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(ChunkError::EmptyTransfer);
        }
        if !(BLOCK_SIZE_LOG_MIN..=BLOCK_SIZE_LOG_MAX).contains(&self.block_size_log) {
            return Err(ChunkError::InvalidBlockSize(self.block_size_log));
        }
        if self.chunk_size < CHUNK_SIZE_MIN || self.chunk_size > CHUNK_SIZE_MAX {
            return Err(ChunkError::InvalidChunkSize(format!(
                "{} not in {}..={}",
                self.chunk_size, CHUNK_SIZE_MIN, CHUNK_SIZE_MAX
            )));
        }
        if self.block_count() > u16::MAX as u32 {
            return Err(ChunkError::InvalidBlockSize(self.block_size_log));
        }
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        1u32 << self.block_size_log
    }

    pub fn block_count(&self) -> u32 {
        self.size.div_ceil(self.block_size())
    }

    /// Geometry of block `number`. The last block may be short.
    pub fn block(&self, number: u16) -> Result<Block> {
        let count = self.block_count();
        if number as u32 >= count {
            return Err(ChunkError::BlockOutOfRange {
                block: number,
                count: count.min(u16::MAX as u32) as u16,
            });
        }

        let offset = number as u32 * self.block_size();
        let size = (self.size - offset).min(self.block_size());
        Ok(Block {
            number,
            offset,
            size,
            chunk_count: size.div_ceil(self.chunk_size.max(1) as u32) as u16,
        })
    }
}

/// Numbered contiguous byte range of a transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub number: u16,
    pub offset: u32,
    pub size: u32,
    pub chunk_count: u16,
}

impl Block {
    /// Block-relative offset of chunk `index`.
    pub fn chunk_offset(&self, index: u16, chunk_size: u16) -> u32 {
        index as u32 * chunk_size as u32
    }

    /// Expected payload size of chunk `index`. The last chunk may be short.
    pub fn chunk_len(&self, index: u16, chunk_size: u16) -> Result<usize> {
        if index >= self.chunk_count {
            return Err(ChunkError::ChunkOutOfRange {
                chunk: index,
                count: self.chunk_count,
            });
        }
        let offset = self.chunk_offset(index, chunk_size);
        Ok((self.size - offset).min(chunk_size as u32) as usize)
    }
}

/// Chunk payload handed to a sink for writing. Borrowed for one call only.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    /// Offset relative to the start of the block.
    pub offset: u32,
    pub data: &'a [u8],
}

impl Chunk<'_> {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Chunk buffer a sink fills when reading.
#[derive(Debug)]
pub struct ChunkBuf<'a> {
    /// Offset relative to the start of the block.
    pub offset: u32,
    pub data: &'a mut [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xfer(size: u32, chunk_size: u16) -> Transfer {
        Transfer::new(1, size, 12, chunk_size, XferMode::Push)
    }

    #[test]
    fn test_block_geometry() {
        let t = xfer(2 * BLOCK_SIZE_MIN + 100, 377);
        assert_eq!(t.block_count(), 3);

        let b0 = t.block(0).unwrap();
        assert_eq!(b0.offset, 0);
        assert_eq!(b0.size, 4096);
        assert_eq!(b0.chunk_count, 11);

        let last = t.block(2).unwrap();
        assert_eq!(last.offset, 8192);
        assert_eq!(last.size, 100);
        assert_eq!(last.chunk_count, 1);

        assert!(t.block(3).is_err());
    }

    #[test]
    fn test_last_chunk_is_short() {
        let t = xfer(BLOCK_SIZE_MIN, 377);
        let b = t.block(0).unwrap();
        assert_eq!(b.chunk_len(0, 377).unwrap(), 377);
        assert_eq!(b.chunk_len(10, 377).unwrap(), 4096 - 10 * 377);
        assert!(b.chunk_len(11, 377).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        assert!(xfer(0, 377).validate().is_err());
        assert!(xfer(100, 4).validate().is_err());
        assert!(xfer(100, CHUNK_SIZE_MAX + 1).validate().is_err());
        assert!(Transfer::new(1, 100, 3, 100, XferMode::Pull).validate().is_err());
        assert!(xfer(100, 377).validate().is_ok());
    }

    #[test]
    fn test_chunk_size_for_mtu() {
        assert_eq!(chunk_size_max_for_mtu(380), 377);
        assert_eq!(chunk_size_max_for_mtu(100), 97);
        assert_eq!(chunk_size_max_for_mtu(1000), CHUNK_SIZE_MAX);
    }

    #[test]
    fn test_modes() {
        assert!(XferModes::ALL.supports(XferMode::Pull));
        let push = XferModes::only(XferMode::Push);
        assert!(!push.supports(XferMode::Pull));
        assert!(push.intersect(&XferModes::only(XferMode::Pull)).is_empty());
    }
}
