//! Data sinks: where transferred bytes are read from and written to.
//!
//! A sink is exclusively owned by one transfer at a time. Chunk buffers are
//! borrowed for the duration of a single call and never retained.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::error::{SinkError, SinkResult};
use super::types::{Block, Chunk, ChunkBuf, Transfer};

/// Value of erased flash.
const ERASED: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

pub trait DataSink: Send {
    fn open(&mut self, xfer: &Transfer, mode: IoMode) -> SinkResult<()>;

    fn close(&mut self, _xfer: &Transfer) {}

    /// Called before the first chunk of a block. Flash-backed sinks erase
    /// the covered region here.
    fn block_start(&mut self, _xfer: &Transfer, _block: &Block) -> SinkResult<()> {
        Ok(())
    }

    fn block_end(&mut self, _xfer: &Transfer, _block: &Block) {}

    /// Fill `chunk.data` with the bytes at `block.offset + chunk.offset`.
    fn read(&mut self, xfer: &Transfer, block: &Block, chunk: &mut ChunkBuf<'_>) -> SinkResult<()>;

    /// Store `chunk.data` at `block.offset + chunk.offset`.
    fn write(&mut self, xfer: &Transfer, block: &Block, chunk: &Chunk<'_>) -> SinkResult<()>;
}

/// Counters kept by [`MemorySink`], mostly useful in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub opens: u32,
    pub closes: u32,
    pub blocks_started: u32,
    pub blocks_ended: u32,
    pub chunks_written: u32,
    pub chunks_read: u32,
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Vec<u8>,
    mode: Option<IoMode>,
    erase_on_block_start: bool,
    fail_writes: bool,
    stats: SinkStats,
}

/// In-memory sink. Clones share the same buffer, so a test can keep a
/// handle while the transfer owns the boxed sink.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read source backed by an existing image.
    pub fn from_bytes(data: Bytes) -> Self {
        let sink = Self::default();
        sink.inner.write().data = data.to_vec();
        sink
    }

    /// Emulate flash: erase each block's region when the block starts.
    pub fn with_erase(self) -> Self {
        self.inner.write().erase_on_block_start = true;
        self
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.write().fail_writes = fail;
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.read().data.clone()
    }

    pub fn stats(&self) -> SinkStats {
        self.inner.read().stats.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().mode.is_some()
    }
}

fn check_bounds(offset: u64, len: usize, capacity: u64) -> SinkResult<()> {
    if offset + len as u64 > capacity {
        return Err(SinkError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

impl DataSink for MemorySink {
    fn open(&mut self, xfer: &Transfer, mode: IoMode) -> SinkResult<()> {
        let mut inner = self.inner.write();
        match mode {
            IoMode::Write => {
                // Reopening for a resumed transfer must keep what is there.
                if inner.data.len() < xfer.size as usize {
                    inner.data.resize(xfer.size as usize, ERASED);
                }
            }
            IoMode::Read => {
                if inner.data.len() < xfer.size as usize {
                    return Err(SinkError::OutOfBounds {
                        offset: 0,
                        len: xfer.size as usize,
                        capacity: inner.data.len() as u64,
                    });
                }
            }
        }
        inner.mode = Some(mode);
        inner.stats.opens += 1;
        Ok(())
    }

    fn close(&mut self, _xfer: &Transfer) {
        let mut inner = self.inner.write();
        inner.mode = None;
        inner.stats.closes += 1;
    }

    fn block_start(&mut self, _xfer: &Transfer, block: &Block) -> SinkResult<()> {
        let mut inner = self.inner.write();
        if inner.mode != Some(IoMode::Write) {
            return Err(SinkError::ReadOnly);
        }
        if inner.erase_on_block_start {
            let start = block.offset as usize;
            let end = start + block.size as usize;
            check_bounds(block.offset as u64, block.size as usize, inner.data.len() as u64)?;
            inner.data[start..end].fill(ERASED);
        }
        inner.stats.blocks_started += 1;
        Ok(())
    }

    fn block_end(&mut self, _xfer: &Transfer, _block: &Block) {
        self.inner.write().stats.blocks_ended += 1;
    }

    fn read(&mut self, _xfer: &Transfer, block: &Block, chunk: &mut ChunkBuf<'_>) -> SinkResult<()> {
        let mut inner = self.inner.write();
        if inner.mode.is_none() {
            return Err(SinkError::NotOpen);
        }
        let offset = block.offset as u64 + chunk.offset as u64;
        check_bounds(offset, chunk.data.len(), inner.data.len() as u64)?;
        let start = offset as usize;
        chunk
            .data
            .copy_from_slice(&inner.data[start..start + chunk.data.len()]);
        inner.stats.chunks_read += 1;
        Ok(())
    }

    fn write(&mut self, _xfer: &Transfer, block: &Block, chunk: &Chunk<'_>) -> SinkResult<()> {
        let mut inner = self.inner.write();
        match inner.mode {
            None => return Err(SinkError::NotOpen),
            Some(IoMode::Read) => return Err(SinkError::ReadOnly),
            Some(IoMode::Write) => {}
        }
        if inner.fail_writes {
            return Err(SinkError::Other("injected write failure".into()));
        }
        let offset = block.offset as u64 + chunk.offset as u64;
        check_bounds(offset, chunk.data.len(), inner.data.len() as u64)?;
        let start = offset as usize;
        inner.data[start..start + chunk.data.len()].copy_from_slice(chunk.data);
        inner.stats.chunks_written += 1;
        Ok(())
    }
}

/// Sink backed by a regular file, laid out like a flash partition.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    mode: Option<IoMode>,
    erase_on_block_start: bool,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            mode: None,
            erase_on_block_start: true,
        }
    }

    pub fn without_erase(mut self) -> Self {
        self.erase_on_block_start = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> SinkResult<&mut File> {
        self.file.as_mut().ok_or(SinkError::NotOpen)
    }
}

impl DataSink for FileSink {
    fn open(&mut self, xfer: &Transfer, mode: IoMode) -> SinkResult<()> {
        let file = match mode {
            IoMode::Read => File::open(&self.path)?,
            IoMode::Write => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.path)?;
                if file.metadata()?.len() < xfer.size as u64 {
                    file.set_len(xfer.size as u64)?;
                }
                file
            }
        };
        self.file = Some(file);
        self.mode = Some(mode);
        Ok(())
    }

    fn close(&mut self, _xfer: &Transfer) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(path = %self.path.display(), "flush on close failed: {}", e);
            }
        }
        self.mode = None;
    }

    fn block_start(&mut self, _xfer: &Transfer, block: &Block) -> SinkResult<()> {
        if self.mode != Some(IoMode::Write) {
            return Err(SinkError::ReadOnly);
        }
        if self.erase_on_block_start {
            let erased = vec![ERASED; block.size as usize];
            let file = self.file()?;
            file.seek(SeekFrom::Start(block.offset as u64))?;
            file.write_all(&erased)?;
        }
        Ok(())
    }

    fn read(&mut self, _xfer: &Transfer, block: &Block, chunk: &mut ChunkBuf<'_>) -> SinkResult<()> {
        let offset = block.offset as u64 + chunk.offset as u64;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut chunk.data[..])?;
        Ok(())
    }

    fn write(&mut self, xfer: &Transfer, block: &Block, chunk: &Chunk<'_>) -> SinkResult<()> {
        if self.mode != Some(IoMode::Write) {
            return Err(SinkError::ReadOnly);
        }
        let offset = block.offset as u64 + chunk.offset as u64;
        check_bounds(offset, chunk.data.len(), xfer.size as u64)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(chunk.data)?;
        Ok(())
    }
}
