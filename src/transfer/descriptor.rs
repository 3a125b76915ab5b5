//! In-memory image of one database file being transferred.

use std::path::{Path, PathBuf};

use crate::error::{DiagError, Result};
use crate::protocol::qsr::{FileInfo, Guid};

/// Extension of transferred database files.
pub const DB_FILE_EXTENSION: &str = "qdb";

/// A database file: its buffer and which blocks have arrived.
///
/// A read response at `offset` completes block `ceil(offset / block_size)`.
#[derive(Debug, Clone)]
pub struct DbFile {
    guid: Guid,
    file_len: u32,
    block_size: usize,
    buf: Vec<u8>,
    blocks: Vec<bool>,
}

impl DbFile {
    /// Fails with [`DiagError::HugePacket`] when the advertised length
    /// exceeds `max_len`; nothing is allocated in that case.
    pub fn new(info: FileInfo, block_size: usize, max_len: usize) -> Result<Self> {
        let block_size = block_size.max(1);
        let len = info.file_len as usize;
        if len > max_len {
            return Err(DiagError::HugePacket {
                size: len,
                max: max_len,
            });
        }
        Ok(Self {
            guid: info.guid,
            file_len: info.file_len,
            block_size,
            buf: vec![0; len],
            blocks: vec![false; len.div_ceil(block_size)],
        })
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn file_len(&self) -> u32 {
        self.file_len
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Record the data of a read response. Returns the block it completed,
    /// or `None` if the offset names no block of this file.
    pub fn mark(&mut self, offset: u32, data: &[u8]) -> Option<usize> {
        let offset = offset as usize;
        let block = offset.div_ceil(self.block_size);
        if block >= self.blocks.len() {
            tracing::warn!(
                "Read response at offset {} outside {} byte file {}",
                offset,
                self.file_len,
                self.guid
            );
            return None;
        }
        self.blocks[block] = true;
        if offset < self.buf.len() {
            let take = data.len().min(self.buf.len() - offset);
            self.buf[offset..offset + take].copy_from_slice(&data[..take]);
        }
        Some(block)
    }

    /// Blocks not yet received, in order.
    pub fn missing_blocks(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(i, _)| i)
            .collect()
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|done| *done)
    }

    /// Offset of `block`.
    #[inline]
    pub fn block_offset(&self, block: usize) -> u32 {
        (block * self.block_size) as u32
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// `<dir>/<guid>.qdb`
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.{}", self.guid, DB_FILE_EXTENSION))
    }
}
