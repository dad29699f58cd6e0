use std::io::{self, Read, Write};

use super::error::{BlobError, BlobResult};
use super::{BlobHandle, BlockId, BlockKind, StoreState};

/// Sequential writer into one file of a `BlobFileSystem`
///
/// The head block's length and tail pointer are updated on every write, so
/// dropping the writer needs no I/O.
pub struct BlobWriter<'a> {
    state: &'a mut StoreState,
    head: BlockId,
    /// Block receiving the next byte
    block: BlockId,
    /// Offset of the next byte within `block`
    position: usize,
    hint: Option<&'a mut Option<BlockId>>,
}

impl<'a> BlobWriter<'a> {
    pub(super) fn new(
        state: &'a mut StoreState,
        head: BlockId,
        block: BlockId,
        position: usize,
        hint: Option<&'a mut Option<BlockId>>,
    ) -> Self {
        Self {
            state,
            head,
            block,
            position,
            hint,
        }
    }

    /// Handle of the file being written
    pub fn handle(&self) -> BlobHandle {
        self.head as BlobHandle
    }

    /// Write as much of `buf` as fits in the current block
    fn write_chunk(&mut self, buf: &[u8]) -> BlobResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let capacity = self.state.capacity();
        if self.position == capacity {
            self.block = self.state.chain_block(self.block)?;
            self.position = 0;
            if let Some(hint) = self.hint.as_deref_mut() {
                *hint = Some(self.block);
            }
        }

        let n = buf.len().min(capacity - self.position);
        {
            let block = self.state.block_mut(self.block)?;
            block.data[self.position..self.position + n].copy_from_slice(&buf[..n]);
        }
        self.position += n;

        let head = self.state.block_mut(self.head)?;
        head.length += n as u64;
        head.last = Some(self.block);
        Ok(n)
    }
}

impl Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_chunk(buf)?)
    }

    /// Flush the whole store to disk
    fn flush(&mut self) -> io::Result<()> {
        Ok(self.state.flush()?)
    }
}

/// Sequential reader over one file of a `BlobFileSystem`
pub struct BlobReader<'a> {
    state: &'a mut StoreState,
    /// Block holding the next byte
    block: BlockId,
    /// Offset of the next byte within `block`
    position: usize,
    /// Bytes left before the end of the file
    remaining: u64,
}

impl<'a> BlobReader<'a> {
    pub(super) fn new(state: &'a mut StoreState, head: BlockId, length: u64) -> Self {
        Self {
            state,
            block: head,
            position: 0,
            remaining: length,
        }
    }

    /// Bytes left before end of file
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> BlobResult<usize> {
        if buf.is_empty() || self.remaining == 0 {
            return Ok(0);
        }

        let capacity = self.state.capacity();
        if self.position == capacity {
            self.block = self.state.block(self.block)?.next.ok_or_else(|| {
                BlobError::Corrupted(format!(
                    "chain ends at block {} with {} bytes unread",
                    self.block, self.remaining
                ))
            })?;
            self.position = 0;
        }

        let n = (buf.len() as u64)
            .min((capacity - self.position) as u64)
            .min(self.remaining) as usize;

        let block = self.state.block(self.block)?;
        if !matches!(block.kind, BlockKind::Head | BlockKind::Data) {
            return Err(BlobError::Corrupted(format!(
                "block {} in a file chain is {:?}",
                self.block, block.kind
            )));
        }
        buf[..n].copy_from_slice(&block.data[self.position..self.position + n]);

        self.position += n;
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl Read for BlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_chunk(buf)?)
    }
}
