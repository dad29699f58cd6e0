//! Block-chained store for variable-length files inside one container file
//!
//! Each logical file is a chain of fixed-size blocks. The index of the
//! first (head) block is the file's handle; the head records the file
//! length and the last block of the chain so appends never walk it.
//!
//! Freed blocks go onto one of two LIFO stacks linked through the blocks
//! themselves: former head blocks on the handle stack, former continuation
//! blocks on the data stack. `alloc_file` reissues the most recently freed
//! handle first, and growing a chain reuses freed data blocks before the
//! container file is extended.

mod block;
mod error;
mod stream;


pub use block::{BLOCK_HEADER_SIZE, Block, BlockId, BlockKind, StoreHeader};
pub use error::{BlobError, BlobResult};
pub use stream::{BlobReader, BlobWriter};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::{BlobOptions, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::file::{CacheMetrics, PageCache, PagedFile};
use block::STORE_HEADER_SIZE;

/// Handle of a file inside the store
pub type BlobHandle = u32;

/// A container of block-chained files
pub struct BlobFileSystem {
    path: PathBuf,
    options: BlobOptions,
    metrics: Arc<CacheMetrics>,
    state: Option<StoreState>,
}

/// Everything that exists until the store is disposed
struct StoreState {
    cache: PageCache<Block>,
    header: StoreHeader,
}

impl BlobFileSystem {
    /// Open (or create) the store at `path` with its own diagnostics counters
    pub fn open(path: impl AsRef<Path>, options: BlobOptions) -> BlobResult<Self> {
        Self::open_with_metrics(path, options, CacheMetrics::new())
    }

    /// Open (or create) the store at `path`, reporting cache usage into `metrics`
    pub fn open_with_metrics(
        path: impl AsRef<Path>,
        options: BlobOptions,
        metrics: Arc<CacheMetrics>,
    ) -> BlobResult<Self> {
        let path = path.as_ref().to_path_buf();
        let block_size = options.block_size;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(BlobError::InvalidBlockSize(block_size));
        }

        let mut file = PagedFile::open(&path, block_size)?;
        let is_new = file.is_empty()?;
        let header = if is_new {
            StoreHeader::new(block_size)
        } else {
            read_header(&mut file)?
        };

        let mut state = StoreState {
            cache: PageCache::new(file, options.cache_blocks, Arc::clone(&metrics)),
            header,
        };
        if is_new {
            state.write_header()?;
            state.cache.file_mut().sync()?;
        }

        debug!(
            path = %path.display(),
            files = state.header.file_count,
            blocks = state.header.block_count,
            created = is_new,
            "opened blob store"
        );

        Ok(Self {
            path,
            options,
            metrics,
            state: Some(state),
        })
    }

    /// Flush everything and release the container file
    ///
    /// Later calls do nothing; every other operation fails with `Disposed`.
    pub fn dispose(&mut self) -> BlobResult<()> {
        if let Some(mut state) = self.state.take() {
            state.flush()?;
            debug!(path = %self.path.display(), "disposed blob store");
        }
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &BlobOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Payload bytes per block
    pub fn block_capacity(&self) -> usize {
        self.options.block_size - BLOCK_HEADER_SIZE
    }

    /// Number of live files
    pub fn file_count(&self) -> BlobResult<usize> {
        Ok(self.state()?.header.file_count as usize)
    }

    /// Blocks in the container, including the header and free blocks
    pub fn block_count(&self) -> BlobResult<usize> {
        Ok(self.state()?.header.block_count)
    }

    /// Current length of a file in bytes
    pub fn file_len(&mut self, handle: BlobHandle) -> BlobResult<u64> {
        let state = self.state_mut()?;
        Ok(state.head(handle)?.length)
    }

    /// Create an empty file and return a writer at its start
    ///
    /// The most recently deleted handle is reused first.
    pub fn alloc_file(&mut self) -> BlobResult<BlobWriter<'_>> {
        let state = self.state_mut()?;
        let capacity = state.capacity();

        let head_id = match state.header.free_handle_head {
            Some(free_id) => {
                state.header.free_handle_head = state.pop_free(free_id, BlockKind::FreeHandle)?;
                free_id
            }
            None => state.take_block()?,
        };

        state.cache.insert(head_id, Block::head(head_id, capacity))?;
        state.header.file_count += 1;
        trace!(handle = head_id, "allocated blob file");

        Ok(BlobWriter::new(state, head_id, head_id, 0, None))
    }

    /// Return a writer positioned at the end of `handle`
    ///
    /// The head block records the tail, so the position comes from there.
    /// `hint` is overwritten with the tail block and kept current by the
    /// writer as it chains new blocks.
    pub fn append_file<'a>(
        &'a mut self,
        handle: BlobHandle,
        hint: &'a mut Option<BlockId>,
    ) -> BlobResult<BlobWriter<'a>> {
        let state = self.state_mut()?;
        let capacity = state.capacity() as u64;

        let (tail, length) = {
            let head = state.head(handle)?;
            let tail = head.last.unwrap_or(handle as BlockId);
            (tail, head.length)
        };

        *hint = Some(tail);

        // A full tail block reports position == capacity; the first write chains a new one
        let position = if length == 0 {
            0
        } else {
            ((length - 1) % capacity + 1) as usize
        };

        Ok(BlobWriter::new(state, handle as BlockId, tail, position, Some(hint)))
    }

    /// Return a reader over the current content of `handle`
    ///
    /// The reader stops at the length the file had when it was opened.
    pub fn get_file_reader(&mut self, handle: BlobHandle) -> BlobResult<BlobReader<'_>> {
        let state = self.state_mut()?;
        let length = state.head(handle)?.length;
        Ok(BlobReader::new(state, handle as BlockId, length))
    }

    /// Truncate `handle` to zero length and return a writer at its start
    ///
    /// The handle and head block stay the same; continuation blocks are freed.
    pub fn rewrite_file(&mut self, handle: BlobHandle) -> BlobResult<BlobWriter<'_>> {
        let state = self.state_mut()?;
        let first = state.head(handle)?.next;
        state.release_chain(first)?;

        let head_id = handle as BlockId;
        let head = state.block_mut(head_id)?;
        head.next = None;
        head.last = Some(head_id);
        head.length = 0;

        Ok(BlobWriter::new(state, head_id, head_id, 0, None))
    }

    /// Free every block of `handle` and push the handle onto the free stack
    pub fn delete_file(&mut self, handle: BlobHandle) -> BlobResult<()> {
        let state = self.state_mut()?;
        let first = state.head(handle)?.next;
        state.release_chain(first)?;

        let head_id = handle as BlockId;
        state.cache.insert(
            head_id,
            Block::free(BlockKind::FreeHandle, state.header.free_handle_head),
        )?;
        state.header.free_handle_head = Some(head_id);
        state.header.file_count -= 1;
        trace!(handle, "deleted blob file");
        Ok(())
    }

    /// Write every dirty block and the header without disposing
    pub fn flush(&mut self) -> BlobResult<()> {
        self.state_mut()?.flush()
    }

    fn state(&self) -> BlobResult<&StoreState> {
        self.state.as_ref().ok_or(BlobError::Disposed)
    }

    fn state_mut(&mut self) -> BlobResult<&mut StoreState> {
        self.state.as_mut().ok_or(BlobError::Disposed)
    }
}

impl Drop for BlobFileSystem {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

/// Read and validate the header of a non-empty container
fn read_header(file: &mut PagedFile) -> BlobResult<StoreHeader> {
    let file_len = file.len()?;
    if file_len < STORE_HEADER_SIZE as u64 {
        return Err(BlobError::Corrupted(format!(
            "file of {file_len} bytes is too short for a header"
        )));
    }

    let mut buf = [0u8; STORE_HEADER_SIZE];
    file.read_prefix(&mut buf)?;
    let header = StoreHeader::decode(&buf)?;

    if header.block_size != file.page_size() {
        return Err(BlobError::BlockSizeMismatch {
            expected: file.page_size(),
            actual: header.block_size,
        });
    }
    header.validate(file_len)?;
    Ok(header)
}

impl StoreState {
    fn capacity(&self) -> usize {
        self.header.block_size - BLOCK_HEADER_SIZE
    }

    fn write_header(&mut self) -> BlobResult<()> {
        let mut buf = vec![0u8; self.header.block_size];
        self.header.encode(&mut buf);
        self.cache.file_mut().write_page(0, &buf)?;
        Ok(())
    }

    fn flush(&mut self) -> BlobResult<()> {
        self.cache.flush_all()?;
        self.write_header()?;
        self.cache.file_mut().sync()?;
        Ok(())
    }

    fn check_block(&self, block_id: BlockId) -> BlobResult<()> {
        if block_id == 0 || block_id >= self.header.block_count {
            return Err(BlobError::Corrupted(format!(
                "block pointer {block_id} outside the {} allocated blocks",
                self.header.block_count
            )));
        }
        Ok(())
    }

    fn block(&mut self, block_id: BlockId) -> BlobResult<&Block> {
        self.check_block(block_id)?;
        self.cache.get(block_id)
    }

    fn block_mut(&mut self, block_id: BlockId) -> BlobResult<&mut Block> {
        self.check_block(block_id)?;
        self.cache.get_mut(block_id)
    }

    /// Head block of a live file
    fn head(&mut self, handle: BlobHandle) -> BlobResult<&Block> {
        let block_id = handle as BlockId;
        if block_id == 0 || block_id >= self.header.block_count {
            return Err(BlobError::InvalidHandle(handle));
        }
        match self.cache.get(block_id)? {
            block if block.kind == BlockKind::Head => Ok(block),
            _ => Err(BlobError::InvalidHandle(handle)),
        }
    }

    /// Read the successor of a free-stack entry, checking its kind
    fn pop_free(&mut self, block_id: BlockId, kind: BlockKind) -> BlobResult<Option<BlockId>> {
        let block = self.block(block_id)?;
        if block.kind != kind {
            return Err(BlobError::Corrupted(format!(
                "block {block_id} on the {kind:?} stack is {:?}",
                block.kind
            )));
        }
        Ok(block.next)
    }

    /// Get a block for new use: the top of the data stack, or a fresh one
    ///
    /// The caller must insert the block's new content.
    fn take_block(&mut self) -> BlobResult<BlockId> {
        match self.header.free_block_head {
            Some(free_id) => {
                self.header.free_block_head = self.pop_free(free_id, BlockKind::FreeData)?;
                Ok(free_id)
            }
            None => {
                let block_id = self.header.block_count;
                self.header.block_count += 1;
                trace!(block_id, "grew blob store");
                Ok(block_id)
            }
        }
    }

    /// Append a fresh continuation block after `tail`
    fn chain_block(&mut self, tail: BlockId) -> BlobResult<BlockId> {
        let block_id = self.take_block()?;
        let capacity = self.capacity();
        self.cache.insert(block_id, Block::data(capacity))?;
        self.block_mut(tail)?.next = Some(block_id);
        Ok(block_id)
    }

    /// Push every block from `first` to the end of its chain onto the data stack
    fn release_chain(&mut self, first: Option<BlockId>) -> BlobResult<()> {
        let mut current = first;
        let mut released = 0usize;

        while let Some(block_id) = current {
            released += 1;
            if released > self.header.block_count {
                return Err(BlobError::Corrupted(format!("cycle in chain at block {block_id}")));
            }

            let block = self.block(block_id)?;
            if block.kind != BlockKind::Data {
                return Err(BlobError::Corrupted(format!(
                    "block {block_id} in a file chain is {:?}",
                    block.kind
                )));
            }
            current = block.next;

            self.cache.insert(
                block_id,
                Block::free(BlockKind::FreeData, self.header.free_block_head),
            )?;
            self.header.free_block_head = Some(block_id);
        }

        if released > 0 {
            trace!(blocks = released, "released blob chain");
        }
        Ok(())
    }
}
