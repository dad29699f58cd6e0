//! On-disk layout of blob store blocks
//!
//! Block 0 holds the store header. Every other block starts with a
//! 32-byte block header:
//!
//! ```text
//! [0]      kind (1 = head, 2 = data, 3 = free handle, 4 = free data)
//! [4..8]   next block in the chain or free stack (u32::MAX = none)
//! [8..12]  last block of the file (head only)
//! [16..24] file length in bytes (head only)
//! [32..]   payload
//! ```

use crate::file::{CachedPage, PageId, decode_page_ref, encode_page_ref, read_u32, read_u64};

use super::error::{BlobError, BlobResult};

/// Index of a block within the store file
pub type BlockId = PageId;

/// Magic number for blob store files: "OMBF" in ASCII
pub const MAGIC_NUMBER: u32 = 0x4F4D_4246;

pub const VERSION: u32 = 1;

/// Bytes at the start of every block before its payload
pub const BLOCK_HEADER_SIZE: usize = 32;

/// Bytes of block 0 used by the store header
pub const STORE_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// First block of a live file; its index is the file handle
    Head,
    /// Continuation block of a live file
    Data,
    /// Former head block, on the free handle stack
    FreeHandle,
    /// Former continuation block, on the free data stack
    FreeData,
}

impl BlockKind {
    fn tag(self) -> u8 {
        match self {
            BlockKind::Head => 1,
            BlockKind::Data => 2,
            BlockKind::FreeHandle => 3,
            BlockKind::FreeData => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(BlockKind::Head),
            2 => Some(BlockKind::Data),
            3 => Some(BlockKind::FreeHandle),
            4 => Some(BlockKind::FreeData),
            _ => None,
        }
    }

    pub fn is_free(self) -> bool {
        matches!(self, BlockKind::FreeHandle | BlockKind::FreeData)
    }
}

/// A deserialized block
///
/// Free blocks carry no payload in memory; live blocks always carry a
/// payload of exactly the block capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub next: Option<BlockId>,
    pub last: Option<BlockId>,
    pub length: u64,
    pub data: Vec<u8>,
}

impl Block {
    /// Head block of an empty file
    pub fn head(handle: BlockId, capacity: usize) -> Self {
        Self {
            kind: BlockKind::Head,
            next: None,
            last: Some(handle),
            length: 0,
            data: vec![0u8; capacity],
        }
    }

    /// Empty continuation block
    pub fn data(capacity: usize) -> Self {
        Self {
            kind: BlockKind::Data,
            next: None,
            last: None,
            length: 0,
            data: vec![0u8; capacity],
        }
    }

    /// Entry on one of the free stacks
    pub fn free(kind: BlockKind, next: Option<BlockId>) -> Self {
        debug_assert!(kind.is_free());
        Self {
            kind,
            next,
            last: None,
            length: 0,
            data: Vec::new(),
        }
    }
}

impl CachedPage for Block {
    type Error = BlobError;

    fn decode(page_id: PageId, buf: &[u8]) -> BlobResult<Self> {
        let kind = BlockKind::from_tag(buf[0]).ok_or_else(|| {
            BlobError::Corrupted(format!("block {page_id} has invalid kind {}", buf[0]))
        })?;

        let data = if kind.is_free() {
            Vec::new()
        } else {
            buf[BLOCK_HEADER_SIZE..].to_vec()
        };

        Ok(Self {
            kind,
            next: decode_page_ref(read_u32(buf, 4)),
            last: decode_page_ref(read_u32(buf, 8)),
            length: read_u64(buf, 16),
            data,
        })
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.kind.tag();
        buf[4..8].copy_from_slice(&encode_page_ref(self.next).to_le_bytes());
        buf[8..12].copy_from_slice(&encode_page_ref(self.last).to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + self.data.len()].copy_from_slice(&self.data);
    }
}

/// Store metadata kept in block 0
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHeader {
    pub block_size: usize,
    pub block_count: usize,
    pub free_handle_head: Option<BlockId>,
    pub free_block_head: Option<BlockId>,
    pub file_count: u64,
}

impl StoreHeader {
    /// Header of an empty store: only block 0 exists
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            block_count: 1,
            free_handle_head: None,
            free_block_head: None,
            file_count: 0,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&MAGIC_NUMBER.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.block_size as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(self.block_count as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&encode_page_ref(self.free_handle_head).to_le_bytes());
        buf[20..24].copy_from_slice(&encode_page_ref(self.free_block_head).to_le_bytes());
        buf[24..32].copy_from_slice(&self.file_count.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> BlobResult<Self> {
        let magic = read_u32(buf, 0);
        if magic != MAGIC_NUMBER {
            return Err(BlobError::Corrupted(format!(
                "bad magic number {magic:#010x}"
            )));
        }

        let version = read_u32(buf, 4);
        if version != VERSION {
            return Err(BlobError::Corrupted(format!(
                "unsupported version {version}"
            )));
        }

        Ok(Self {
            block_size: read_u32(buf, 8) as usize,
            block_count: read_u32(buf, 12) as usize,
            free_handle_head: decode_page_ref(read_u32(buf, 16)),
            free_block_head: decode_page_ref(read_u32(buf, 20)),
            file_count: read_u64(buf, 24),
        })
    }

    /// Check the header against the length of the file it came from
    pub fn validate(&self, file_len: u64) -> BlobResult<()> {
        let expected = (self.block_count * self.block_size) as u64;
        if self.block_count == 0 || expected != file_len {
            return Err(BlobError::Corrupted(format!(
                "header records {} blocks ({expected} bytes) but the file holds {file_len} bytes",
                self.block_count
            )));
        }

        let in_range = |block: Option<BlockId>| block.is_none_or(|id| id >= 1 && id < self.block_count);
        if !in_range(self.free_handle_head) || !in_range(self.free_block_head) {
            return Err(BlobError::Corrupted("free stack head out of range".to_string()));
        }

        Ok(())
    }
}
