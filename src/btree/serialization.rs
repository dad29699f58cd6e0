//! Serialization and deserialization for the tree header and node pages

use crate::file::{CachedPage, PageId, decode_page_ref, encode_page_ref, read_u16, read_u32, read_u64};

use super::error::{BTreeError, BTreeResult};
use super::key::{FixedKey, KeyPair};
use super::node::{InternalNode, LeafNode, Node};

/// Magic number for tree files: "OMBT" in ASCII
pub const MAGIC_NUMBER: u32 = 0x4F4D_4254;

/// Current tree file version
pub const VERSION: u32 = 1;

/// Bytes reserved at the start of every node page
pub const NODE_HEADER_SIZE: usize = 16;

/// Bytes of page 0 actually used by the header
pub const TREE_HEADER_SIZE: usize = 44;

const NODE_INTERNAL: u8 = 0;
const NODE_LEAF: u8 = 1;
const NODE_FREE: u8 = 2;

/// Maximum pairs a leaf page can hold
pub fn leaf_capacity<K: FixedKey>(page_size: usize) -> usize {
    page_size.saturating_sub(NODE_HEADER_SIZE) / KeyPair::<K>::SIZE
}

/// Maximum children an internal page can hold
pub fn internal_capacity<K: FixedKey>(page_size: usize) -> usize {
    page_size.saturating_sub(NODE_HEADER_SIZE) / (KeyPair::<K>::SIZE + 4)
}

/// Tree metadata stored in page 0
#[derive(Debug, Clone, PartialEq)]
pub struct TreeHeader {
    pub page_size: usize,
    pub key_size: usize,
    pub root: Option<PageId>,
    pub first_leaf: Option<PageId>,
    pub entry_count: u64,
    pub free_head: Option<PageId>,
    pub page_count: usize,
    pub height: usize,
}

impl TreeHeader {
    /// Header of an empty tree: only page 0 exists
    pub fn new(page_size: usize, key_size: usize) -> Self {
        Self {
            page_size,
            key_size,
            root: None,
            first_leaf: None,
            entry_count: 0,
            free_head: None,
            page_count: 1,
            height: 0,
        }
    }

    /// Serialize the header into a page-sized buffer
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&MAGIC_NUMBER.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(self.key_size as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&encode_page_ref(self.root).to_le_bytes());
        buf[20..24].copy_from_slice(&encode_page_ref(self.first_leaf).to_le_bytes());
        buf[24..32].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[32..36].copy_from_slice(&encode_page_ref(self.free_head).to_le_bytes());
        buf[36..40].copy_from_slice(&(self.page_count as u32).to_le_bytes());
        buf[40..44].copy_from_slice(&(self.height as u32).to_le_bytes());
    }

    /// Deserialize the header from page 0
    pub fn decode(buf: &[u8]) -> BTreeResult<Self> {
        if buf.len() < TREE_HEADER_SIZE {
            return Err(BTreeError::InvalidHeader(format!(
                "header needs {} bytes, page has {}",
                TREE_HEADER_SIZE,
                buf.len()
            )));
        }

        let magic = read_u32(buf, 0);
        if magic != MAGIC_NUMBER {
            return Err(BTreeError::InvalidHeader(format!(
                "bad magic number {magic:#010x}"
            )));
        }

        let version = read_u32(buf, 4);
        if version != VERSION {
            return Err(BTreeError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }

        Ok(Self {
            page_size: read_u32(buf, 8) as usize,
            key_size: read_u32(buf, 12) as usize,
            root: decode_page_ref(read_u32(buf, 16)),
            first_leaf: decode_page_ref(read_u32(buf, 20)),
            entry_count: read_u64(buf, 24),
            free_head: decode_page_ref(read_u32(buf, 32)),
            page_count: read_u32(buf, 36) as usize,
            height: read_u32(buf, 40) as usize,
        })
    }

    /// Check the header against the opener's layout and the file on disk
    pub fn validate(&self, page_size: usize, key_size: usize, file_pages: usize) -> BTreeResult<()> {
        let invalid = |reason: String| Err(BTreeError::InvalidHeader(reason));

        if self.page_size != page_size {
            return invalid(format!(
                "page size {} does not match configured {}",
                self.page_size, page_size
            ));
        }
        if self.key_size != key_size {
            return invalid(format!(
                "key size {} does not match key type size {}",
                self.key_size, key_size
            ));
        }
        if self.page_count == 0 || self.page_count != file_pages {
            return invalid(format!(
                "header records {} pages but the file holds {}",
                self.page_count, file_pages
            ));
        }

        let in_range = |page: Option<PageId>| page.is_none_or(|id| id >= 1 && id < self.page_count);
        if !in_range(self.root) || !in_range(self.first_leaf) || !in_range(self.free_head) {
            return invalid("page pointer out of range".to_string());
        }
        if self.root.is_none() != (self.entry_count == 0) || self.root.is_none() != (self.height == 0) {
            return invalid(format!(
                "inconsistent empty state (count {}, height {})",
                self.entry_count, self.height
            ));
        }

        Ok(())
    }
}

/// Serialize an internal node to bytes
pub fn serialize_internal_node<K: FixedKey>(node: &InternalNode<K>, buf: &mut [u8]) {
    debug_assert!(node.len() <= internal_capacity::<K>(buf.len()));

    buf[0] = NODE_INTERNAL;
    buf[1..3].copy_from_slice(&(node.len() as u16).to_le_bytes());

    let mut offset = NODE_HEADER_SIZE;
    for (key, &child) in node.keys.iter().zip(&node.children) {
        key.write_to(&mut buf[offset..offset + KeyPair::<K>::SIZE]);
        offset += KeyPair::<K>::SIZE;

        buf[offset..offset + 4].copy_from_slice(&(child as u32).to_le_bytes());
        offset += 4;
    }
}

/// Serialize a leaf node to bytes
pub fn serialize_leaf_node<K: FixedKey>(node: &LeafNode<K>, buf: &mut [u8]) {
    debug_assert!(node.len() <= leaf_capacity::<K>(buf.len()));

    buf[0] = NODE_LEAF;
    buf[1..3].copy_from_slice(&(node.len() as u16).to_le_bytes());
    buf[3..7].copy_from_slice(&encode_page_ref(node.next).to_le_bytes());

    let mut offset = NODE_HEADER_SIZE;
    for pair in &node.entries {
        pair.write_to(&mut buf[offset..offset + KeyPair::<K>::SIZE]);
        offset += KeyPair::<K>::SIZE;
    }
}

/// Serialize any tree page to bytes
pub fn serialize_node<K: FixedKey>(node: &Node<K>, buf: &mut [u8]) {
    match node {
        Node::Internal(internal) => serialize_internal_node(internal, buf),
        Node::Leaf(leaf) => serialize_leaf_node(leaf, buf),
        Node::Free { next } => {
            buf[0] = NODE_FREE;
            buf[3..7].copy_from_slice(&encode_page_ref(*next).to_le_bytes());
        }
    }
}

/// Deserialize any tree page from bytes
pub fn deserialize_node<K: FixedKey>(page_id: PageId, buf: &[u8]) -> BTreeResult<Node<K>> {
    if buf.len() < NODE_HEADER_SIZE {
        return Err(BTreeError::corrupted(page_id, "buffer too small for node"));
    }

    let node_type = buf[0];
    let entry_count = read_u16(buf, 1) as usize;
    let link = decode_page_ref(read_u32(buf, 3));

    match node_type {
        NODE_INTERNAL => {
            if entry_count == 0 {
                return Err(BTreeError::corrupted(page_id, "internal node without children"));
            }
            if entry_count > internal_capacity::<K>(buf.len()) {
                return Err(BTreeError::corrupted(
                    page_id,
                    format!("internal node claims {entry_count} children"),
                ));
            }

            let mut keys = Vec::with_capacity(entry_count);
            let mut children = Vec::with_capacity(entry_count);
            let mut offset = NODE_HEADER_SIZE;
            for _ in 0..entry_count {
                keys.push(KeyPair::read_from(&buf[offset..offset + KeyPair::<K>::SIZE]));
                offset += KeyPair::<K>::SIZE;

                children.push(read_u32(buf, offset) as PageId);
                offset += 4;
            }

            Ok(Node::Internal(InternalNode::new(keys, children)))
        }
        NODE_LEAF => {
            if entry_count > leaf_capacity::<K>(buf.len()) {
                return Err(BTreeError::corrupted(
                    page_id,
                    format!("leaf claims {entry_count} entries"),
                ));
            }

            let mut entries = Vec::with_capacity(entry_count);
            let mut offset = NODE_HEADER_SIZE;
            for _ in 0..entry_count {
                entries.push(KeyPair::read_from(&buf[offset..offset + KeyPair::<K>::SIZE]));
                offset += KeyPair::<K>::SIZE;
            }

            let mut leaf = LeafNode::with_entries(entries);
            leaf.next = link;
            Ok(Node::Leaf(leaf))
        }
        NODE_FREE => Ok(Node::Free { next: link }),
        other => Err(BTreeError::corrupted(
            page_id,
            format!("invalid node type {other}"),
        )),
    }
}

impl<K: FixedKey> CachedPage for Node<K> {
    type Error = BTreeError;

    fn decode(page_id: PageId, buf: &[u8]) -> BTreeResult<Self> {
        deserialize_node(page_id, buf)
    }

    fn encode(&self, buf: &mut [u8]) {
        serialize_node(self, buf);
    }
}
