use crate::file::PageId;

use super::key::KeyPair;

/// Internal node: stores separator pairs and child page pointers
///
/// In this B+ tree variant:
/// - keys[i] is an upper bound on every pair in the subtree rooted at children[i]
///   (the exact maximum after inserts, possibly stale-but-valid after deletes)
/// - keys.len() == children.len()
#[derive(Debug, Clone, PartialEq)]
pub struct InternalNode<K> {
    /// Upper bound of each child subtree
    pub keys: Vec<KeyPair<K>>,
    /// Child page IDs
    pub children: Vec<PageId>,
}

impl<K: Ord + Clone> InternalNode<K> {
    /// Create a new internal node with given keys and children
    pub fn new(keys: Vec<KeyPair<K>>, children: Vec<PageId>) -> Self {
        debug_assert_eq!(keys.len(), children.len());
        Self { keys, children }
    }

    /// Number of children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Check if node is empty
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Find the child index for a given pair
    /// Returns the index of the first key >= target, or the last index if none found
    pub fn find_child_index(&self, target: &KeyPair<K>) -> usize {
        let pos = self.keys.partition_point(|k| k < target);
        pos.min(self.keys.len().saturating_sub(1))
    }

    /// Get the maximum key in this node
    pub fn max_key(&self) -> Option<&KeyPair<K>> {
        self.keys.last()
    }
}

/// Leaf node: stores key pairs, linked to next leaf
#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode<K> {
    /// Pairs (sorted by key, then offset)
    pub entries: Vec<KeyPair<K>>,
    /// Link to next leaf for range queries
    pub next: Option<PageId>,
}

impl<K: Ord + Clone> LeafNode<K> {
    /// Create a leaf node with given entries
    pub fn with_entries(entries: Vec<KeyPair<K>>) -> Self {
        Self {
            entries,
            next: None,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if leaf is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a pair in sorted order
    pub fn insert(&mut self, pair: KeyPair<K>) {
        let pos = self.entries.partition_point(|e| e <= &pair);
        self.entries.insert(pos, pair);
    }

    /// Delete exactly this pair
    /// Returns true if the entry was found and deleted
    pub fn delete(&mut self, pair: &KeyPair<K>) -> bool {
        match self.entries.binary_search(pair) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Get the maximum pair in this leaf
    pub fn max_key(&self) -> Option<&KeyPair<K>> {
        self.entries.last()
    }

    /// Get the minimum pair in this leaf
    pub fn min_key(&self) -> Option<&KeyPair<K>> {
        self.entries.first()
    }

    /// Split this leaf node, returning the new right sibling
    /// This node keeps the first half, new node gets the second half
    pub fn split(&mut self) -> LeafNode<K> {
        let mid = self.entries.len() / 2;

        let mut right = LeafNode::with_entries(self.entries.split_off(mid));
        right.next = self.next.take();

        right
    }
}

/// One tree page (internal node, leaf node, or a link in the free list)
#[derive(Debug, Clone, PartialEq)]
pub enum Node<K> {
    Internal(InternalNode<K>),
    Leaf(LeafNode<K>),
    Free { next: Option<PageId> },
}

impl<K: Ord + Clone> Node<K> {
    /// Get the maximum key in this node
    pub fn max_key(&self) -> Option<&KeyPair<K>> {
        match self {
            Node::Internal(node) => node.max_key(),
            Node::Leaf(node) => node.max_key(),
            Node::Free { .. } => None,
        }
    }

    /// Human-readable page kind for error reporting
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Internal(_) => "internal",
            Node::Leaf(_) => "leaf",
            Node::Free { .. } => "free",
        }
    }
}
