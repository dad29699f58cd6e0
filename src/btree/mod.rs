//! Disk-backed B+ tree with duplicate keys
//!
//! The tree maps fixed-size keys to caller-supplied `i32` offsets. Several
//! pairs may share a key; a pair is identified by the full `(key, offset)`
//! tuple and entries are kept sorted by that tuple. Pages live in a
//! bounded LRU cache and reach the backing file on eviction or close.
//!
//! File layout:
//! - page 0: tree header (root, first leaf, entry count, free list head, ...)
//! - pages 1..: internal, leaf or free pages, see `serialization`

mod error;
mod iter;
mod key;
mod node;
mod serialization;

#[cfg(test)]
mod tests;

pub use error::{BTreeError, BTreeResult};
pub use iter::RangeIter;
pub use key::{CompoundKey, FixedKey, KeyPair};
pub use node::{InternalNode, LeafNode, Node};
pub use serialization::{TreeHeader, internal_capacity, leaf_capacity};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::{BTreeOptions, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::file::{CacheMetrics, PageCache, PageId, PagedFile};

/// Smallest branching factor accepted for either node kind
const MIN_FANOUT: usize = 4;

/// Route from the root to a node: (internal page, child index taken)
type TreePath = Vec<(PageId, usize)>;

/// Outcome of looking for an exact pair within one subtree
enum PairSearch {
    Found(PageId),
    /// An entry greater than the target was seen, so no later leaf holds it
    Passed,
    /// Every entry was smaller than the target
    Exhausted,
}

/// A persistent B+ tree over keys of type `K`
///
/// A tree is created closed; `open` loads or initializes the backing file
/// and every other operation requires an open tree.
pub struct BTree<K: FixedKey> {
    path: PathBuf,
    options: BTreeOptions,
    metrics: Arc<CacheMetrics>,
    state: Option<TreeState<K>>,
}

/// Everything that exists only while the tree is open
struct TreeState<K: FixedKey> {
    cache: PageCache<Node<K>>,
    header: TreeHeader,
    max_leaf: usize,
    max_internal: usize,
}

impl<K: FixedKey> BTree<K> {
    /// Create a closed tree over `path` with its own diagnostics counters
    pub fn new(path: impl AsRef<Path>, options: BTreeOptions) -> BTreeResult<Self> {
        Self::with_metrics(path, options, CacheMetrics::new())
    }

    /// Create a closed tree that reports cache usage into `metrics`
    pub fn with_metrics(
        path: impl AsRef<Path>,
        options: BTreeOptions,
        metrics: Arc<CacheMetrics>,
    ) -> BTreeResult<Self> {
        let page_size = options.page_size;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
            || leaf_capacity::<K>(page_size) < MIN_FANOUT
            || internal_capacity::<K>(page_size) < MIN_FANOUT
        {
            return Err(BTreeError::InvalidPageSize {
                page_size,
                key_size: K::SIZE,
            });
        }

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            options: BTreeOptions {
                cache_size: options.cache_size.max(1),
                ..options
            },
            metrics,
            state: None,
        })
    }

    /// Open the backing file
    ///
    /// Returns `Ok(true)` when an existing tree was loaded or a new empty
    /// tree was initialized in an empty file. Returns `Ok(false)` and stays
    /// closed when the file holds an invalid header.
    pub fn open(&mut self) -> BTreeResult<bool> {
        if self.state.is_some() {
            return Err(BTreeError::AlreadyOpen);
        }

        let page_size = self.options.page_size;
        let mut file = PagedFile::open(&self.path, page_size)?;
        let is_new = file.is_empty()?;

        let header = if is_new {
            TreeHeader::new(page_size, K::SIZE)
        } else {
            match read_header::<K>(&mut file) {
                Ok(header) => header,
                Err(BTreeError::InvalidHeader(reason)) => {
                    warn!(path = %self.path.display(), %reason, "rejected b-tree file");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        };

        let mut state = TreeState {
            cache: PageCache::new(file, self.options.cache_size, Arc::clone(&self.metrics)),
            header,
            max_leaf: leaf_capacity::<K>(page_size),
            max_internal: internal_capacity::<K>(page_size),
        };
        if is_new {
            state.write_header()?;
            state.cache.file_mut().sync()?;
        }

        debug!(
            path = %self.path.display(),
            count = state.header.entry_count,
            pages = state.header.page_count,
            created = is_new,
            "opened b-tree"
        );
        self.state = Some(state);
        Ok(true)
    }

    /// Flush every dirty page and the header, then release the file
    pub fn close(&mut self) -> BTreeResult<()> {
        let mut state = self.state.take().ok_or(BTreeError::NotOpen)?;
        state.flush()?;
        debug!(
            path = %self.path.display(),
            count = state.header.entry_count,
            "closed b-tree"
        );
        Ok(())
    }

    /// Close the tree if it is open; calling it again does nothing
    pub fn dispose(&mut self) -> BTreeResult<()> {
        if self.state.is_some() {
            self.close()?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Number of pairs in the tree
    pub fn count(&self) -> BTreeResult<usize> {
        Ok(self.state()?.header.entry_count as usize)
    }

    /// Levels from root to leaf (0 for an empty tree)
    pub fn height(&self) -> BTreeResult<usize> {
        Ok(self.state()?.header.height)
    }

    /// Pages in the file, including the header and free pages
    pub fn page_count(&self) -> BTreeResult<usize> {
        Ok(self.state()?.header.page_count)
    }

    /// Insert a pair; equal keys simply add another entry
    pub fn insert_key(&mut self, key: K, offset: i32) -> BTreeResult<()> {
        self.state_mut()?.insert(KeyPair::new(key, offset))
    }

    /// Remove exactly the pair `(key, offset)`
    /// Returns false if no such pair exists
    pub fn delete_key(&mut self, key: &K, offset: i32) -> BTreeResult<bool> {
        self.state_mut()?.delete(&KeyPair::new(key.clone(), offset))
    }

    /// Append every pair with `low <= key <= high` to `out`, in order
    pub fn search_for_range(
        &mut self,
        low: &K,
        high: &K,
        out: &mut impl Extend<KeyPair<K>>,
    ) -> BTreeResult<()> {
        for pair in self.range(low, high)? {
            out.extend(Some(pair?));
        }
        Ok(())
    }

    /// Append the offsets of every pair with `low <= key <= high` to `out`
    pub fn search_offsets(
        &mut self,
        low: &K,
        high: &K,
        out: &mut impl Extend<i32>,
    ) -> BTreeResult<()> {
        for pair in self.range(low, high)? {
            out.extend(Some(pair?.offset));
        }
        Ok(())
    }

    /// Lazily walk every pair with `low <= key <= high`
    pub fn range(&mut self, low: &K, high: &K) -> BTreeResult<RangeIter<'_, K>> {
        let state = self.state_mut()?;
        RangeIter::new(state, Some(KeyPair::lower_bound(low)), Some(high.clone()))
    }

    /// Append every pair in the tree to `out`, in order
    pub fn get_all_keys(&mut self, out: &mut impl Extend<KeyPair<K>>) -> BTreeResult<()> {
        for pair in self.keys()? {
            out.extend(Some(pair?));
        }
        Ok(())
    }

    /// Lazily walk every pair in the tree
    pub fn keys(&mut self) -> BTreeResult<RangeIter<'_, K>> {
        RangeIter::new(self.state_mut()?, None, None)
    }

    /// Smallest pair, if any
    pub fn get_minimum(&mut self) -> BTreeResult<Option<KeyPair<K>>> {
        self.state_mut()?.minimum()
    }

    /// Largest pair, if any
    pub fn get_maximum(&mut self) -> BTreeResult<Option<KeyPair<K>>> {
        self.state_mut()?.maximum()
    }

    /// Remove every pair and shrink the file back to its header
    pub fn clear(&mut self) -> BTreeResult<()> {
        let state = self.state_mut()?;
        state.clear()?;
        debug!(path = %self.path.display(), "cleared b-tree");
        Ok(())
    }

    /// Bound the number of resident pages (at least one)
    ///
    /// The size applies immediately when open and to every later `open`.
    pub fn set_cache_size(&mut self, pages: usize) -> BTreeResult<()> {
        let pages = pages.max(1);
        self.options.cache_size = pages;
        if let Some(state) = self.state.as_mut() {
            state.cache.set_capacity(pages)?;
        }
        debug!(path = %self.path.display(), pages, "resized b-tree cache");
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        self.options.cache_size
    }

    /// Write dirty pages and the header without closing
    pub fn flush(&mut self) -> BTreeResult<()> {
        self.state_mut()?.flush()
    }

    fn state(&self) -> BTreeResult<&TreeState<K>> {
        self.state.as_ref().ok_or(BTreeError::NotOpen)
    }

    fn state_mut(&mut self) -> BTreeResult<&mut TreeState<K>> {
        self.state.as_mut().ok_or(BTreeError::NotOpen)
    }
}

impl<K: FixedKey> Drop for BTree<K> {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

/// Read and validate the header of a non-empty file
fn read_header<K: FixedKey>(file: &mut PagedFile) -> BTreeResult<TreeHeader> {
    let page_size = file.page_size();
    let len = file.len()?;
    if len < page_size as u64 || len % page_size as u64 != 0 {
        return Err(BTreeError::InvalidHeader(format!(
            "file length {len} is not a whole number of {page_size}-byte pages"
        )));
    }

    let mut buf = vec![0u8; page_size];
    file.read_page(0, &mut buf)?;
    let header = TreeHeader::decode(&buf)?;
    header.validate(page_size, K::SIZE, file.page_count()?)?;
    Ok(header)
}

impl<K: FixedKey> TreeState<K> {
    fn min_leaf(&self) -> usize {
        self.max_leaf.div_ceil(2)
    }

    fn min_internal(&self) -> usize {
        self.max_internal.div_ceil(2)
    }

    fn write_header(&mut self) -> BTreeResult<()> {
        let mut buf = vec![0u8; self.header.page_size];
        self.header.encode(&mut buf);
        self.cache.file_mut().write_page(0, &buf)?;
        Ok(())
    }

    fn flush(&mut self) -> BTreeResult<()> {
        self.cache.flush_all()?;
        self.write_header()?;
        self.cache.file_mut().sync()?;
        Ok(())
    }

    fn clear(&mut self) -> BTreeResult<()> {
        self.cache.discard_all();
        self.header = TreeHeader::new(self.header.page_size, K::SIZE);
        self.cache.file_mut().set_page_count(1)?;
        self.write_header()?;
        self.cache.file_mut().sync()?;
        Ok(())
    }

    // ========== Page Access ==========

    fn node(&mut self, page_id: PageId) -> BTreeResult<&Node<K>> {
        self.check_page(page_id)?;
        self.cache.get(page_id)
    }

    fn leaf(&mut self, page_id: PageId) -> BTreeResult<&LeafNode<K>> {
        match self.node(page_id)? {
            Node::Leaf(leaf) => Ok(leaf),
            other => Err(BTreeError::corrupted(
                page_id,
                format!("expected leaf, found {} page", other.kind()),
            )),
        }
    }

    fn leaf_mut(&mut self, page_id: PageId) -> BTreeResult<&mut LeafNode<K>> {
        self.check_page(page_id)?;
        match self.cache.get_mut(page_id)? {
            Node::Leaf(leaf) => Ok(leaf),
            other => Err(BTreeError::corrupted(
                page_id,
                format!("expected leaf, found {} page", other.kind()),
            )),
        }
    }

    fn internal(&mut self, page_id: PageId) -> BTreeResult<&InternalNode<K>> {
        match self.node(page_id)? {
            Node::Internal(node) => Ok(node),
            other => Err(BTreeError::corrupted(
                page_id,
                format!("expected internal node, found {} page", other.kind()),
            )),
        }
    }

    fn internal_mut(&mut self, page_id: PageId) -> BTreeResult<&mut InternalNode<K>> {
        self.check_page(page_id)?;
        match self.cache.get_mut(page_id)? {
            Node::Internal(node) => Ok(node),
            other => Err(BTreeError::corrupted(
                page_id,
                format!("expected internal node, found {} page", other.kind()),
            )),
        }
    }

    fn check_page(&self, page_id: PageId) -> BTreeResult<()> {
        if page_id == 0 || page_id >= self.header.page_count {
            return Err(BTreeError::corrupted(
                page_id,
                format!("pointer outside the {} allocated pages", self.header.page_count),
            ));
        }
        Ok(())
    }

    /// Allocate a page for `node`, reusing the most recently freed page first
    fn allocate_page(&mut self, node: Node<K>) -> BTreeResult<PageId> {
        let page_id = match self.header.free_head {
            Some(free_id) => {
                let next = match self.node(free_id)? {
                    Node::Free { next } => *next,
                    other => {
                        return Err(BTreeError::corrupted(
                            free_id,
                            format!("free list entry is a {} page", other.kind()),
                        ));
                    }
                };
                self.header.free_head = next;
                free_id
            }
            None => {
                let page_id = self.header.page_count;
                self.header.page_count += 1;
                page_id
            }
        };

        self.cache.insert(page_id, node)?;
        trace!(page_id, "allocated b-tree page");
        Ok(page_id)
    }

    /// Push a page onto the free list
    fn free_page(&mut self, page_id: PageId) -> BTreeResult<()> {
        self.cache.insert(
            page_id,
            Node::Free {
                next: self.header.free_head,
            },
        )?;
        self.header.free_head = Some(page_id);
        trace!(page_id, "freed b-tree page");
        Ok(())
    }

    // ========== Search Operations ==========

    /// Find the leaf that should contain `target` and the path from the root to it
    fn find_leaf_with_path(&mut self, target: &KeyPair<K>) -> BTreeResult<(PageId, TreePath)> {
        let mut current = self
            .header
            .root
            .ok_or_else(|| BTreeError::InvalidState("descent into an empty tree".to_string()))?;
        let mut path = Vec::with_capacity(self.header.height);

        loop {
            let (child_idx, child) = match self.node(current)? {
                Node::Leaf(_) => return Ok((current, path)),
                Node::Internal(node) => {
                    let child_idx = node.find_child_index(target);
                    (child_idx, node.children.get(child_idx).copied())
                }
                Node::Free { .. } => {
                    return Err(BTreeError::corrupted(current, "free page reachable from root"));
                }
            };

            path.push((current, child_idx));
            if path.len() >= self.header.height {
                return Err(BTreeError::corrupted(
                    current,
                    format!("tree deeper than recorded height {}", self.header.height),
                ));
            }
            current = child
                .ok_or_else(|| BTreeError::corrupted(current, "internal node without children"))?;
        }
    }

    /// Find a leaf actually holding `target` and the path from the root to it
    ///
    /// Copies of one pair can straddle a separator equal to that pair, and the
    /// leftmost candidate leaf may have lost its copies since, so the search
    /// moves right until it finds the pair or passes it.
    fn find_pair_with_path(&mut self, target: &KeyPair<K>) -> BTreeResult<Option<(PageId, TreePath)>> {
        let Some(root) = self.header.root else {
            return Ok(None);
        };

        let mut path = Vec::with_capacity(self.header.height);
        match self.search_subtree(root, target, &mut path)? {
            PairSearch::Found(leaf_id) => Ok(Some((leaf_id, path))),
            PairSearch::Passed | PairSearch::Exhausted => Ok(None),
        }
    }

    fn search_subtree(
        &mut self,
        page_id: PageId,
        target: &KeyPair<K>,
        path: &mut TreePath,
    ) -> BTreeResult<PairSearch> {
        let (start, children) = match self.node(page_id)? {
            Node::Leaf(leaf) => {
                return Ok(match leaf.entries.binary_search(target) {
                    Ok(_) => PairSearch::Found(page_id),
                    Err(pos) if pos < leaf.len() => PairSearch::Passed,
                    Err(_) => PairSearch::Exhausted,
                });
            }
            Node::Internal(node) => {
                // Subtrees bounded below the target cannot hold it
                let start = node.keys.partition_point(|k| k < target);
                (start, node.children[start..].to_vec())
            }
            Node::Free { .. } => {
                return Err(BTreeError::corrupted(page_id, "free page reachable from root"));
            }
        };

        if path.len() + 1 >= self.header.height {
            return Err(BTreeError::corrupted(
                page_id,
                format!("tree deeper than recorded height {}", self.header.height),
            ));
        }

        for (child_idx, child_id) in (start..).zip(children) {
            path.push((page_id, child_idx));
            match self.search_subtree(child_id, target, path)? {
                PairSearch::Exhausted => {
                    path.pop();
                }
                outcome => return Ok(outcome),
            }
        }

        Ok(PairSearch::Exhausted)
    }

    fn minimum(&mut self) -> BTreeResult<Option<KeyPair<K>>> {
        match self.header.first_leaf {
            Some(leaf_id) => Ok(self.leaf(leaf_id)?.min_key().cloned()),
            None => Ok(None),
        }
    }

    fn maximum(&mut self) -> BTreeResult<Option<KeyPair<K>>> {
        let Some(mut current) = self.header.root else {
            return Ok(None);
        };

        for _ in 0..self.header.height {
            let child = match self.node(current)? {
                Node::Leaf(leaf) => return Ok(leaf.max_key().cloned()),
                Node::Internal(node) => node.children.last().copied(),
                Node::Free { .. } => None,
            };
            current = child
                .ok_or_else(|| BTreeError::corrupted(current, "broken rightmost path"))?;
        }

        Err(BTreeError::corrupted(
            current,
            format!("no leaf within recorded height {}", self.header.height),
        ))
    }

    // ========== Insert Operations ==========

    fn insert(&mut self, pair: KeyPair<K>) -> BTreeResult<()> {
        if self.header.root.is_none() {
            let leaf_id = self.allocate_page(Node::Leaf(LeafNode::with_entries(vec![pair])))?;
            self.header.root = Some(leaf_id);
            self.header.first_leaf = Some(leaf_id);
            self.header.height = 1;
            self.header.entry_count = 1;
            return Ok(());
        }

        let (leaf_id, path) = self.find_leaf_with_path(&pair)?;

        let leaf_len = {
            let leaf = self.leaf_mut(leaf_id)?;
            leaf.insert(pair);
            leaf.len()
        };

        self.header.entry_count += 1;

        if leaf_len > self.max_leaf {
            self.split_leaf(leaf_id, path)
        } else {
            self.update_ancestor_keys(leaf_id, &path)
        }
    }

    /// Split an overflowing leaf node
    fn split_leaf(&mut self, leaf_id: PageId, path: TreePath) -> BTreeResult<()> {
        let (right, left_max) = {
            let leaf = self.leaf_mut(leaf_id)?;
            let right = leaf.split();
            (right, leaf.max_key().cloned())
        };

        let left_max = left_max.ok_or_else(|| BTreeError::corrupted(leaf_id, "empty leaf after split"))?;
        let right_max = right
            .max_key()
            .cloned()
            .ok_or_else(|| BTreeError::corrupted(leaf_id, "empty right half after split"))?;

        // The right half already carries the old next pointer
        let right_id = self.allocate_page(Node::Leaf(right))?;
        self.leaf_mut(leaf_id)?.next = Some(right_id);

        self.insert_into_parent(path, leaf_id, left_max, right_id, right_max)
    }

    /// Insert a new child into the parent after a split
    fn insert_into_parent(
        &mut self,
        mut path: TreePath,
        left_id: PageId,
        left_key: KeyPair<K>,
        right_id: PageId,
        right_key: KeyPair<K>,
    ) -> BTreeResult<()> {
        let Some((parent_id, child_idx)) = path.pop() else {
            let new_root = InternalNode::new(vec![left_key, right_key], vec![left_id, right_id]);
            let new_root_id = self.allocate_page(Node::Internal(new_root))?;
            self.header.root = Some(new_root_id);
            self.header.height += 1;
            trace!(root = new_root_id, height = self.header.height, "grew b-tree root");
            return Ok(());
        };

        let parent_len = {
            let parent = self.internal_mut(parent_id)?;
            parent.keys[child_idx] = left_key;
            parent.keys.insert(child_idx + 1, right_key);
            parent.children.insert(child_idx + 1, right_id);
            parent.len()
        };

        if parent_len > self.max_internal {
            self.split_internal(parent_id, path)
        } else {
            self.update_ancestor_keys(parent_id, &path)
        }
    }

    /// Split an overflowing internal node
    fn split_internal(&mut self, node_id: PageId, path: TreePath) -> BTreeResult<()> {
        let (right, left_max) = {
            let node = self.internal_mut(node_id)?;
            let mid = node.len() / 2;
            let right = InternalNode::new(node.keys.split_off(mid), node.children.split_off(mid));
            (right, node.max_key().cloned())
        };

        let left_max = left_max.ok_or_else(|| BTreeError::corrupted(node_id, "empty node after split"))?;
        let right_max = right
            .max_key()
            .cloned()
            .ok_or_else(|| BTreeError::corrupted(node_id, "empty right half after split"))?;

        let right_id = self.allocate_page(Node::Internal(right))?;
        self.insert_into_parent(path, node_id, left_max, right_id, right_max)
    }

    /// Refresh the separator of `node_id` and its ancestors after its maximum changed
    fn update_ancestor_keys(&mut self, node_id: PageId, path: &[(PageId, usize)]) -> BTreeResult<()> {
        let mut current = node_id;

        for &(parent_id, child_idx) in path.iter().rev() {
            let max_key = self
                .node(current)?
                .max_key()
                .cloned()
                .ok_or_else(|| BTreeError::corrupted(current, "empty node on search path"))?;

            // Unchanged separator means nothing higher changes either
            if self.internal(parent_id)?.keys[child_idx] == max_key {
                break;
            }
            self.internal_mut(parent_id)?.keys[child_idx] = max_key;
            current = parent_id;
        }

        Ok(())
    }

    // ========== Delete Operations ==========

    fn delete(&mut self, pair: &KeyPair<K>) -> BTreeResult<bool> {
        if self.header.root.is_none() {
            return Ok(false);
        }

        let Some((leaf_id, path)) = self.find_pair_with_path(pair)? else {
            return Ok(false);
        };

        self.leaf_mut(leaf_id)?.delete(pair);
        self.header.entry_count -= 1;

        self.handle_leaf_underflow(leaf_id, path)?;
        Ok(true)
    }

    /// Pick the left sibling if there is one, otherwise the right
    fn pick_sibling(&mut self, parent_id: PageId, child_idx: usize) -> BTreeResult<(PageId, bool)> {
        let parent = self.internal(parent_id)?;

        if child_idx > 0 {
            Ok((parent.children[child_idx - 1], true))
        } else if child_idx + 1 < parent.len() {
            Ok((parent.children[child_idx + 1], false))
        } else {
            Err(BTreeError::corrupted(parent_id, "non-root node without siblings"))
        }
    }

    /// Handle underflow in a leaf node after deletion
    fn handle_leaf_underflow(&mut self, leaf_id: PageId, mut path: TreePath) -> BTreeResult<()> {
        let leaf_len = self.leaf(leaf_id)?.len();

        let Some(&(parent_id, child_idx)) = path.last() else {
            if leaf_len == 0 {
                self.free_page(leaf_id)?;
                self.header.root = None;
                self.header.first_leaf = None;
                self.header.height = 0;
            }
            return Ok(());
        };

        if leaf_len >= self.min_leaf() {
            return self.update_ancestor_keys(leaf_id, &path);
        }

        path.pop();
        let (sibling_id, sibling_is_left) = self.pick_sibling(parent_id, child_idx)?;

        if self.leaf(sibling_id)?.len() > self.min_leaf() {
            self.redistribute_leaves(leaf_id, sibling_id, sibling_is_left, parent_id, child_idx)
        } else {
            self.merge_leaves(leaf_id, sibling_id, sibling_is_left, parent_id, child_idx, path)
        }
    }

    /// Move one entry from a sibling leaf into an underfull leaf
    fn redistribute_leaves(
        &mut self,
        leaf_id: PageId,
        sibling_id: PageId,
        sibling_is_left: bool,
        parent_id: PageId,
        child_idx: usize,
    ) -> BTreeResult<()> {
        if sibling_is_left {
            // Borrow the left sibling's last entry
            let (moved, sibling_max) = {
                let sibling = self.leaf_mut(sibling_id)?;
                let moved = sibling.entries.pop();
                (moved, sibling.max_key().cloned())
            };
            let (Some(moved), Some(sibling_max)) = (moved, sibling_max) else {
                return Err(BTreeError::corrupted(sibling_id, "sibling too small to lend"));
            };

            self.leaf_mut(leaf_id)?.entries.insert(0, moved);
            self.internal_mut(parent_id)?.keys[child_idx - 1] = sibling_max;
        } else {
            // Borrow the right sibling's first entry
            let moved = {
                let sibling = self.leaf_mut(sibling_id)?;
                if sibling.entries.is_empty() {
                    None
                } else {
                    Some(sibling.entries.remove(0))
                }
            };
            let moved = moved.ok_or_else(|| BTreeError::corrupted(sibling_id, "sibling too small to lend"))?;

            self.leaf_mut(leaf_id)?.entries.push(moved.clone());
            self.internal_mut(parent_id)?.keys[child_idx] = moved;
        }

        Ok(())
    }

    /// Merge a leaf with its sibling, freeing the right one
    fn merge_leaves(
        &mut self,
        leaf_id: PageId,
        sibling_id: PageId,
        sibling_is_left: bool,
        parent_id: PageId,
        child_idx: usize,
        parent_path: TreePath,
    ) -> BTreeResult<()> {
        let (left_id, right_id, remove_idx) = if sibling_is_left {
            (sibling_id, leaf_id, child_idx)
        } else {
            (leaf_id, sibling_id, child_idx + 1)
        };

        let (right_entries, right_next) = {
            let right = self.leaf_mut(right_id)?;
            (std::mem::take(&mut right.entries), right.next)
        };

        {
            let left = self.leaf_mut(left_id)?;
            left.entries.extend(right_entries);
            left.next = right_next;
        }

        self.free_page(right_id)?;
        self.remove_from_parent(parent_id, remove_idx, parent_path)
    }

    /// Remove a child from its parent after a merge
    fn remove_from_parent(
        &mut self,
        parent_id: PageId,
        remove_idx: usize,
        parent_path: TreePath,
    ) -> BTreeResult<()> {
        let (remaining, parent_len) = {
            let parent = self.internal_mut(parent_id)?;
            parent.keys.remove(remove_idx);
            parent.children.remove(remove_idx);

            let remaining_idx = remove_idx.saturating_sub(1);
            let remaining = parent
                .children
                .get(remaining_idx)
                .map(|&child_id| (remaining_idx, child_id));
            (remaining, parent.len())
        };

        // The surviving child absorbed its sibling, so its separator moves up
        if let Some((remaining_idx, child_id)) = remaining {
            let child_max = self.node(child_id)?.max_key().cloned();
            if let Some(child_max) = child_max {
                self.internal_mut(parent_id)?.keys[remaining_idx] = child_max;
            }
        }

        if parent_path.is_empty() {
            if parent_len == 1 {
                let new_root = self.internal(parent_id)?.children[0];
                self.free_page(parent_id)?;
                self.header.root = Some(new_root);
                self.header.height -= 1;
                trace!(root = new_root, height = self.header.height, "collapsed b-tree root");
            }
            return Ok(());
        }

        if parent_len < self.min_internal() {
            self.handle_internal_underflow(parent_id, parent_path)
        } else {
            self.update_ancestor_keys(parent_id, &parent_path)
        }
    }

    /// Handle underflow in an internal node
    fn handle_internal_underflow(&mut self, node_id: PageId, mut path: TreePath) -> BTreeResult<()> {
        let (parent_id, child_idx) = path
            .pop()
            .ok_or_else(|| BTreeError::InvalidState("underflow handled at the root".to_string()))?;

        let (sibling_id, sibling_is_left) = self.pick_sibling(parent_id, child_idx)?;

        if self.internal(sibling_id)?.len() > self.min_internal() {
            self.redistribute_internal(node_id, sibling_id, sibling_is_left, parent_id, child_idx)
        } else {
            self.merge_internal(node_id, sibling_id, sibling_is_left, parent_id, child_idx, path)
        }
    }

    /// Move one child from a sibling internal node into an underfull one
    fn redistribute_internal(
        &mut self,
        node_id: PageId,
        sibling_id: PageId,
        sibling_is_left: bool,
        parent_id: PageId,
        child_idx: usize,
    ) -> BTreeResult<()> {
        if sibling_is_left {
            // Borrow the left sibling's last child
            let (moved, sibling_max) = {
                let sibling = self.internal_mut(sibling_id)?;
                let moved = sibling.keys.pop().zip(sibling.children.pop());
                (moved, sibling.max_key().cloned())
            };
            let (Some((key, child)), Some(sibling_max)) = (moved, sibling_max) else {
                return Err(BTreeError::corrupted(sibling_id, "sibling too small to lend"));
            };

            {
                let node = self.internal_mut(node_id)?;
                node.keys.insert(0, key);
                node.children.insert(0, child);
            }
            self.internal_mut(parent_id)?.keys[child_idx - 1] = sibling_max;
        } else {
            // Borrow the right sibling's first child
            let (key, child) = {
                let sibling = self.internal_mut(sibling_id)?;
                if sibling.is_empty() {
                    return Err(BTreeError::corrupted(sibling_id, "sibling too small to lend"));
                }
                (sibling.keys.remove(0), sibling.children.remove(0))
            };

            {
                let node = self.internal_mut(node_id)?;
                node.keys.push(key.clone());
                node.children.push(child);
            }
            self.internal_mut(parent_id)?.keys[child_idx] = key;
        }

        Ok(())
    }

    /// Merge an internal node with its sibling, freeing the right one
    fn merge_internal(
        &mut self,
        node_id: PageId,
        sibling_id: PageId,
        sibling_is_left: bool,
        parent_id: PageId,
        child_idx: usize,
        parent_path: TreePath,
    ) -> BTreeResult<()> {
        let (left_id, right_id, remove_idx) = if sibling_is_left {
            (sibling_id, node_id, child_idx)
        } else {
            (node_id, sibling_id, child_idx + 1)
        };

        let (right_keys, right_children) = {
            let right = self.internal_mut(right_id)?;
            (
                std::mem::take(&mut right.keys),
                std::mem::take(&mut right.children),
            )
        };

        {
            let left = self.internal_mut(left_id)?;
            left.keys.extend(right_keys);
            left.children.extend(right_children);
        }

        self.free_page(right_id)?;
        self.remove_from_parent(parent_id, remove_idx, parent_path)
    }
}
