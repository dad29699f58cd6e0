use std::collections::VecDeque;

use crate::file::PageId;

use super::error::{BTreeError, BTreeResult};
use super::key::{FixedKey, KeyPair};
use super::TreeState;

/// Lazy in-order walk over a key range
///
/// Each call to `BTree::range` or `BTree::keys` starts a fresh descent.
/// Matching pairs are copied out one leaf at a time, so the iterator never
/// holds a page borrowed from the cache between calls to `next`.
pub struct RangeIter<'a, K: FixedKey> {
    state: &'a mut TreeState<K>,
    /// Next leaf to load
    next_leaf: Option<PageId>,
    /// Pairs copied from the current leaf
    buffer: VecDeque<KeyPair<K>>,
    /// Pairs below this are skipped
    low: Option<KeyPair<K>>,
    /// Iteration stops at the first key above this
    high: Option<K>,
    /// Leaves loaded so far, bounded by the page count
    visited: usize,
    done: bool,
}

impl<'a, K: FixedKey> RangeIter<'a, K> {
    pub(super) fn new(
        state: &'a mut TreeState<K>,
        low: Option<KeyPair<K>>,
        high: Option<K>,
    ) -> BTreeResult<Self> {
        let empty = match (&low, &high) {
            (Some(low), Some(high)) => &low.key > high,
            _ => false,
        };

        let next_leaf = if empty || state.header.root.is_none() {
            None
        } else {
            match &low {
                Some(low) => Some(state.find_leaf_with_path(low)?.0),
                None => state.header.first_leaf,
            }
        };

        Ok(Self {
            state,
            next_leaf,
            buffer: VecDeque::new(),
            low,
            high,
            visited: 0,
            done: next_leaf.is_none(),
        })
    }

    /// Copy the matching pairs of one leaf into the buffer
    fn load_leaf(&mut self, leaf_id: PageId) -> BTreeResult<()> {
        self.visited += 1;
        if self.visited > self.state.header.page_count {
            return Err(BTreeError::corrupted(leaf_id, "cycle in leaf chain"));
        }

        let leaf = self.state.leaf(leaf_id)?;
        for pair in &leaf.entries {
            if let Some(high) = &self.high
                && &pair.key > high
            {
                self.done = true;
                break;
            }
            if let Some(low) = &self.low
                && pair < low
            {
                continue;
            }
            self.buffer.push_back(pair.clone());
        }
        self.next_leaf = leaf.next;
        Ok(())
    }
}

impl<K: FixedKey> Iterator for RangeIter<'_, K> {
    type Item = BTreeResult<KeyPair<K>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.buffer.pop_front() {
                return Some(Ok(pair));
            }
            if self.done {
                return None;
            }

            let Some(leaf_id) = self.next_leaf else {
                self.done = true;
                return None;
            };

            if let Err(e) = self.load_leaf(leaf_id) {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
