use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::PageId;
use super::error::{FileError, FileResult};
use super::file_manager::PagedFile;
use super::metrics::CacheMetrics;

/// A page type that can live in a `PageCache`
///
/// Pages are kept deserialized while resident and are only encoded when
/// written back to the file.
pub trait CachedPage: Sized {
    type Error: From<FileError>;

    /// Decode a page read from disk
    fn decode(page_id: PageId, buf: &[u8]) -> Result<Self, Self::Error>;

    /// Encode the page into a zeroed buffer of exactly one page
    fn encode(&self, buf: &mut [u8]);
}

/// Entry in the buffer pool
struct CacheEntry<P> {
    /// The deserialized page
    page: P,
    /// Whether this page has been modified since it was loaded or written
    dirty: bool,
}

/// Bounded cache of deserialized pages with LRU eviction
///
/// The cache owns its backing file; dirty pages are written back when they
/// are evicted, on `flush_all`, and when the cache is dropped.
pub struct PageCache<P: CachedPage> {
    /// Underlying paged file
    file: PagedFile,
    /// Combined page store and LRU tracker
    pool: LruCache<PageId, CacheEntry<P>, ahash::RandomState>,
    /// Maximum number of resident pages
    capacity: usize,
    /// Shared diagnostics counters
    metrics: Arc<CacheMetrics>,
    /// Reusable buffer for page I/O (avoids allocation on every load)
    scratch: Vec<u8>,
}

impl<P: CachedPage> PageCache<P> {
    /// Create a new cache over `file` holding at most `capacity` pages
    pub fn new(file: PagedFile, capacity: usize, metrics: Arc<CacheMetrics>) -> Self {
        let capacity = capacity.max(1);
        let scratch = vec![0u8; file.page_size()];
        Self {
            file,
            pool: LruCache::with_hasher(non_zero(capacity), ahash::RandomState::new()),
            capacity,
            metrics,
            scratch,
        }
    }

    /// Get a mutable reference to the backing file
    pub fn file_mut(&mut self) -> &mut PagedFile {
        &mut self.file
    }

    /// Maximum number of resident pages
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get a page, loading it from disk if necessary
    pub fn get(&mut self, page_id: PageId) -> Result<&P, P::Error> {
        if !self.pool.contains(&page_id) {
            self.load_page(page_id)?;
        }

        match self.pool.get(&page_id) {
            Some(entry) => Ok(&entry.page),
            None => Err(FileError::PageNotFound(page_id).into()),
        }
    }

    /// Get a mutable reference to a page, loading it if necessary
    /// This automatically marks the page as dirty
    pub fn get_mut(&mut self, page_id: PageId) -> Result<&mut P, P::Error> {
        if !self.pool.contains(&page_id) {
            self.load_page(page_id)?;
        }

        match self.pool.get_mut(&page_id) {
            Some(entry) => {
                entry.dirty = true;
                Ok(&mut entry.page)
            }
            None => Err(FileError::PageNotFound(page_id).into()),
        }
    }

    /// Put a page into the cache without reading it, replacing any resident copy
    ///
    /// The page is marked dirty so it reaches disk on eviction or flush.
    pub fn insert(&mut self, page_id: PageId, page: P) -> FileResult<()> {
        if let Some(entry) = self.pool.get_mut(&page_id) {
            entry.page = page;
            entry.dirty = true;
            return Ok(());
        }

        self.make_room()?;
        self.pool.put(page_id, CacheEntry { page, dirty: true });
        self.metrics.record_load(self.file.page_size());
        Ok(())
    }

    /// Flush all dirty pages to disk and sync the file
    pub fn flush_all(&mut self) -> FileResult<()> {
        // Use iter() to avoid updating LRU order during flush
        let dirty_pages: Vec<PageId> = self
            .pool
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(page_id, _)| *page_id)
            .collect();

        for page_id in dirty_pages {
            if let Some(entry) = self.pool.peek_mut(&page_id)
                && entry.dirty
            {
                self.scratch.fill(0);
                entry.page.encode(&mut self.scratch);
                self.file.write_page(page_id, &self.scratch)?;
                entry.dirty = false;
            }
        }

        self.file.sync()?;
        Ok(())
    }

    /// Drop every resident page without writing anything back
    pub fn discard_all(&mut self) {
        self.metrics
            .record_release(self.pool.len(), self.file.page_size());
        self.pool.clear();
    }

    /// Change the maximum number of resident pages, writing back any surplus
    pub fn set_capacity(&mut self, capacity: usize) -> FileResult<()> {
        let capacity = capacity.max(1);
        while self.pool.len() > capacity {
            self.evict_lru_page()?;
        }
        self.pool.resize(non_zero(capacity));
        self.capacity = capacity;
        Ok(())
    }

    /// Get the number of pages currently in the cache
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Check if the cache holds no pages
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Check if a page is resident
    pub fn is_cached(&self, page_id: PageId) -> bool {
        self.pool.contains(&page_id)
    }

    /// Get the number of dirty pages in the cache
    pub fn dirty_page_count(&self) -> usize {
        self.pool.iter().filter(|(_, e)| e.dirty).count()
    }

    /// Load a page from disk into the pool
    fn load_page(&mut self, page_id: PageId) -> Result<(), P::Error> {
        self.make_room()?;

        self.file.read_page(page_id, &mut self.scratch)?;
        let page = P::decode(page_id, &self.scratch)?;

        self.pool.put(page_id, CacheEntry { page, dirty: false });
        self.metrics.record_load(self.file.page_size());
        Ok(())
    }

    /// Evict until there is space for one more page
    fn make_room(&mut self) -> FileResult<()> {
        while self.pool.len() >= self.capacity {
            self.evict_lru_page()?;
        }
        Ok(())
    }

    /// Evict the least recently used page, writing it back if dirty
    fn evict_lru_page(&mut self) -> FileResult<()> {
        if let Some((page_id, entry)) = self.pool.pop_lru() {
            self.metrics.record_release(1, self.file.page_size());
            if entry.dirty {
                self.scratch.fill(0);
                entry.page.encode(&mut self.scratch);
                self.file.write_page(page_id, &self.scratch)?;
            }
        }
        Ok(())
    }
}

impl<P: CachedPage> Drop for PageCache<P> {
    fn drop(&mut self) {
        // Flush all dirty pages when the cache is dropped
        let _ = self.flush_all();
        self.discard_all();
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}
