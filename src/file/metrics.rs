use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters of live cached pages shared between open instances
///
/// Every `PageCache` constructed with the same registry adds to the same
/// counters, so an owning process can report totals across all trees and
/// blob stores it has open. The numbers are diagnostics only.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    objects: AtomicUsize,
    bytes: AtomicUsize,
}

impl CacheMetrics {
    /// Create a new registry ready to be shared
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of pages currently resident in all caches using this registry
    pub fn objects_count(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    /// Estimated bytes held by resident pages
    pub fn used_memory(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn record_load(&self, bytes: usize) {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self, count: usize, bytes: usize) {
        self.objects.fetch_sub(count, Ordering::Relaxed);
        self.bytes.fetch_sub(count * bytes, Ordering::Relaxed);
    }
}
