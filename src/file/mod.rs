mod buffer_manager;
mod error;
mod file_manager;
mod metrics;

pub use buffer_manager::{CachedPage, PageCache};
pub use error::{FileError, FileResult};
pub use file_manager::PagedFile;
pub use metrics::CacheMetrics;

/// Page ID type (index of a fixed-size page within one backing file)
pub type PageId = usize;

/// Sentinel used on disk for "no page"
pub const NO_PAGE: u32 = u32::MAX;

/// Encode an optional page pointer for storage
pub(crate) fn encode_page_ref(page: Option<PageId>) -> u32 {
    page.map(|id| id as u32).unwrap_or(NO_PAGE)
}

/// Decode a stored page pointer
pub(crate) fn decode_page_ref(raw: u32) -> Option<PageId> {
    if raw == NO_PAGE {
        None
    } else {
        Some(raw as PageId)
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
