//! Embedded persistence engines: a disk-backed duplicate-key B+ tree and a
//! block-chained blob file store, sharing one paged-file and page-cache layer.

pub mod blob;
pub mod btree;
pub mod config;
pub mod file;

pub use blob::{BlobError, BlobFileSystem, BlobHandle, BlobReader, BlobResult, BlobWriter, BlockId};
pub use btree::{BTree, BTreeError, BTreeResult, CompoundKey, FixedKey, KeyPair, RangeIter};
pub use config::{BTreeOptions, BlobOptions, ConfigError, StoreConfig};
pub use file::{CacheMetrics, FileError, FileResult};
