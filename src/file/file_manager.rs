use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::PageId;
use super::error::{FileError, FileResult};

/// A single backing file addressed in fixed-size pages
///
/// Each open tree or blob store owns exactly one `PagedFile`; the page size
/// is chosen by the owner and never changes while the file is open.
pub struct PagedFile {
    file: File,
    page_size: usize,
}

impl PagedFile {
    /// Open a paged file, creating it (and its parent directories) if missing
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> FileResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file,
            page_size,
        })
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Read a page from the file
    ///
    /// Pages that lie (even partially) past the end of the file are reported
    /// as `ShortRead` rather than zero-filled: callers only read pages they
    /// have previously written.
    pub fn read_page(&mut self, page_id: PageId, buffer: &mut [u8]) -> FileResult<()> {
        self.check_buffer(buffer.len())?;

        let offset = (page_id * self.page_size) as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        self.file.read_exact(buffer).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => FileError::ShortRead { page_id },
            _ => FileError::Io(e),
        })
    }

    /// Read the first `buffer.len()` bytes of the file, whatever the page size
    ///
    /// Used to inspect a header before trusting the page size it records.
    pub fn read_prefix(&mut self, buffer: &mut [u8]) -> FileResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(buffer).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => FileError::ShortRead { page_id: 0 },
            _ => FileError::Io(e),
        })
    }

    /// Write a page to the file, extending it if necessary
    pub fn write_page(&mut self, page_id: PageId, buffer: &[u8]) -> FileResult<()> {
        self.check_buffer(buffer.len())?;

        let offset = (page_id * self.page_size) as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buffer)?;
        // Note: Don't sync on every write - sync() is called on flush/close

        Ok(())
    }

    /// Length of the backing file in bytes
    pub fn len(&self) -> FileResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Check if the backing file is empty
    pub fn is_empty(&self) -> FileResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Get the number of whole or partial pages in the file
    pub fn page_count(&self) -> FileResult<usize> {
        let file_size = self.len()?;
        Ok(file_size.div_ceil(self.page_size as u64) as usize)
    }

    /// Truncate (or extend) the file to exactly `pages` pages
    pub fn set_page_count(&mut self, pages: usize) -> FileResult<()> {
        self.file.set_len((pages * self.page_size) as u64)?;
        Ok(())
    }

    /// Sync the file to disk (flush all OS buffers)
    pub fn sync(&mut self) -> FileResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn check_buffer(&self, actual: usize) -> FileResult<()> {
        if actual != self.page_size {
            return Err(FileError::InvalidPageSize {
                expected: self.page_size,
                actual,
            });
        }
        Ok(())
    }
}
