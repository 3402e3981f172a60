//! File-backed pages using positional I/O (`pread`/`pwrite`).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::common::{PageId, PAGE_SIZE};
use crate::error::{DbError, Result};

pub(super) struct FileBacking {
    file: File,
}

impl FileBacking {
    pub(super) fn create(path: &Path, num_pages: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(num_pages as u64 * PAGE_SIZE as u64)?;
        Ok(Self { file })
    }

    pub(super) fn open(path: &Path) -> Result<(Self, u32)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(DbError::Storage(format!(
                "file length {} is not a multiple of the page size",
                len
            )));
        }
        let num_pages = len / PAGE_SIZE as u64;
        if num_pages > u32::MAX as u64 {
            return Err(DbError::Storage("file exceeds the 4 TiB limit".into()));
        }
        Ok((Self { file }, num_pages as u32))
    }

    #[inline]
    pub(super) fn read_page(&self, page: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let offset = page as u64 * PAGE_SIZE as u64;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[inline]
    pub(super) fn write_page(&self, page: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let offset = page as u64 * PAGE_SIZE as u64;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Extend the file to `new_pages` pages. `set_len` zero-fills the tail.
    pub(super) fn grow_to(&self, new_pages: u32) -> Result<()> {
        self.file.set_len(new_pages as u64 * PAGE_SIZE as u64)?;
        Ok(())
    }

    pub(super) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
