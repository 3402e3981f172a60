//! Page Store - durable raw 4KB page array over a file or memory region.
//!
//! Reads and writes use positional primitives; there is no shared file
//! cursor. `grow` is the only operation that may block peers. Access beyond
//! the current length is an error, never a silent extension.

mod file;
mod memory;

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{PageId, PAGE_SIZE};
use crate::error::{DbError, Result};

use file::FileBacking;
use memory::MemoryBacking;

enum Backing {
    File(FileBacking),
    Memory(MemoryBacking),
}

/// Fixed-size page array with thread-safe positional I/O and growth.
pub struct PageStore {
    backing: Backing,
    num_pages: AtomicU32,
    grow_lock: Mutex<()>,
}

impl PageStore {
    /// Create a file-backed store of `num_pages` pages. An existing file at
    /// `path` is truncated.
    pub fn create<P: AsRef<Path>>(path: P, num_pages: u32) -> Result<Self> {
        let backing = FileBacking::create(path.as_ref(), num_pages)?;
        Ok(Self {
            backing: Backing::File(backing),
            num_pages: AtomicU32::new(num_pages),
            grow_lock: Mutex::new(()),
        })
    }

    /// Create an anonymous in-memory store of `num_pages` pages.
    pub fn create_memory(num_pages: u32) -> Result<Self> {
        Ok(Self {
            backing: Backing::Memory(MemoryBacking::new(num_pages)),
            num_pages: AtomicU32::new(num_pages),
            grow_lock: Mutex::new(()),
        })
    }

    /// Open an existing file-backed store. Fails if the file length is not a
    /// multiple of the page size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (backing, num_pages) = FileBacking::open(path.as_ref())?;
        Ok(Self {
            backing: Backing::File(backing),
            num_pages: AtomicU32::new(num_pages),
            grow_lock: Mutex::new(()),
        })
    }

    /// Current length in pages.
    #[inline]
    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Acquire)
    }

    #[inline]
    fn check_bounds(&self, page: PageId) -> Result<()> {
        if page >= self.num_pages() {
            return Err(DbError::Storage(format!(
                "page {} out of range (store has {} pages)",
                page,
                self.num_pages()
            )));
        }
        Ok(())
    }

    /// Positional read of one page into `buf`.
    pub fn read_page(&self, page: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.check_bounds(page)?;
        match &self.backing {
            Backing::File(f) => f.read_page(page, buf),
            Backing::Memory(m) => m.read_page(page, buf),
        }
    }

    /// Positional write of one page from `buf`.
    pub fn write_page(&self, page: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        self.check_bounds(page)?;
        match &self.backing {
            Backing::File(f) => f.write_page(page, buf),
            Backing::Memory(m) => m.write_page(page, buf),
        }
    }

    /// Extend the store by `n` pages. The new tail is zero-filled. Growth is
    /// serialized; readers and writers on existing pages keep running.
    pub fn grow(&self, n: u32) -> Result<()> {
        let _guard = self.grow_lock.lock();
        let cur = self.num_pages.load(Ordering::Acquire);
        let new = cur
            .checked_add(n)
            .ok_or_else(|| DbError::Storage("store size overflow".into()))?;
        match &self.backing {
            Backing::File(f) => f.grow_to(new)?,
            Backing::Memory(m) => m.grow_by(cur, n),
        }
        self.num_pages.store(new, Ordering::Release);
        tracing::trace!(pages = n, total = new, "page store grown");
        Ok(())
    }

    /// Force durability. No-op for in-memory stores.
    pub fn sync(&self) -> Result<()> {
        match &self.backing {
            Backing::File(f) => f.sync(),
            Backing::Memory(_) => Ok(()),
        }
    }

    /// Sync (when file-backed) and release resources.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}
