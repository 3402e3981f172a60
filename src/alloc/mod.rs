//! Page allocator: superblock + GDT + per-group allocation bitmaps.
//!
//! The superblock and GDT are cached in memory and written directly through
//! the page store, so metadata is never double-cached. Bitmap pages travel
//! through the buffer pool like any other page; individual words are claimed
//! with atomic `fetch_or` under a shared frame latch, so concurrent
//! allocators scan the same bitmap in parallel and never hand out the same
//! page twice.

mod gdt;
mod superblock;

pub use gdt::{Gdt, GroupDesc};
pub use superblock::{Superblock, FORMAT_VERSION, SUPERBLOCK_MAGIC};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::common::{
    group_of_page, BITMAP_PAGES_PER_GROUP, CATALOG_PAGE, DATA_PAGES_PER_GROUP, FIRST_GROUP_PAGE,
    GDT_PAGE_COUNT, GDT_START_PAGE, INVALID_PAGE_ID, MAX_GROUPS, PageId, PAGES_PER_GROUP,
    PAGE_SIZE, SUPERBLOCK_PAGE, WORDS_PER_BITMAP_PAGE, WORDS_PER_GROUP,
};
use crate::error::{DbError, Result};
use crate::store::PageStore;
use crate::sync::{LatchMode, RwsxLatch};

pub struct PageAllocator {
    store: Arc<PageStore>,
    pool: Arc<BufferPool>,
    sb: Superblock,
    gdt: Gdt,
    /// Serializes growth and metadata persistence (DCLI).
    latch: RwsxLatch,
    /// Last group an allocation succeeded in; the default starting point
    /// when the caller has no locality hint.
    last_group: AtomicU32,
}

impl PageAllocator {
    /// Initialize pristine metadata on a freshly created store. The store
    /// must be sized for exactly the metadata area plus one group.
    pub fn create(store: Arc<PageStore>, pool: Arc<BufferPool>) -> Result<Self> {
        let expected = FIRST_GROUP_PAGE + PAGES_PER_GROUP;
        if store.num_pages() != expected {
            return Err(DbError::InvalidArgument(format!(
                "new store must have {} pages, found {}",
                expected,
                store.num_pages()
            )));
        }

        let sb = Superblock::new(expected, 1);
        let gdt = Gdt::new();
        gdt.init_group(0, FIRST_GROUP_PAGE, DATA_PAGES_PER_GROUP as u16);

        // Group 0 bitmaps: only the bitmap pages themselves are taken.
        let mut buf = [0u8; PAGE_SIZE];
        buf[0] = 0b11;
        store.write_page(FIRST_GROUP_PAGE, &buf)?;
        buf[0] = 0;
        store.write_page(FIRST_GROUP_PAGE + 1, &buf)?;

        // Empty catalog page.
        sb.catalog_checksum
            .store(crc32c::crc32c(&buf), Ordering::Release);
        store.write_page(CATALOG_PAGE, &buf)?;

        let alloc = Self {
            store,
            pool,
            sb,
            gdt,
            latch: RwsxLatch::new(),
            last_group: AtomicU32::new(0),
        };
        alloc.persist()?;
        alloc.store.sync()?;
        Ok(alloc)
    }

    /// Load and validate metadata from an existing store. Any checksum or
    /// size mismatch is fatal.
    pub fn open(store: Arc<PageStore>, pool: Arc<BufferPool>) -> Result<Self> {
        let mut buf = [0u8; PAGE_SIZE];
        store.read_page(SUPERBLOCK_PAGE, &mut buf)?;
        let sb = Superblock::decode(&buf)?;

        if sb.total_pages.load(Ordering::Acquire) != store.num_pages() {
            return Err(DbError::CorruptedMetadata(format!(
                "superblock says {} pages, store has {}",
                sb.total_pages.load(Ordering::Acquire),
                store.num_pages()
            )));
        }

        let gdt = Gdt::new();
        for i in 0..GDT_PAGE_COUNT as usize {
            store.read_page(GDT_START_PAGE + i as u32, &mut buf)?;
            let expected = sb.gdt_checksums[i].load(Ordering::Acquire);
            let actual = crc32c::crc32c(&buf);
            if actual != expected {
                return Err(DbError::CorruptedMetadata(format!(
                    "GDT page {} checksum mismatch",
                    i
                )));
            }
            gdt.decode_page(i, &buf);
        }

        store.read_page(CATALOG_PAGE, &mut buf)?;
        if crc32c::crc32c(&buf) != sb.catalog_checksum.load(Ordering::Acquire) {
            return Err(DbError::CorruptedMetadata("catalog checksum mismatch".into()));
        }

        // Every group below total_groups must be initialized.
        let groups = sb.total_groups.load(Ordering::Acquire);
        for g in 0..groups {
            let start = gdt.desc(g).start.load(Ordering::Acquire);
            if start != crate::common::group_start_page(g) {
                return Err(DbError::CorruptedMetadata(format!(
                    "group {} descriptor start {} out of place",
                    g, start
                )));
            }
        }

        Ok(Self {
            store,
            pool,
            sb,
            gdt,
            latch: RwsxLatch::new(),
            last_group: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn total_pages(&self) -> u32 {
        self.sb.total_pages.load(Ordering::Acquire)
    }

    #[inline]
    pub fn total_groups(&self) -> u32 {
        self.sb.total_groups.load(Ordering::Acquire)
    }

    /// Free data pages remaining in a group, from the cached descriptor.
    pub fn group_free_pages(&self, group: u32) -> u16 {
        self.gdt.desc(group).free_pages.load(Ordering::Acquire)
    }

    /// Allocate one page. `hint` is a previously used page whose group is
    /// preferred (0 means "anywhere"). Grows the store by one group when
    /// every existing group is full.
    pub fn alloc(&self, hint: PageId) -> Result<PageId> {
        let groups = self.total_groups();
        let start_group = match group_of_page(hint) {
            Some(g) if g < groups => g,
            _ => self.last_group.load(Ordering::Relaxed).min(groups - 1),
        };

        for k in 0..groups {
            let g = (start_group + k) % groups;
            if let Some(page) = self.try_alloc_in_group(g)? {
                self.last_group.store(g, Ordering::Relaxed);
                return Ok(page);
            }
        }

        self.grow()?;
        let g = self.total_groups() - 1;
        if let Some(page) = self.try_alloc_in_group(g)? {
            self.last_group.store(g, Ordering::Relaxed);
            return Ok(page);
        }
        Err(DbError::OutOfSpace)
    }

    fn try_alloc_in_group(&self, group: u32) -> Result<Option<PageId>> {
        let desc = self.gdt.desc(group);
        let start = desc.start.load(Ordering::Acquire);
        if start == INVALID_PAGE_ID || desc.free_pages.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }

        let bm0 = self.pool.fetch(start, LatchMode::Shared)?;
        let bm1 = self.pool.fetch(start + 1, LatchMode::Shared)?;

        let hint_word = desc.last_set.load(Ordering::Relaxed) as usize % WORDS_PER_GROUP;
        for k in 0..WORDS_PER_GROUP {
            let w = (hint_word + k) % WORDS_PER_GROUP;
            let (guard, word_idx) = if w < WORDS_PER_BITMAP_PAGE {
                (&bm0, w)
            } else {
                (&bm1, w - WORDS_PER_BITMAP_PAGE)
            };
            let word = &guard.atomic_words()[word_idx];
            loop {
                let current = word.load(Ordering::Acquire);
                if current == u64::MAX {
                    break;
                }
                let bit = (!current).trailing_zeros();
                let mask = 1u64 << bit;
                let prev = word.fetch_or(mask, Ordering::AcqRel);
                if prev & mask == 0 {
                    // The bit is ours.
                    guard.mark_dirty();
                    desc.free_pages.fetch_sub(1, Ordering::AcqRel);
                    desc.last_set.store(w as u16, Ordering::Relaxed);
                    return Ok(Some(start + (w as u32) * 64 + bit));
                }
                // Someone else claimed it; rescan the word.
            }
        }
        Ok(None)
    }

    /// Return a page to its group. Out-of-range and metadata page numbers
    /// are ignored, so the call is idempotent.
    pub fn free(&self, page: PageId) -> Result<()> {
        if page >= self.total_pages() {
            return Ok(());
        }
        let group = match group_of_page(page) {
            Some(g) => g,
            None => return Ok(()),
        };
        let desc = self.gdt.desc(group);
        let start = desc.start.load(Ordering::Acquire);
        if start == INVALID_PAGE_ID {
            return Ok(());
        }
        let offset = page - start;
        if offset < BITMAP_PAGES_PER_GROUP {
            // Never release the bitmaps themselves.
            return Ok(());
        }

        let word_in_group = (offset / 64) as usize;
        let bit = offset % 64;
        let bm_page = start + (word_in_group >= WORDS_PER_BITMAP_PAGE) as u32;
        let guard = self.pool.fetch(bm_page, LatchMode::Shared)?;
        let word = &guard.atomic_words()[word_in_group % WORDS_PER_BITMAP_PAGE];
        let mask = 1u64 << bit;
        let prev = word.fetch_and(!mask, Ordering::AcqRel);
        if prev & mask != 0 {
            guard.mark_dirty();
            desc.free_pages.fetch_add(1, Ordering::AcqRel);
            desc.last_set.store(word_in_group as u16, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Grow the file by one group. Double-checked: a concurrent grower that
    /// got there first satisfies the request.
    pub fn grow(&self) -> Result<()> {
        let snapshot = self.sb.total_pages.load(Ordering::Acquire);
        self.latch.lock_sx();
        if self.sb.total_pages.load(Ordering::Acquire) != snapshot {
            // Someone else already grew.
            self.latch.unlock_sx();
            return Ok(());
        }
        let result = self.grow_locked(snapshot);
        self.latch.unlock_sx();
        result
    }

    fn grow_locked(&self, snapshot: u32) -> Result<()> {
        let new_group = self.sb.total_groups.load(Ordering::Acquire);
        if new_group as usize >= MAX_GROUPS {
            return Err(DbError::OutOfSpace);
        }
        self.store.grow(PAGES_PER_GROUP)?;

        let group_start = snapshot;
        self.gdt
            .init_group(new_group, group_start, DATA_PAGES_PER_GROUP as u16);

        // New bitmaps: zeroed except the two bits covering the bitmaps
        // themselves. Durable before any metadata mentions the group.
        for (i, bm_page) in [group_start, group_start + 1].into_iter().enumerate() {
            let mut guard = self.pool.fetch(bm_page, LatchMode::Exclusive)?;
            let data = guard.data_mut();
            data.fill(0);
            if i == 0 {
                data[0] = 0b11;
            }
            guard.mark_dirty();
            drop(guard);
            self.pool.flush(bm_page)?;
        }
        self.store.sync()?;

        self.sb
            .total_pages
            .fetch_add(PAGES_PER_GROUP, Ordering::AcqRel);
        self.sb.total_groups.fetch_add(1, Ordering::AcqRel);
        self.persist()?;
        self.store.sync()?;
        tracing::debug!(
            group = new_group,
            start = group_start,
            "allocator grew by one group"
        );
        Ok(())
    }

    /// Recompute checksums and write the superblock and GDT through the
    /// store.
    fn persist(&self) -> Result<()> {
        let mut buf = [0u8; PAGE_SIZE];
        for i in 0..GDT_PAGE_COUNT as usize {
            self.gdt.encode_page(i, &mut buf);
            self.sb.gdt_checksums[i].store(crc32c::crc32c(&buf), Ordering::Release);
            self.store.write_page(GDT_START_PAGE + i as u32, &buf)?;
        }
        self.sb.encode(&mut buf);
        self.store.write_page(SUPERBLOCK_PAGE, &buf)?;
        Ok(())
    }

    /// Read the catalog page. Its checksum was verified at open.
    pub fn read_catalog(&self, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.store.read_page(CATALOG_PAGE, buf)
    }

    /// Write the catalog page and remember its checksum for the next
    /// persist.
    pub fn write_catalog(&self, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        self.store.write_page(CATALOG_PAGE, buf)?;
        self.sb
            .catalog_checksum
            .store(crc32c::crc32c(buf), Ordering::Release);
        Ok(())
    }

    /// Persist metadata and release. Called on the way down, before the
    /// buffer pool flushes.
    pub fn destroy(&self) -> Result<()> {
        self.latch.lock_sx();
        let result = self.persist();
        self.latch.unlock_sx();
        result?;
        self.store.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh(dir: &std::path::Path) -> (Arc<PageStore>, Arc<BufferPool>, PageAllocator) {
        let store = Arc::new(
            PageStore::create(dir.join("alloc.db"), FIRST_GROUP_PAGE + PAGES_PER_GROUP).unwrap(),
        );
        let pool = Arc::new(BufferPool::new(Arc::clone(&store), 64));
        let alloc = PageAllocator::create(Arc::clone(&store), Arc::clone(&pool)).unwrap();
        (store, pool, alloc)
    }

    #[test]
    fn first_allocations_skip_metadata_pages() {
        let dir = tempdir().unwrap();
        let (_store, _pool, alloc) = fresh(dir.path());

        let p1 = alloc.alloc(0).unwrap();
        let p2 = alloc.alloc(0).unwrap();
        assert_eq!(p1, FIRST_GROUP_PAGE + 2);
        assert_eq!(p2, FIRST_GROUP_PAGE + 3);
        assert_eq!(
            alloc.group_free_pages(0),
            DATA_PAGES_PER_GROUP as u16 - 2
        );
    }

    #[test]
    fn free_then_realloc_reuses_the_page() {
        let dir = tempdir().unwrap();
        let (_store, _pool, alloc) = fresh(dir.path());

        let page = alloc.alloc(0).unwrap();
        alloc.free(page).unwrap();
        assert_eq!(alloc.group_free_pages(0), DATA_PAGES_PER_GROUP as u16);

        let again = alloc.alloc(page).unwrap();
        assert_eq!(again, page);
    }

    #[test]
    fn free_is_idempotent_and_ignores_metadata() {
        let dir = tempdir().unwrap();
        let (_store, _pool, alloc) = fresh(dir.path());

        let page = alloc.alloc(0).unwrap();
        alloc.free(page).unwrap();
        alloc.free(page).unwrap(); // double free: no count drift
        assert_eq!(alloc.group_free_pages(0), DATA_PAGES_PER_GROUP as u16);

        alloc.free(SUPERBLOCK_PAGE).unwrap();
        alloc.free(CATALOG_PAGE).unwrap();
        alloc.free(FIRST_GROUP_PAGE).unwrap(); // the bitmap itself
        alloc.free(u32::MAX - 10).unwrap(); // far out of range
        assert_eq!(alloc.group_free_pages(0), DATA_PAGES_PER_GROUP as u16);
    }

    #[test]
    fn persist_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alloc.db");
        let mut held = Vec::new();

        {
            let store = Arc::new(
                PageStore::create(&path, FIRST_GROUP_PAGE + PAGES_PER_GROUP).unwrap(),
            );
            let pool = Arc::new(BufferPool::new(Arc::clone(&store), 64));
            let alloc = PageAllocator::create(Arc::clone(&store), Arc::clone(&pool)).unwrap();
            for _ in 0..10 {
                held.push(alloc.alloc(0).unwrap());
            }
            alloc.free(held[3]).unwrap();
            alloc.destroy().unwrap();
            pool.destroy().unwrap();
            store.close().unwrap();
        }

        let store = Arc::new(PageStore::open(&path).unwrap());
        let pool = Arc::new(BufferPool::new(Arc::clone(&store), 64));
        let alloc = PageAllocator::open(Arc::clone(&store), pool).unwrap();
        assert_eq!(alloc.total_groups(), 1);
        assert_eq!(
            alloc.group_free_pages(0),
            DATA_PAGES_PER_GROUP as u16 - 9
        );

        // The freed page is available again; the held ones are not.
        let fresh_page = alloc.alloc(held[3]).unwrap();
        assert_eq!(fresh_page, held[3]);
    }

    #[test]
    fn corrupted_superblock_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alloc.db");
        {
            let store = Arc::new(
                PageStore::create(&path, FIRST_GROUP_PAGE + PAGES_PER_GROUP).unwrap(),
            );
            let pool = Arc::new(BufferPool::new(Arc::clone(&store), 16));
            let alloc = PageAllocator::create(Arc::clone(&store), pool).unwrap();
            alloc.destroy().unwrap();
            store.close().unwrap();
        }

        // Flip a byte in the superblock header.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap();
            file.seek(SeekFrom::Start(14)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let store = Arc::new(PageStore::open(&path).unwrap());
        let pool = Arc::new(BufferPool::new(Arc::clone(&store), 16));
        assert!(matches!(
            PageAllocator::open(store, pool),
            Err(DbError::CorruptedMetadata(_))
        ));
    }

    #[test]
    fn corrupted_gdt_page_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alloc.db");
        {
            let store = Arc::new(
                PageStore::create(&path, FIRST_GROUP_PAGE + PAGES_PER_GROUP).unwrap(),
            );
            let pool = Arc::new(BufferPool::new(Arc::clone(&store), 16));
            let alloc = PageAllocator::create(Arc::clone(&store), pool).unwrap();
            alloc.destroy().unwrap();
            store.close().unwrap();
        }

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap();
            // Somewhere inside GDT page 5.
            file.seek(SeekFrom::Start((1 + 5) as u64 * PAGE_SIZE as u64 + 123))
                .unwrap();
            file.write_all(&[0xAA]).unwrap();
        }

        let store = Arc::new(PageStore::open(&path).unwrap());
        let pool = Arc::new(BufferPool::new(Arc::clone(&store), 16));
        assert!(matches!(
            PageAllocator::open(store, pool),
            Err(DbError::CorruptedMetadata(_))
        ));
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            PageStore::create(
                dir.path().join("alloc.db"),
                FIRST_GROUP_PAGE + PAGES_PER_GROUP,
            )
            .unwrap(),
        );
        let pool = Arc::new(BufferPool::new(Arc::clone(&store), 64));
        let alloc =
            Arc::new(PageAllocator::create(Arc::clone(&store), Arc::clone(&pool)).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                let mut pages = Vec::new();
                for _ in 0..100 {
                    pages.push(alloc.alloc(0).unwrap());
                }
                pages
            }));
        }

        let mut all: Vec<PageId> = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count, "duplicate page handed out");
        assert_eq!(
            alloc.group_free_pages(0),
            DATA_PAGES_PER_GROUP as u16 - 800
        );
    }
}
