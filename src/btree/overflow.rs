//! Overflow value storage.
//!
//! Normal values (64..=4000 bytes) share slotted data blocks: a slot
//! directory grows forward from the header while payloads grow backward
//! from the page end. Freed slots only bump the block's fragmentation
//! counter; a block whose slots are all free goes back to the allocator.
//!
//! Huge values (> 4000 bytes) get a singly linked chain of whole pages,
//! 4 bytes of next pointer followed by payload.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::alloc::PageAllocator;
use crate::buffer::BufferPool;
use crate::common::{INVALID_PAGE_ID, PageId, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::sync::LatchMode;

use super::value::NORMAL_MAX;

const BLOCK_HEADER_SIZE: usize = 8;
const SLOT_ENTRY_SIZE: usize = 4;

const OFF_SLOT_COUNT: usize = 0;
const OFF_FRAG_BYTES: usize = 2;
const OFF_FREE_TAIL: usize = 4;

/// Payload bytes per page of a huge-value chain.
pub const CHAIN_PAYLOAD: usize = PAGE_SIZE - 4;

#[inline]
fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

#[inline]
fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

/// Slotted storage for normal-sized values.
pub struct OverflowStore {
    pool: Arc<BufferPool>,
    alloc: Arc<PageAllocator>,
    /// Block new writes go to first; `INVALID_PAGE_ID` when none is open.
    active_block: AtomicU32,
}

impl OverflowStore {
    pub fn new(pool: Arc<BufferPool>, alloc: Arc<PageAllocator>) -> Self {
        Self {
            pool,
            alloc,
            active_block: AtomicU32::new(INVALID_PAGE_ID),
        }
    }

    /// Current active block, persisted in the catalog across restarts.
    pub fn active_block(&self) -> PageId {
        self.active_block.load(Ordering::Acquire)
    }

    pub fn set_active_block(&self, page: PageId) {
        self.active_block.store(page, Ordering::Release);
    }

    /// Store `value` and return its `(block page, slot)` address.
    pub fn write(&self, value: &[u8]) -> Result<(PageId, u16)> {
        debug_assert!(!value.is_empty() && value.len() <= NORMAL_MAX);

        let active = self.active_block.load(Ordering::Acquire);
        if active != INVALID_PAGE_ID {
            if let Some(slot) = self.try_append(active, value)? {
                return Ok((active, slot));
            }
        }

        // Open a fresh block near the previous one.
        let hint = if active != INVALID_PAGE_ID { active } else { 0 };
        let page = self.alloc.alloc(hint)?;
        {
            let mut guard = self.pool.fetch(page, LatchMode::Exclusive)?;
            let data = guard.data_mut();
            data.fill(0);
            put_u16(data, OFF_FREE_TAIL, PAGE_SIZE as u16);
            guard.mark_dirty();
        }
        self.active_block.store(page, Ordering::Release);
        match self.try_append(page, value)? {
            Some(slot) => Ok((page, slot)),
            None => Err(DbError::Storage("fresh overflow block rejected value".into())),
        }
    }

    fn try_append(&self, page: PageId, value: &[u8]) -> Result<Option<u16>> {
        let mut guard = self.pool.fetch(page, LatchMode::Exclusive)?;
        let data = guard.data_mut();

        let slot_count = get_u16(data, OFF_SLOT_COUNT) as usize;
        // free_tail of 0 encodes "page end" right after initialization
        let free_tail = match get_u16(data, OFF_FREE_TAIL) as usize {
            0 => PAGE_SIZE,
            t => t,
        };
        let dir_end = BLOCK_HEADER_SIZE + slot_count * SLOT_ENTRY_SIZE;
        if free_tail < dir_end + SLOT_ENTRY_SIZE + value.len() {
            return Ok(None);
        }

        let payload_off = free_tail - value.len();
        data[payload_off..free_tail].copy_from_slice(value);
        let slot_off = dir_end;
        put_u16(data, slot_off, payload_off as u16);
        put_u16(data, slot_off + 2, value.len() as u16);
        put_u16(data, OFF_SLOT_COUNT, (slot_count + 1) as u16);
        put_u16(data, OFF_FREE_TAIL, payload_off as u16);
        guard.mark_dirty();
        Ok(Some(slot_count as u16))
    }

    /// Read back a stored value. The length must match the descriptor.
    pub fn read(&self, page: PageId, slot: u16, len: u16) -> Result<Vec<u8>> {
        let guard = self.pool.fetch(page, LatchMode::Shared)?;
        let data = guard.data();

        let slot_count = get_u16(data, OFF_SLOT_COUNT);
        if slot >= slot_count {
            return Err(DbError::CorruptedMetadata(format!(
                "overflow slot {} out of range ({} slots)",
                slot, slot_count
            )));
        }
        let slot_off = BLOCK_HEADER_SIZE + slot as usize * SLOT_ENTRY_SIZE;
        let payload_off = get_u16(data, slot_off) as usize;
        let stored_len = get_u16(data, slot_off + 2);
        if stored_len != len || payload_off + len as usize > PAGE_SIZE {
            return Err(DbError::CorruptedMetadata(format!(
                "overflow slot {} length mismatch ({} != {})",
                slot, stored_len, len
            )));
        }
        Ok(data[payload_off..payload_off + len as usize].to_vec())
    }

    /// Release one slot. When the whole block becomes garbage the page goes
    /// back to the allocator.
    pub fn free(&self, page: PageId, slot: u16) -> Result<()> {
        let all_free = {
            let mut guard = self.pool.fetch(page, LatchMode::Exclusive)?;
            let data = guard.data_mut();

            let slot_count = get_u16(data, OFF_SLOT_COUNT) as usize;
            if slot as usize >= slot_count {
                return Ok(());
            }
            let slot_off = BLOCK_HEADER_SIZE + slot as usize * SLOT_ENTRY_SIZE;
            let len = get_u16(data, slot_off + 2);
            if len == 0 {
                return Ok(());
            }
            put_u16(data, slot_off + 2, 0);
            let frag = get_u16(data, OFF_FRAG_BYTES) + len;
            put_u16(data, OFF_FRAG_BYTES, frag);

            let all_free = (0..slot_count).all(|s| {
                get_u16(data, BLOCK_HEADER_SIZE + s * SLOT_ENTRY_SIZE + 2) == 0
            });
            guard.mark_dirty();
            all_free
        };

        if all_free {
            let _ = self
                .active_block
                .compare_exchange(page, INVALID_PAGE_ID, Ordering::AcqRel, Ordering::Acquire);
            self.alloc.free(page)?;
        }
        Ok(())
    }
}

// ============================================================================
// Huge value chains
// ============================================================================

/// Write `value` as a chain of whole pages, head to tail. On any failure
/// every page already taken for the chain is returned to the allocator.
pub fn chain_write(pool: &BufferPool, alloc: &PageAllocator, value: &[u8]) -> Result<PageId> {
    debug_assert!(value.len() > NORMAL_MAX);
    let num_pages = value.len().div_ceil(CHAIN_PAYLOAD);

    let mut pages = Vec::with_capacity(num_pages);
    let mut hint = 0;
    for _ in 0..num_pages {
        match alloc.alloc(hint) {
            Ok(page) => {
                hint = page;
                pages.push(page);
            }
            Err(e) => {
                for page in pages {
                    let _ = alloc.free(page);
                }
                return Err(DbError::ValueTooLarge(format!(
                    "chain allocation failed: {}",
                    e
                )));
            }
        }
    }

    let fill = || -> Result<()> {
        for (i, page) in pages.iter().enumerate() {
            let mut guard = pool.fetch(*page, LatchMode::Exclusive)?;
            let data = guard.data_mut();
            let next = pages.get(i + 1).copied().unwrap_or(INVALID_PAGE_ID);
            data[0..4].copy_from_slice(&next.to_le_bytes());
            let chunk_start = i * CHAIN_PAYLOAD;
            let chunk = &value[chunk_start..value.len().min(chunk_start + CHAIN_PAYLOAD)];
            data[4..4 + chunk.len()].copy_from_slice(chunk);
            data[4 + chunk.len()..].fill(0);
            guard.mark_dirty();
        }
        Ok(())
    };
    if let Err(e) = fill() {
        for page in pages {
            let _ = alloc.free(page);
        }
        return Err(e);
    }
    Ok(pages[0])
}

/// Read a chained value of `total_len` bytes starting at `first_page`.
pub fn chain_read(pool: &BufferPool, first_page: PageId, total_len: u64) -> Result<Vec<u8>> {
    let total = total_len as usize;
    let mut out = Vec::with_capacity(total);
    let mut page = first_page;
    let mut remaining = total;
    let max_hops = total.div_ceil(CHAIN_PAYLOAD) + 1;
    let mut hops = 0;

    while remaining > 0 {
        if page == INVALID_PAGE_ID || hops > max_hops {
            return Err(DbError::CorruptedMetadata("broken value chain".into()));
        }
        let guard = pool.fetch(page, LatchMode::Shared)?;
        let data = guard.data();
        let take = remaining.min(CHAIN_PAYLOAD);
        out.extend_from_slice(&data[4..4 + take]);
        page = u32::from_le_bytes(data[0..4].try_into().unwrap());
        remaining -= take;
        hops += 1;
    }
    Ok(out)
}

/// Free every page of a chain.
pub fn chain_free(
    pool: &BufferPool,
    alloc: &PageAllocator,
    first_page: PageId,
    total_len: u64,
) -> Result<()> {
    let mut page = first_page;
    let max_hops = (total_len as usize).div_ceil(CHAIN_PAYLOAD) + 1;
    let mut hops = 0;

    while page != INVALID_PAGE_ID && hops < max_hops {
        let next = {
            let guard = pool.fetch(page, LatchMode::Shared)?;
            u32::from_le_bytes(guard.data()[0..4].try_into().unwrap())
        };
        alloc.free(page)?;
        page = next;
        hops += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FIRST_GROUP_PAGE, PAGES_PER_GROUP};
    use crate::store::PageStore;
    use tempfile::tempdir;

    fn fixture(dir: &std::path::Path) -> (Arc<BufferPool>, Arc<PageAllocator>) {
        let store = Arc::new(
            PageStore::create(dir.join("overflow.db"), FIRST_GROUP_PAGE + PAGES_PER_GROUP)
                .unwrap(),
        );
        let pool = Arc::new(BufferPool::new(Arc::clone(&store), 64));
        let alloc =
            Arc::new(PageAllocator::create(Arc::clone(&store), Arc::clone(&pool)).unwrap());
        (pool, alloc)
    }

    #[test]
    fn slots_pack_into_one_block() {
        let dir = tempdir().unwrap();
        let (pool, alloc) = fixture(dir.path());
        let store = OverflowStore::new(pool, alloc);

        let a = store.write(&[0xAA; 100]).unwrap();
        let b = store.write(&[0xBB; 200]).unwrap();
        assert_eq!(a.0, b.0, "small values share a block");
        assert_ne!(a.1, b.1);

        assert_eq!(store.read(a.0, a.1, 100).unwrap(), vec![0xAA; 100]);
        assert_eq!(store.read(b.0, b.1, 200).unwrap(), vec![0xBB; 200]);
    }

    #[test]
    fn full_block_rolls_over() {
        let dir = tempdir().unwrap();
        let (pool, alloc) = fixture(dir.path());
        let store = OverflowStore::new(pool, alloc);

        let first = store.write(&[1u8; NORMAL_MAX]).unwrap();
        let second = store.write(&[2u8; NORMAL_MAX]).unwrap();
        assert_ne!(first.0, second.0, "a full block forces a new one");
        assert_eq!(store.read(first.0, first.1, NORMAL_MAX as u16).unwrap()[0], 1);
        assert_eq!(store.read(second.0, second.1, NORMAL_MAX as u16).unwrap()[0], 2);
    }

    #[test]
    fn freeing_every_slot_releases_the_block() {
        let dir = tempdir().unwrap();
        let (pool, alloc) = fixture(dir.path());
        let free_before = alloc.group_free_pages(0);
        let store = OverflowStore::new(pool, Arc::clone(&alloc));

        let (page, slot) = store.write(&[7u8; 500]).unwrap();
        let (page2, slot2) = store.write(&[8u8; 500]).unwrap();
        assert_eq!(page, page2);

        store.free(page, slot).unwrap();
        // block still alive: second slot in use
        assert_eq!(store.read(page, slot2, 500).unwrap(), vec![8u8; 500]);

        store.free(page, slot2).unwrap();
        assert_eq!(alloc.group_free_pages(0), free_before);
        store.free(page, slot2).unwrap(); // idempotent
    }

    #[test]
    fn chain_roundtrip_and_free() {
        let dir = tempdir().unwrap();
        let (pool, alloc) = fixture(dir.path());
        let free_before = alloc.group_free_pages(0);

        let value: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let first = chain_write(&pool, &alloc, &value).unwrap();
        // 10000 bytes over 4092-byte payloads -> 3 pages
        assert_eq!(alloc.group_free_pages(0), free_before - 3);

        let back = chain_read(&pool, first, value.len() as u64).unwrap();
        assert_eq!(back, value);

        chain_free(&pool, &alloc, first, value.len() as u64).unwrap();
        assert_eq!(alloc.group_free_pages(0), free_before);
    }
}
