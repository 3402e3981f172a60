//! Group Descriptor Table: 64 static pages of 256 descriptors each.
//!
//! Descriptor layout (16 bytes): `start (u32) | free_pages (u16) |
//! last_set (u16) | reserved (8)`. The whole table is cached in memory;
//! counters are atomics so allocation paths read and update them without
//! the allocator latch.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::common::{DESCS_PER_GDT_PAGE, INVALID_PAGE_ID, MAX_GROUPS, PageId, PAGE_SIZE};

const DESC_SIZE: usize = 16;

pub struct GroupDesc {
    /// First page of the group; `INVALID_PAGE_ID` until the group exists.
    pub start: AtomicU32,
    pub free_pages: AtomicU16,
    /// Hint: last bitmap word index (0..1024) touched in this group.
    pub last_set: AtomicU16,
}

impl GroupDesc {
    fn empty() -> Self {
        Self {
            start: AtomicU32::new(INVALID_PAGE_ID),
            free_pages: AtomicU16::new(0),
            last_set: AtomicU16::new(0),
        }
    }
}

pub struct Gdt {
    descs: Box<[GroupDesc]>,
}

impl Gdt {
    pub fn new() -> Self {
        Self {
            descs: (0..MAX_GROUPS).map(|_| GroupDesc::empty()).collect(),
        }
    }

    #[inline]
    pub fn desc(&self, group: u32) -> &GroupDesc {
        &self.descs[group as usize]
    }

    /// Serialize one GDT page worth of descriptors.
    pub fn encode_page(&self, page_idx: usize, buf: &mut [u8; PAGE_SIZE]) {
        buf.fill(0);
        for i in 0..DESCS_PER_GDT_PAGE {
            let desc = &self.descs[page_idx * DESCS_PER_GDT_PAGE + i];
            let off = i * DESC_SIZE;
            buf[off..off + 4].copy_from_slice(&desc.start.load(Ordering::Acquire).to_le_bytes());
            buf[off + 4..off + 6]
                .copy_from_slice(&desc.free_pages.load(Ordering::Acquire).to_le_bytes());
            buf[off + 6..off + 8]
                .copy_from_slice(&desc.last_set.load(Ordering::Acquire).to_le_bytes());
        }
    }

    /// Load one GDT page worth of descriptors into the cache.
    pub fn decode_page(&self, page_idx: usize, buf: &[u8; PAGE_SIZE]) {
        for i in 0..DESCS_PER_GDT_PAGE {
            let desc = &self.descs[page_idx * DESCS_PER_GDT_PAGE + i];
            let off = i * DESC_SIZE;
            let start = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            let free = u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap());
            let last = u16::from_le_bytes(buf[off + 6..off + 8].try_into().unwrap());
            desc.start.store(start, Ordering::Release);
            desc.free_pages.store(free, Ordering::Release);
            desc.last_set.store(last, Ordering::Release);
        }
    }

    /// Initialize the descriptor of a brand-new group.
    pub fn init_group(&self, group: u32, start: PageId, free_pages: u16) {
        let desc = self.desc(group);
        desc.free_pages.store(free_pages, Ordering::Release);
        desc.last_set.store(0, Ordering::Release);
        // published last: a group is visible once its start is valid
        desc.start.store(start, Ordering::Release);
    }
}

impl Default for Gdt {
    fn default() -> Self {
        Self::new()
    }
}
