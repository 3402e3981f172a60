//! Superblock: the fixed header page describing the file.
//!
//! On-disk layout (little-endian):
//!
//! ```text
//! 0   magic (u32)            "SIMD"
//! 4   version (u32)
//! 8   page_size (u32)
//! 12  total_pages (u32)
//! 16  total_groups (u32)
//! 20  gdt_start (u32)        = 1
//! 24  gdt_pages (u32)        = 64
//! 28  catalog_page (u32)     = 65
//! 32  gdt_checksum[64] (u32 each)
//! 288 sb_checksum (u32)      CRC-32C over bytes 0..32
//! 292 catalog_checksum (u32)
//! ... zero padding to 4096
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::{
    CATALOG_PAGE, FIRST_GROUP_PAGE, GDT_PAGE_COUNT, GDT_START_PAGE, MAX_GROUPS, PAGES_PER_GROUP,
    PAGE_SIZE,
};
use crate::error::{DbError, Result};

pub const SUPERBLOCK_MAGIC: u32 = 0x5349_4D44;
pub const FORMAT_VERSION: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_TOTAL_PAGES: usize = 12;
const OFF_TOTAL_GROUPS: usize = 16;
const OFF_GDT_START: usize = 20;
const OFF_GDT_PAGES: usize = 24;
const OFF_CATALOG_PAGE: usize = 28;
/// The checksum covers the fixed header only.
const HEADER_LEN: usize = 32;
const OFF_GDT_CHECKSUMS: usize = 32;
const OFF_SB_CHECKSUM: usize = 288;
const OFF_CATALOG_CHECKSUM: usize = 292;

#[inline]
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// In-memory superblock cache. The counters are atomics because readers
/// consult them without the allocator latch; everything else only changes
/// under the allocator's SX latch.
pub struct Superblock {
    pub total_pages: AtomicU32,
    pub total_groups: AtomicU32,
    pub gdt_checksums: [AtomicU32; GDT_PAGE_COUNT as usize],
    pub catalog_checksum: AtomicU32,
}

impl Superblock {
    pub fn new(total_pages: u32, total_groups: u32) -> Self {
        Self {
            total_pages: AtomicU32::new(total_pages),
            total_groups: AtomicU32::new(total_groups),
            gdt_checksums: std::array::from_fn(|_| AtomicU32::new(0)),
            catalog_checksum: AtomicU32::new(0),
        }
    }

    pub fn encode(&self, buf: &mut [u8; PAGE_SIZE]) {
        buf.fill(0);
        put_u32(buf, OFF_MAGIC, SUPERBLOCK_MAGIC);
        put_u32(buf, OFF_VERSION, FORMAT_VERSION);
        put_u32(buf, OFF_PAGE_SIZE, PAGE_SIZE as u32);
        put_u32(buf, OFF_TOTAL_PAGES, self.total_pages.load(Ordering::Acquire));
        put_u32(
            buf,
            OFF_TOTAL_GROUPS,
            self.total_groups.load(Ordering::Acquire),
        );
        put_u32(buf, OFF_GDT_START, GDT_START_PAGE);
        put_u32(buf, OFF_GDT_PAGES, GDT_PAGE_COUNT);
        put_u32(buf, OFF_CATALOG_PAGE, CATALOG_PAGE);
        for (i, checksum) in self.gdt_checksums.iter().enumerate() {
            put_u32(
                buf,
                OFF_GDT_CHECKSUMS + i * 4,
                checksum.load(Ordering::Acquire),
            );
        }
        let sb_checksum = crc32c::crc32c(&buf[..HEADER_LEN]);
        put_u32(buf, OFF_SB_CHECKSUM, sb_checksum);
        put_u32(
            buf,
            OFF_CATALOG_CHECKSUM,
            self.catalog_checksum.load(Ordering::Acquire),
        );
    }

    pub fn decode(buf: &[u8; PAGE_SIZE]) -> Result<Self> {
        if get_u32(buf, OFF_MAGIC) != SUPERBLOCK_MAGIC {
            return Err(DbError::CorruptedMetadata("bad superblock magic".into()));
        }
        if get_u32(buf, OFF_VERSION) != FORMAT_VERSION {
            return Err(DbError::CorruptedMetadata(format!(
                "unsupported format version {}",
                get_u32(buf, OFF_VERSION)
            )));
        }
        if get_u32(buf, OFF_PAGE_SIZE) != PAGE_SIZE as u32 {
            return Err(DbError::CorruptedMetadata(format!(
                "unexpected page size {}",
                get_u32(buf, OFF_PAGE_SIZE)
            )));
        }
        let expected = crc32c::crc32c(&buf[..HEADER_LEN]);
        if get_u32(buf, OFF_SB_CHECKSUM) != expected {
            return Err(DbError::CorruptedMetadata(
                "superblock checksum mismatch".into(),
            ));
        }
        if get_u32(buf, OFF_GDT_START) != GDT_START_PAGE
            || get_u32(buf, OFF_GDT_PAGES) != GDT_PAGE_COUNT
            || get_u32(buf, OFF_CATALOG_PAGE) != CATALOG_PAGE
        {
            return Err(DbError::CorruptedMetadata(
                "superblock layout fields out of place".into(),
            ));
        }

        let total_pages = get_u32(buf, OFF_TOTAL_PAGES);
        let total_groups = get_u32(buf, OFF_TOTAL_GROUPS);
        if total_groups as usize > MAX_GROUPS
            || total_groups == 0
            || total_groups as u64 * PAGES_PER_GROUP as u64 + FIRST_GROUP_PAGE as u64
                != total_pages as u64
        {
            return Err(DbError::CorruptedMetadata(format!(
                "inconsistent sizes: {} groups, {} pages",
                total_groups, total_pages
            )));
        }

        let sb = Self::new(total_pages, total_groups);
        for (i, checksum) in sb.gdt_checksums.iter().enumerate() {
            checksum.store(get_u32(buf, OFF_GDT_CHECKSUMS + i * 4), Ordering::Release);
        }
        sb.catalog_checksum
            .store(get_u32(buf, OFF_CATALOG_CHECKSUM), Ordering::Release);
        Ok(sb)
    }
}
