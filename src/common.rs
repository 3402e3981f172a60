//! Shared constants and primitive types for the on-disk layout.

/// Page number within the store. 32 bits; the file tops out at 2^32 pages.
pub type PageId = u32;

/// Standard page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Invalid page ID sentinel.
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// Page 0 holds the superblock.
pub const SUPERBLOCK_PAGE: PageId = 0;

/// First page of the group descriptor table.
pub const GDT_START_PAGE: PageId = 1;

/// The GDT occupies 64 static pages.
pub const GDT_PAGE_COUNT: u32 = 64;

/// Reserved catalog page.
pub const CATALOG_PAGE: PageId = 65;

/// First page of group 0; data groups begin here.
pub const FIRST_GROUP_PAGE: PageId = 66;

/// Pages per allocation group (256 MiB of address space).
pub const PAGES_PER_GROUP: u32 = 65_536;

/// Leading pages of every group reserved for its allocation bitmaps.
pub const BITMAP_PAGES_PER_GROUP: u32 = 2;

/// Allocatable pages per group.
pub const DATA_PAGES_PER_GROUP: u32 = PAGES_PER_GROUP - BITMAP_PAGES_PER_GROUP;

/// Descriptors per GDT page (4096 / 16).
pub const DESCS_PER_GDT_PAGE: usize = 256;

/// Maximum number of groups the static GDT can describe.
pub const MAX_GROUPS: usize = DESCS_PER_GDT_PAGE * GDT_PAGE_COUNT as usize;

/// 64-bit words per bitmap page.
pub const WORDS_PER_BITMAP_PAGE: usize = PAGE_SIZE / 8;

/// Bitmap words covering one group (two pages).
pub const WORDS_PER_GROUP: usize = WORDS_PER_BITMAP_PAGE * BITMAP_PAGES_PER_GROUP as usize;

/// First page of a given group.
#[inline]
pub fn group_start_page(group: u32) -> PageId {
    FIRST_GROUP_PAGE + group * PAGES_PER_GROUP
}

/// Group that owns a given data page, if any.
#[inline]
pub fn group_of_page(page: PageId) -> Option<u32> {
    if page < FIRST_GROUP_PAGE {
        None
    } else {
        Some((page - FIRST_GROUP_PAGE) / PAGES_PER_GROUP)
    }
}
