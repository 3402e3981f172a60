//! Anonymous in-memory page region.
//!
//! The region is a list of fixed segments so growth never relocates live
//! pages; concurrent readers and writers on existing pages proceed without
//! touching the growth path.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::{PageId, PAGE_SIZE};
use crate::error::Result;

struct Segment {
    base: PageId,
    pages: u32,
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: segment bytes are only accessed through raw-pointer copies on
// page-sized, page-aligned ranges. Callers serialize same-page access (the
// buffer pool's frame latches); disjoint pages never overlap.
unsafe impl Sync for Segment {}
unsafe impl Send for Segment {}

impl Segment {
    fn new(base: PageId, pages: u32) -> Self {
        Self {
            base,
            pages,
            data: UnsafeCell::new(vec![0u8; pages as usize * PAGE_SIZE].into_boxed_slice()),
        }
    }

    #[inline]
    fn contains(&self, page: PageId) -> bool {
        page >= self.base && page < self.base + self.pages
    }
}

pub(super) struct MemoryBacking {
    segments: RwLock<Vec<Arc<Segment>>>,
}

impl MemoryBacking {
    pub(super) fn new(num_pages: u32) -> Self {
        let mut segments = Vec::new();
        if num_pages > 0 {
            segments.push(Arc::new(Segment::new(0, num_pages)));
        }
        Self {
            segments: RwLock::new(segments),
        }
    }

    fn locate(&self, page: PageId) -> Arc<Segment> {
        let segments = self.segments.read();
        // Few segments in practice; the bounds check already ran upstream.
        for seg in segments.iter().rev() {
            if seg.contains(page) {
                return Arc::clone(seg);
            }
        }
        unreachable!("page {} not covered by any segment", page);
    }

    pub(super) fn read_page(&self, page: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let seg = self.locate(page);
        let offset = (page - seg.base) as usize * PAGE_SIZE;
        // SAFETY: offset + PAGE_SIZE is within the segment; see Sync note.
        unsafe {
            let base = (*seg.data.get()).as_ptr();
            ptr::copy_nonoverlapping(base.add(offset), buf.as_mut_ptr(), PAGE_SIZE);
        }
        Ok(())
    }

    pub(super) fn write_page(&self, page: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let seg = self.locate(page);
        let offset = (page - seg.base) as usize * PAGE_SIZE;
        // SAFETY: offset + PAGE_SIZE is within the segment; see Sync note.
        unsafe {
            let base = (*seg.data.get()).as_mut_ptr();
            ptr::copy_nonoverlapping(buf.as_ptr(), base.add(offset), PAGE_SIZE);
        }
        Ok(())
    }

    pub(super) fn grow_by(&self, current_pages: u32, n: u32) {
        if n == 0 {
            return;
        }
        let mut segments = self.segments.write();
        segments.push(Arc::new(Segment::new(current_pages, n)));
    }
}
