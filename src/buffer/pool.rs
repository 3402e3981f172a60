//! The buffer pool: a fixed array of frames fronted by a TLB (frame → page)
//! and a lock-free page → frame index, with QDLP eviction.
//!
//! Latching discipline:
//! - the pool's shared latch guards the hot path (lookup + pin);
//! - the pool's SX latch guards cold loads and eviction, and stays
//!   compatible with concurrent hot-path lookups;
//! - each frame's latch guards that frame's bytes, in the caller's mode.
//!
//! A cold load publishes the new page → frame mapping and takes the frame's
//! exclusive latch *before* dropping the pool SX latch. A concurrent miss
//! for the same page therefore collapses onto the in-flight frame: it pins,
//! blocks on the frame latch until the loader finishes, and revalidates the
//! TLB slot. The same revalidation resolves the race between a hot-path pin
//! and a concurrent eviction of that frame.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::common::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::store::PageStore;
use crate::sync::{AtomicU32Map, LatchMode, RwsxLatch};

use super::frame::{Frame, QueueKind};
use super::qdlp::QdlpQueues;

#[derive(Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
    ghost_hits: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub ghost_hits: u64,
}

pub struct BufferPool {
    store: Arc<PageStore>,
    frames: Box<[Frame]>,
    /// Per-frame cached page number; `INVALID_PAGE_ID` when the frame is
    /// empty or a load is in flight.
    tlb: Box<[AtomicU32]>,
    /// page → frame index.
    index: AtomicU32Map,
    latch: RwsxLatch,
    queues: QdlpQueues,
    counters: PoolCounters,
}

impl BufferPool {
    pub fn new(store: Arc<PageStore>, pool_size: usize) -> Self {
        assert!(pool_size >= 2, "buffer pool needs at least two frames");
        let frames: Box<[Frame]> = (0..pool_size).map(|_| Frame::new()).collect();
        let tlb: Box<[AtomicU32]> = (0..pool_size)
            .map(|_| AtomicU32::new(INVALID_PAGE_ID))
            .collect();
        Self {
            store,
            frames,
            tlb,
            index: AtomicU32Map::with_capacity(pool_size),
            latch: RwsxLatch::new(),
            queues: QdlpQueues::new(pool_size),
            counters: PoolCounters::default(),
        }
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// Fetch a page, returning a pinned, latched handle. The contents equal
    /// the page at the time of return.
    pub fn fetch(&self, page: PageId, mode: LatchMode) -> Result<PageGuard<'_>> {
        if page == INVALID_PAGE_ID {
            return Err(DbError::InvalidArgument("fetch of invalid page".into()));
        }
        loop {
            // Hot path: pool S latch, TLB lookup, pin.
            self.latch.lock_shared();
            if let Some(frame_idx) = self.index.get(page) {
                let frame = &self.frames[frame_idx as usize];
                frame.pin();
                frame.set_visited(true);
                self.latch.unlock_shared();

                frame.latch.lock(mode);
                if self.tlb[frame_idx as usize].load(Ordering::Acquire) == page {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PageGuard {
                        pool: self,
                        frame_idx,
                        page,
                        mode,
                    });
                }
                // Lost a race with eviction; back off and retry.
                frame.latch.unlock(mode);
                frame.unpin();
                continue;
            }
            self.latch.unlock_shared();

            match self.fetch_cold(page, mode)? {
                Some(guard) => return Ok(guard),
                None => continue,
            }
        }
    }

    /// Cold path: load the page into a victim frame under the pool SX latch.
    /// Returns `None` when another thread published the page first and the
    /// caller should retry the hot path.
    fn fetch_cold(&self, page: PageId, mode: LatchMode) -> Result<Option<PageGuard<'_>>> {
        self.latch.lock_sx();

        // Double-check: the page may have been loaded while we waited.
        if let Some(frame_idx) = self.index.get(page) {
            let frame = &self.frames[frame_idx as usize];
            frame.pin();
            frame.set_visited(true);
            self.latch.unlock_sx();

            frame.latch.lock(mode);
            if self.tlb[frame_idx as usize].load(Ordering::Acquire) == page {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(PageGuard {
                    pool: self,
                    frame_idx,
                    page,
                    mode,
                }));
            }
            frame.latch.unlock(mode);
            frame.unpin();
            return Ok(None);
        }

        let ghost_hit = self.queues.ghost_contains(page);

        let victim = match self.queues.pick_victim(&self.frames, &self.tlb) {
            Some(v) => v,
            None => {
                self.latch.unlock_sx();
                tracing::warn!(page, "no evictable frame for cold load");
                return Err(DbError::FrameUnavailable);
            }
        };
        let frame_idx = victim.frame_idx;
        let frame = &self.frames[frame_idx as usize];

        let old_page = self.tlb[frame_idx as usize].load(Ordering::Acquire);
        if old_page != INVALID_PAGE_ID {
            self.index.unset(old_page);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            if victim.from_qd {
                self.queues.record_ghost(old_page);
            }
        }
        if ghost_hit {
            self.queues.ghost_remove(page);
            self.counters.ghost_hits.fetch_add(1, Ordering::Relaxed);
        }

        // Take the frame exclusively, then publish the new mapping, all
        // before releasing the pool SX latch. Late pinners of the old page
        // drain before the X latch is granted and revalidate against the
        // TLB; pinners of the new page cannot see the mapping until the X
        // latch is already held, so they block until the load completes.
        frame.latch.lock_exclusive();
        self.tlb[frame_idx as usize].store(page, Ordering::Release);
        self.index.set(page, frame_idx);
        self.latch.unlock_sx();

        // I/O outside the pool latch, under the frame's X latch.
        if let Err(e) = self.load_into_frame(frame, old_page, page) {
            self.rollback_cold_load(frame_idx, page);
            frame.latch.unlock_exclusive();
            return Err(e);
        }

        frame.set_visited(false);
        self.queues.enqueue_loaded(&self.frames, frame_idx, ghost_hit);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        match mode {
            LatchMode::Exclusive => {}
            LatchMode::Shared => {
                frame.latch.downgrade_shared()?;
            }
            LatchMode::SharedExclusive => {
                frame.latch.downgrade_sx()?;
            }
        }
        Ok(Some(PageGuard {
            pool: self,
            frame_idx,
            page,
            mode,
        }))
    }

    fn load_into_frame(&self, frame: &Frame, old_page: PageId, page: PageId) -> Result<()> {
        if frame.take_dirty() && old_page != INVALID_PAGE_ID {
            // SAFETY: X latch held.
            let buf = unsafe { frame.buffer() };
            if let Err(e) = self.store.write_page(old_page, buf.data()) {
                frame.set_dirty(true);
                return Err(e);
            }
            self.counters.writebacks.fetch_add(1, Ordering::Relaxed);
        }
        // SAFETY: X latch held.
        let buf = unsafe { frame.buffer_mut() };
        self.store.read_page(page, buf.data_mut())
    }

    /// Undo a failed cold load: drop the published mapping, release the
    /// claim pin, and put the frame back on probation.
    ///
    /// Runs while the caller still holds the frame's X latch, and
    /// deliberately without the pool latch: the TLB, index, and rings are
    /// lock-free, and taking the pool latch here could deadlock against a
    /// flusher waiting on this frame. Racers blocked on the frame latch
    /// revalidate the TLB afterwards and see the invalidated slot.
    fn rollback_cold_load(&self, frame_idx: u32, page: PageId) {
        let frame = &self.frames[frame_idx as usize];
        self.tlb[frame_idx as usize].store(INVALID_PAGE_ID, Ordering::Release);
        self.index.unset(page);
        frame.set_visited(false);
        self.queues.requeue_probation(&self.frames, frame_idx);
        frame.unpin();
    }

    /// Write a cached page through to the store and clear its dirty flag.
    /// A page that is not resident is a no-op.
    pub fn flush(&self, page: PageId) -> Result<()> {
        self.latch.lock_shared();
        let frame_idx = match self.index.get(page) {
            Some(idx) => idx,
            None => {
                self.latch.unlock_shared();
                return Ok(());
            }
        };
        let frame = &self.frames[frame_idx as usize];
        frame.pin();
        self.latch.unlock_shared();

        frame.latch.lock_shared();
        let mut result = Ok(());
        if self.tlb[frame_idx as usize].load(Ordering::Acquire) == page && frame.is_dirty() {
            // SAFETY: S latch held; writers are excluded.
            let buf = unsafe { frame.buffer() };
            match self.store.write_page(page, buf.data()) {
                Ok(()) => frame.set_dirty(false),
                Err(e) => result = Err(e),
            }
        }
        frame.latch.unlock_shared();
        frame.unpin();
        result
    }

    /// Flush every cached dirty page.
    pub fn flush_all(&self) -> Result<()> {
        self.latch.lock_sx();
        let mut result = Ok(());
        for frame_idx in 0..self.frames.len() {
            let page = self.tlb[frame_idx].load(Ordering::Acquire);
            if page == INVALID_PAGE_ID {
                continue;
            }
            let frame = &self.frames[frame_idx];
            frame.latch.lock_shared();
            if frame.is_dirty() {
                // SAFETY: S latch held.
                let buf = unsafe { frame.buffer() };
                match self.store.write_page(page, buf.data()) {
                    Ok(()) => frame.set_dirty(false),
                    Err(e) => {
                        frame.latch.unlock_shared();
                        result = Err(e);
                        break;
                    }
                }
            }
            frame.latch.unlock_shared();
        }
        self.latch.unlock_sx();
        result
    }

    /// Flush everything and sync the store.
    pub fn destroy(&self) -> Result<()> {
        self.flush_all()?;
        self.store.sync()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            writebacks: self.counters.writebacks.load(Ordering::Relaxed),
            ghost_hits: self.counters.ghost_hits.load(Ordering::Relaxed),
        }
    }

    /// The queue a resident page currently sits in, if cached. Introspection
    /// for tests and diagnostics.
    pub fn resident_queue(&self, page: PageId) -> Option<QueueKind> {
        self.latch.lock_shared();
        let result = self
            .index
            .get(page)
            .map(|idx| self.frames[idx as usize].queue());
        self.latch.unlock_shared();
        result
    }
}

// ============================================================================
// Page Guard - RAII pin + latch
// ============================================================================

/// A pinned, latched page handle. Dropping it releases the latch and the
/// pin; the frame stays cached.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    frame_idx: u32,
    page: PageId,
    mode: LatchMode,
}

impl<'a> PageGuard<'a> {
    #[inline]
    pub fn page(&self) -> PageId {
        self.page
    }

    #[inline]
    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    #[inline]
    fn frame(&self) -> &Frame {
        &self.pool.frames[self.frame_idx as usize]
    }

    /// Shared view of the page bytes.
    #[inline]
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        // SAFETY: the guard holds the frame latch.
        unsafe { self.frame().buffer().data() }
    }

    /// Mutable view of the page bytes. Requires an exclusive guard.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        debug_assert_eq!(self.mode, LatchMode::Exclusive, "mutation needs an X latch");
        // SAFETY: the guard holds the frame latch exclusively.
        unsafe { self.frame().buffer_mut().data_mut() }
    }

    /// View the page as 64-bit atomic words. Used for allocation bitmaps,
    /// where individual words are claimed with atomic RMW under a shared
    /// latch.
    #[inline]
    pub fn atomic_words(&self) -> &[std::sync::atomic::AtomicU64] {
        // SAFETY: the buffer is 4096-aligned and lives as long as the guard;
        // AtomicU64 has no invalid bit patterns.
        unsafe {
            let ptr = self.frame().buffer().data().as_ptr() as *const std::sync::atomic::AtomicU64;
            std::slice::from_raw_parts(ptr, PAGE_SIZE / 8)
        }
    }

    /// Declare the page modified so it is written back before eviction.
    #[inline]
    pub fn mark_dirty(&self) {
        self.frame().set_dirty(true);
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        let frame = &self.pool.frames[self.frame_idx as usize];
        frame.latch.unlock(self.mode);
        frame.unpin();
    }
}
