//! QDLP eviction state: quick demotion through the probation queue, lazy
//! promotion into the protected queue, and a ghost list that fast-tracks
//! recently evicted pages back into the protected queue.
//!
//! All methods here run under the pool's SX latch, so there is exactly one
//! evictor at a time; the rings and maps are still lock-free because hot
//! paths read them concurrently.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::{PageId, INVALID_PAGE_ID};
use crate::sync::{AtomicU32Map, IndexRing, NONE_SLOT};

use super::frame::{Frame, QueueKind};

pub(crate) struct VictimInfo {
    pub frame_idx: u32,
    /// The victim was taken out of the probation queue; its old page becomes
    /// a ghost.
    pub from_qd: bool,
}

pub(crate) struct QdlpQueues {
    qd: IndexRing,
    main: IndexRing,
    ghost_ring: IndexRing,
    ghost_members: AtomicU32Map,
    /// Warm-up scan position; frames below it have held a page at least once.
    cold_cursor: AtomicU32,
}

impl QdlpQueues {
    pub fn new(pool_size: usize) -> Self {
        Self {
            qd: IndexRing::new((pool_size / 8).max(1)),
            main: IndexRing::new(pool_size),
            ghost_ring: IndexRing::new(pool_size),
            ghost_members: AtomicU32Map::with_capacity(pool_size),
            cold_cursor: AtomicU32::new(0),
        }
    }

    /// Select and claim a victim frame, or None when every frame is pinned.
    pub fn pick_victim(&self, frames: &[Frame], tlb: &[AtomicU32]) -> Option<VictimInfo> {
        // Warm-up: hand out frames that never held a page.
        loop {
            let cursor = self.cold_cursor.load(Ordering::Acquire);
            if cursor as usize >= frames.len() {
                break;
            }
            self.cold_cursor.store(cursor + 1, Ordering::Release);
            let idx = cursor as usize;
            if tlb[idx].load(Ordering::Acquire) == INVALID_PAGE_ID
                && frames[idx].queue() == QueueKind::None
                && frames[idx].try_claim()
            {
                return Some(VictimInfo {
                    frame_idx: cursor,
                    from_qd: false,
                });
            }
        }

        // Probation scan: promote survivors, skip pinned frames, take the
        // first quiet one.
        let qd_len = self.qd.len();
        for _ in 0..qd_len {
            let idx = self.qd.pop();
            if idx == NONE_SLOT {
                break;
            }
            let frame = &frames[idx as usize];
            if frame.take_visited() {
                frame.set_queue(QueueKind::Main);
                self.main.put(idx);
                continue;
            }
            if frame.try_claim() {
                frame.set_queue(QueueKind::None);
                return Some(VictimInfo {
                    frame_idx: idx,
                    from_qd: true,
                });
            }
            self.requeue_probation(frames, idx);
        }

        // Protected scan: classic second chance.
        let main_len = self.main.len();
        for _ in 0..main_len {
            let idx = self.main.pop();
            if idx == NONE_SLOT {
                break;
            }
            let frame = &frames[idx as usize];
            if frame.take_visited() {
                self.main.put(idx);
                continue;
            }
            if frame.try_claim() {
                frame.set_queue(QueueKind::None);
                return Some(VictimInfo {
                    frame_idx: idx,
                    from_qd: false,
                });
            }
            self.main.put(idx);
        }

        None
    }

    /// Enqueue a freshly loaded frame. Ghost hits go straight to the
    /// protected queue.
    pub fn enqueue_loaded(&self, frames: &[Frame], frame_idx: u32, ghost_hit: bool) {
        if ghost_hit {
            frames[frame_idx as usize].set_queue(QueueKind::Main);
            self.main.put(frame_idx);
        } else {
            self.requeue_probation(frames, frame_idx);
        }
    }

    /// Put a frame (back) on probation; falls over to the protected queue
    /// when probation is full so the frame never drops out of the scan.
    pub fn requeue_probation(&self, frames: &[Frame], frame_idx: u32) {
        if self.qd.put(frame_idx) {
            frames[frame_idx as usize].set_queue(QueueKind::Qd);
        } else {
            frames[frame_idx as usize].set_queue(QueueKind::Main);
            self.main.put(frame_idx);
        }
    }

    /// Remember an evicted probation page. The oldest ghost gives way when
    /// the list is full.
    pub fn record_ghost(&self, page: PageId) {
        if self.ghost_members.contains(page) {
            return;
        }
        while !self.ghost_ring.put(page) {
            let oldest = self.ghost_ring.pop();
            if oldest == NONE_SLOT {
                return;
            }
            self.ghost_members.unset(oldest);
        }
        self.ghost_members.set(page, 1);
    }

    #[inline]
    pub fn ghost_contains(&self, page: PageId) -> bool {
        self.ghost_members.contains(page)
    }

    /// Forget a ghost once its page has been re-admitted.
    #[inline]
    pub fn ghost_remove(&self, page: PageId) {
        self.ghost_members.unset(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(n: usize) -> (QdlpQueues, Vec<Frame>, Vec<AtomicU32>) {
        let queues = QdlpQueues::new(n);
        let frames: Vec<Frame> = (0..n).map(|_| Frame::new()).collect();
        let tlb: Vec<AtomicU32> = (0..n).map(|_| AtomicU32::new(INVALID_PAGE_ID)).collect();
        (queues, frames, tlb)
    }

    #[test]
    fn warm_up_hands_out_every_frame_once() {
        let (queues, frames, tlb) = make(4);
        for expect in 0..4u32 {
            let victim = queues.pick_victim(&frames, &tlb).unwrap();
            assert_eq!(victim.frame_idx, expect);
            assert!(!victim.from_qd);
            tlb[expect as usize].store(expect + 100, Ordering::Release);
            frames[expect as usize].unpin();
            queues.enqueue_loaded(&frames, expect, false);
        }
        // All frames now on probation; next victim comes from QD.
        let victim = queues.pick_victim(&frames, &tlb).unwrap();
        assert!(victim.from_qd);
    }

    #[test]
    fn visited_frames_get_promoted() {
        let (queues, frames, tlb) = make(8);
        // Warm two frames.
        for i in 0..2u32 {
            let v = queues.pick_victim(&frames, &tlb).unwrap();
            tlb[v.frame_idx as usize].store(i + 1, Ordering::Release);
            frames[v.frame_idx as usize].unpin();
            queues.enqueue_loaded(&frames, v.frame_idx, false);
        }
        // Exhaust warm-up so scans reach the queues.
        for _ in 2..8 {
            let v = queues.pick_victim(&frames, &tlb).unwrap();
            tlb[v.frame_idx as usize].store(999, Ordering::Release);
            frames[v.frame_idx as usize].unpin();
            queues.enqueue_loaded(&frames, v.frame_idx, false);
        }

        frames[0].set_visited(true);
        let victim = queues.pick_victim(&frames, &tlb).unwrap();
        // Frame 0 was visited, so it moved to MAIN and frame 1 got evicted.
        assert_eq!(victim.frame_idx, 1);
        assert_eq!(frames[0].queue(), QueueKind::Main);
        frames[1].unpin();
        queues.requeue_probation(&frames, 1);
    }

    #[test]
    fn pinned_frames_are_skipped() {
        let (queues, frames, tlb) = make(2);
        for i in 0..2u32 {
            let v = queues.pick_victim(&frames, &tlb).unwrap();
            tlb[v.frame_idx as usize].store(i + 1, Ordering::Release);
            queues.enqueue_loaded(&frames, v.frame_idx, false);
            // keep the claim pin: both frames stay pinned
        }
        assert!(queues.pick_victim(&frames, &tlb).is_none());

        frames[0].unpin();
        let victim = queues.pick_victim(&frames, &tlb).unwrap();
        assert_eq!(victim.frame_idx, 0);
    }

    #[test]
    fn ghost_list_evicts_oldest() {
        let queues = QdlpQueues::new(2); // ghost capacity 2
        queues.record_ghost(10);
        queues.record_ghost(11);
        assert!(queues.ghost_contains(10));
        queues.record_ghost(12);
        assert!(!queues.ghost_contains(10));
        assert!(queues.ghost_contains(11));
        assert!(queues.ghost_contains(12));

        queues.ghost_remove(11);
        assert!(!queues.ghost_contains(11));
    }
}
