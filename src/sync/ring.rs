//! Bounded multi-producer single-consumer ring of 32-bit slot indices.
//!
//! Carries identifiers only. `put` fails when the ring is full; `pop`
//! returns [`NONE_SLOT`] when the ring is empty. Per-producer order is FIFO.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

/// Sentinel meaning "no entry". Never a valid payload.
pub const NONE_SLOT: u32 = u32::MAX;

pub struct IndexRing {
    slots: Box<[AtomicU32]>,
    /// Consumer position. Only the single consumer advances it.
    head: AtomicU64,
    /// Producer reservation position.
    tail: AtomicU64,
}

impl IndexRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let slots = (0..capacity).map(|_| AtomicU32::new(NONE_SLOT)).collect();
        Self {
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Entries currently reserved (published or in flight).
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (tail - head) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `value`. Returns false when the ring is full.
    pub fn put(&self, value: u32) -> bool {
        debug_assert_ne!(value, NONE_SLOT);
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            if tail - head >= self.slots.len() as u64 {
                return false;
            }
            if self
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let idx = (tail % self.slots.len() as u64) as usize;
                self.slots[idx].store(value, Ordering::Release);
                return true;
            }
            backoff.spin();
        }
    }

    /// Dequeue the oldest entry, or [`NONE_SLOT`] when nothing is available.
    ///
    /// Single consumer only. A slot reserved by a producer but not yet
    /// published reads as empty.
    pub fn pop(&self) -> u32 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return NONE_SLOT;
        }
        let idx = (head % self.slots.len() as u64) as usize;
        let value = self.slots[idx].swap(NONE_SLOT, Ordering::AcqRel);
        if value == NONE_SLOT {
            // Reserved but not yet published; treat as empty.
            return NONE_SLOT;
        }
        // The slot is cleared before the head moves, so a producer can never
        // reuse it while the old value is still in place.
        self.head.store(head + 1, Ordering::Release);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let ring = IndexRing::new(8);
        for i in 0..5 {
            assert!(ring.put(i));
        }
        for i in 0..5 {
            assert_eq!(ring.pop(), i);
        }
        assert_eq!(ring.pop(), NONE_SLOT);
    }

    #[test]
    fn full_rejects() {
        let ring = IndexRing::new(2);
        assert!(ring.put(10));
        assert!(ring.put(11));
        assert!(!ring.put(12));
        assert_eq!(ring.pop(), 10);
        assert!(ring.put(12));
        assert_eq!(ring.pop(), 11);
        assert_eq!(ring.pop(), 12);
    }

    #[test]
    fn wraparound() {
        let ring = IndexRing::new(4);
        for round in 0..100u32 {
            assert!(ring.put(round));
            assert_eq!(ring.pop(), round);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn multi_producer_single_consumer() {
        let ring = Arc::new(IndexRing::new(1024));
        let mut producers = Vec::new();
        for p in 0..4u32 {
            let ring = Arc::clone(&ring);
            producers.push(std::thread::spawn(move || {
                for i in 0..200u32 {
                    let value = p * 1000 + i;
                    while !ring.put(value) {
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let mut seen = Vec::new();
        while seen.len() < 800 {
            let v = ring.pop();
            if v != NONE_SLOT {
                seen.push(v);
            } else {
                std::thread::yield_now();
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        // per-producer FIFO
        for p in 0..4u32 {
            let ours: Vec<u32> = seen
                .iter()
                .copied()
                .filter(|v| v / 1000 == p)
                .collect();
            assert_eq!(ours.len(), 200);
            assert!(ours.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
