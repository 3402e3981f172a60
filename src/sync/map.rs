//! Open-addressed lock-free hash table mapping `u32` keys to `u32` values.
//!
//! Linear probing over a power-of-two table. Each entry packs key and value
//! into one `AtomicU64` so a mapping becomes visible atomically. Keys
//! `u32::MAX` and `u32::MAX - 1` are reserved as the empty and tombstone
//! sentinels. Capacity is fixed at construction and sized so the table stays
//! below a ~0.75 load factor for its intended population.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

const EMPTY_KEY: u32 = u32::MAX;
const DELETED_KEY: u32 = u32::MAX - 1;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[inline]
fn fnv1a(key: u32) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in key.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[inline]
fn pack(key: u32, val: u32) -> u64 {
    (key as u64) << 32 | val as u64
}

#[inline]
fn entry_key(entry: u64) -> u32 {
    (entry >> 32) as u32
}

#[inline]
fn entry_val(entry: u64) -> u32 {
    entry as u32
}

pub struct AtomicU32Map {
    entries: Box<[AtomicU64]>,
    mask: usize,
}

impl AtomicU32Map {
    /// Create a map able to hold `expected` live entries comfortably.
    pub fn with_capacity(expected: usize) -> Self {
        let capacity = (expected.max(8) * 2).next_power_of_two();
        let entries = (0..capacity)
            .map(|_| AtomicU64::new(pack(EMPTY_KEY, 0)))
            .collect();
        Self {
            entries,
            mask: capacity - 1,
        }
    }

    pub fn get(&self, key: u32) -> Option<u32> {
        debug_assert!(key < DELETED_KEY);
        let mut idx = fnv1a(key) as usize & self.mask;
        for _ in 0..=self.mask {
            let entry = self.entries[idx].load(Ordering::Acquire);
            let k = entry_key(entry);
            if k == key {
                return Some(entry_val(entry));
            }
            if k == EMPTY_KEY {
                return None;
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Insert or update a mapping.
    pub fn set(&self, key: u32, val: u32) {
        debug_assert!(key < DELETED_KEY);
        let backoff = Backoff::new();
        'retry: loop {
            let mut idx = fnv1a(key) as usize & self.mask;
            let mut reusable: Option<usize> = None;
            for _ in 0..=self.mask {
                let entry = self.entries[idx].load(Ordering::Acquire);
                let k = entry_key(entry);
                if k == key {
                    if self.entries[idx]
                        .compare_exchange(entry, pack(key, val), Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                    backoff.spin();
                    continue 'retry;
                }
                if k == DELETED_KEY && reusable.is_none() {
                    reusable = Some(idx);
                }
                if k == EMPTY_KEY {
                    let claim = reusable.unwrap_or(idx);
                    let observed = self.entries[claim].load(Ordering::Acquire);
                    let ok = entry_key(observed) == EMPTY_KEY || entry_key(observed) == DELETED_KEY;
                    if ok
                        && self.entries[claim]
                            .compare_exchange(
                                observed,
                                pack(key, val),
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                    {
                        return;
                    }
                    backoff.spin();
                    continue 'retry;
                }
                idx = (idx + 1) & self.mask;
            }
            panic!("AtomicU32Map over capacity");
        }
    }

    /// Remove a mapping. No-op when the key is absent.
    pub fn unset(&self, key: u32) {
        debug_assert!(key < DELETED_KEY);
        let backoff = Backoff::new();
        'retry: loop {
            let mut idx = fnv1a(key) as usize & self.mask;
            for _ in 0..=self.mask {
                let entry = self.entries[idx].load(Ordering::Acquire);
                let k = entry_key(entry);
                if k == key {
                    if self.entries[idx]
                        .compare_exchange(
                            entry,
                            pack(DELETED_KEY, 0),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return;
                    }
                    backoff.spin();
                    continue 'retry;
                }
                if k == EMPTY_KEY {
                    return;
                }
                idx = (idx + 1) & self.mask;
            }
            return;
        }
    }

    pub fn contains(&self, key: u32) -> bool {
        self.get(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_get_unset() {
        let map = AtomicU32Map::with_capacity(16);
        assert_eq!(map.get(1), None);

        map.set(1, 100);
        map.set(2, 200);
        assert_eq!(map.get(1), Some(100));
        assert_eq!(map.get(2), Some(200));

        map.set(1, 101);
        assert_eq!(map.get(1), Some(101));

        map.unset(1);
        assert_eq!(map.get(1), None);
        assert_eq!(map.get(2), Some(200));
        map.unset(1); // absent key is a no-op
    }

    #[test]
    fn tombstones_are_reused() {
        let map = AtomicU32Map::with_capacity(8);
        for round in 0..1000u32 {
            map.set(round % 8, round);
            map.unset(round % 8);
        }
        for key in 0..8 {
            assert_eq!(map.get(key), None);
        }
        map.set(3, 33);
        assert_eq!(map.get(3), Some(33));
    }

    #[test]
    fn dense_population() {
        let map = AtomicU32Map::with_capacity(256);
        for key in 0..256u32 {
            map.set(key, key * 7);
        }
        for key in 0..256u32 {
            assert_eq!(map.get(key), Some(key * 7));
        }
    }

    #[test]
    fn concurrent_disjoint_keys() {
        let map = Arc::new(AtomicU32Map::with_capacity(4096));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                for i in 0..256u32 {
                    let key = t * 256 + i;
                    map.set(key, key + 1);
                    assert_eq!(map.get(key), Some(key + 1));
                    if i % 2 == 0 {
                        map.unset(key);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8u32 {
            for i in 0..256u32 {
                let key = t * 256 + i;
                if i % 2 == 0 {
                    assert_eq!(map.get(key), None);
                } else {
                    assert_eq!(map.get(key), Some(key + 1));
                }
            }
        }
    }
}
