//! Bounded monotonic-sequence logs with last-seen-cursor delta reads.
//!
//! The delta contract: `since(cursor)` returns every retained entry with a
//! sequence greater than the cursor, in ascending order, plus the cursor to
//! store for the next call. Eviction may drop entries a slow consumer never
//! saw; delivery is at-most-once per cursor. Sequence numbers are never
//! reused, `clear` included.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// An entry paired with its assigned sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequenced<T> {
    pub seq: u64,
    pub value: T,
}

#[derive(Debug)]
struct Ring<T> {
    entries: VecDeque<Sequenced<T>>,
    capacity: usize,
    next_seq: u64,
    /// Aggregate size of retained entries, tracked when a measure is set.
    retained_bytes: u64,
    byte_budget: Option<u64>,
}

/// Thread-safe append-only ring. `T: Clone` because delta reads hand copies
/// to consumers while producers keep appending.
#[derive(Debug)]
pub struct RingStore<T> {
    inner: Mutex<Ring<T>>,
    measure: Option<fn(&T) -> usize>,
}

impl<T: Clone> RingStore<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            inner: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                next_seq: 0,
                retained_bytes: 0,
                byte_budget: None,
            }),
            measure: None,
        }
    }

    /// A ring that additionally evicts oldest-first to keep the measured
    /// size of retained entries under `budget` bytes, enforced on every
    /// append.
    pub fn with_byte_budget(
        capacity: usize,
        budget: u64,
        measure: fn(&T) -> usize,
    ) -> Self {
        let mut store = Self::new(capacity);
        store.measure = Some(measure);
        store.inner.get_mut().byte_budget = Some(budget);
        store
    }

    /// Assign the next sequence and append, evicting the oldest entries if
    /// the ring is at capacity or over its byte budget.
    pub fn append(&self, value: T) -> u64 {
        let size = self.measure.map(|m| m(&value) as u64).unwrap_or(0);
        let mut ring = self.inner.lock();
        ring.next_seq += 1;
        let seq = ring.next_seq;

        if ring.entries.len() == ring.capacity {
            if let Some(evicted) = ring.entries.pop_front() {
                let evicted_size = self
                    .measure
                    .map(|m| m(&evicted.value) as u64)
                    .unwrap_or(0);
                ring.retained_bytes =
                    ring.retained_bytes.saturating_sub(evicted_size);
            }
        }
        ring.entries.push_back(Sequenced { seq, value });
        ring.retained_bytes += size;

        if let Some(budget) = ring.byte_budget {
            while ring.retained_bytes > budget && !ring.entries.is_empty() {
                if let Some(evicted) = ring.entries.pop_front() {
                    let evicted_size = self
                        .measure
                        .map(|m| m(&evicted.value) as u64)
                        .unwrap_or(0);
                    ring.retained_bytes =
                        ring.retained_bytes.saturating_sub(evicted_size);
                }
            }
        }
        seq
    }

    /// All retained entries with sequence > `cursor`, plus the new cursor.
    pub fn since(&self, cursor: u64) -> (Vec<Sequenced<T>>, u64) {
        let ring = self.inner.lock();
        let items: Vec<Sequenced<T>> = ring
            .entries
            .iter()
            .filter(|entry| entry.seq > cursor)
            .cloned()
            .collect();
        let new_cursor = items.last().map(|e| e.seq).unwrap_or(cursor);
        (items, new_cursor)
    }

    /// Mutate a retained entry in place. Returns false when the entry has
    /// already been evicted. Used for dedup counters on stored alerts.
    pub fn mutate(&self, seq: u64, f: impl FnOnce(&mut T)) -> bool {
        let mut ring = self.inner.lock();
        let Some(front_seq) = ring.entries.front().map(|e| e.seq) else {
            return false;
        };
        if seq < front_seq {
            return false;
        }
        let index = (seq - front_seq) as usize;
        match ring.entries.get_mut(index) {
            Some(entry) => {
                debug_assert_eq!(entry.seq, seq);
                f(&mut entry.value);
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Total sequence numbers ever assigned.
    pub fn appended(&self) -> u64 {
        self.inner.lock().next_seq
    }

    pub fn retained_bytes(&self) -> u64 {
        self.inner.lock().retained_bytes
    }

    pub fn set_byte_budget(&self, budget: u64) {
        let mut ring = self.inner.lock();
        ring.byte_budget = Some(budget);
        while ring.retained_bytes > budget && !ring.entries.is_empty() {
            if let Some(evicted) = ring.entries.pop_front() {
                let evicted_size = self
                    .measure
                    .map(|m| m(&evicted.value) as u64)
                    .unwrap_or(0);
                ring.retained_bytes =
                    ring.retained_bytes.saturating_sub(evicted_size);
            }
        }
    }

    /// Drop all retained entries. Sequence numbers keep counting from where
    /// they were.
    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.entries.clear();
        ring.retained_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn since_zero_returns_everything_under_capacity() {
        let ring = RingStore::new(100);
        for i in 0..50u64 {
            ring.append(i);
        }
        let (items, cursor) = ring.since(0);
        assert_eq!(items.len(), 50);
        assert_eq!(cursor, 50);
        assert!(items.windows(2).all(|w| w[0].seq + 1 == w[1].seq));
    }

    #[test]
    fn eviction_keeps_last_capacity_entries() {
        let ring = RingStore::new(100);
        for i in 0..150u64 {
            ring.append(i);
        }
        let (items, cursor) = ring.since(0);
        assert_eq!(items.len(), 100);
        assert_eq!(items.first().unwrap().seq, 51);
        assert_eq!(items.last().unwrap().seq, 150);
        assert_eq!(cursor, 150);

        // Caught-up consumer sees nothing until new appends arrive.
        let (items, cursor) = ring.since(150);
        assert!(items.is_empty());
        assert_eq!(cursor, 150);

        for i in 0..10u64 {
            ring.append(i);
        }
        let (items, cursor) = ring.since(150);
        assert_eq!(items.len(), 10);
        assert_eq!(items.first().unwrap().seq, 151);
        assert_eq!(cursor, 160);
    }

    #[test]
    fn clear_does_not_reuse_sequences() {
        let ring = RingStore::new(10);
        ring.append("a");
        ring.append("b");
        ring.clear();
        assert_eq!(ring.count(), 0);
        let seq = ring.append("c");
        assert_eq!(seq, 3);
    }

    #[test]
    fn mutate_reaches_retained_entry() {
        let ring = RingStore::new(3);
        let seq = ring.append(1u32);
        assert!(ring.mutate(seq, |v| *v += 10));
        let (items, _) = ring.since(0);
        assert_eq!(items[0].value, 11);

        // Push the entry out and the mutation target is gone.
        for _ in 0..3 {
            ring.append(0);
        }
        assert!(!ring.mutate(seq, |v| *v += 10));
    }

    #[test]
    fn byte_budget_evicts_oldest_first() {
        let ring: RingStore<Vec<u8>> =
            RingStore::with_byte_budget(100, 10, |v| v.len());
        ring.append(vec![0u8; 4]);
        ring.append(vec![0u8; 4]);
        ring.append(vec![0u8; 4]);
        // 12 bytes retained exceeds the 10-byte budget; the first entry goes.
        assert_eq!(ring.count(), 2);
        assert_eq!(ring.retained_bytes(), 8);
        let (items, _) = ring.since(0);
        assert_eq!(items.first().unwrap().seq, 2);
    }

    #[test]
    fn budget_shrink_applies_immediately() {
        let ring: RingStore<Vec<u8>> =
            RingStore::with_byte_budget(100, 100, |v| v.len());
        for _ in 0..10 {
            ring.append(vec![0u8; 10]);
        }
        assert_eq!(ring.count(), 10);
        ring.set_byte_budget(25);
        assert!(ring.retained_bytes() <= 25);
        assert_eq!(ring.count(), 2);
    }

    #[test]
    fn concurrent_appends_keep_sequences_strictly_ascending() {
        let ring = Arc::new(RingStore::new(1000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    ring.append(i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let (items, _) = ring.since(0);
        assert_eq!(items.len(), 800);
        assert!(items.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(ring.appended(), 800);
    }
}
