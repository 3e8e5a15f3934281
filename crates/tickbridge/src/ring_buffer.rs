//! Bounded circular buffer for recent bars and ticks
//!
//! Fixed capacity, overwrite-oldest. Logical index 0 is always the most
//! recently inserted element, `len() - 1` the oldest one retained.
//! Not internally synchronized; the owner serializes access.

use crate::error::RingError;
use crate::time::Timestamped;

/// Fixed-capacity ring that evicts its oldest element once full
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Next physical write index
    write_cursor: usize,
    /// Elements currently retained (<= capacity)
    count: usize,
    /// Every insert ever performed, evicting or not
    insert_count: u64,
    /// Bumped on every mutation, invalidates outstanding cursors
    generation: u64,
}

/// Detached read position, checked against the ring's generation on each step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    generation: u64,
    next: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots,
            write_cursor: 0,
            count: 0,
            insert_count: 0,
            generation: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// True once at least one element has been evicted
    #[inline]
    pub fn has_overflowed(&self) -> bool {
        self.insert_count > self.capacity() as u64
    }

    #[inline]
    pub fn insert_count(&self) -> u64 {
        self.insert_count
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Physical slot for a logical (newest-relative) index
    #[inline]
    fn physical(&self, rel: usize) -> usize {
        let cap = self.capacity();
        (self.write_cursor + cap - 1 - rel) % cap
    }

    #[inline]
    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    fn out_of_range(&self, index: usize) -> RingError {
        RingError::OutOfRange {
            index,
            len: self.count,
        }
    }

    /// Append as the newest element. Returns the evicted oldest element
    /// when the ring was already full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let cap = self.capacity();
        let evicted = self.slots[self.write_cursor].replace(item);
        self.write_cursor = (self.write_cursor + 1) % cap;
        if self.count < cap {
            self.count += 1;
        }
        self.insert_count += 1;
        self.bump();
        evicted
    }

    /// Element `rel` positions back from the newest (0 = newest)
    pub fn get(&self, rel: usize) -> Result<&T, RingError> {
        if rel >= self.count {
            return Err(self.out_of_range(rel));
        }
        self.slots[self.physical(rel)]
            .as_ref()
            .ok_or_else(|| self.out_of_range(rel))
    }

    pub fn get_mut(&mut self, rel: usize) -> Result<&mut T, RingError> {
        if rel >= self.count {
            return Err(self.out_of_range(rel));
        }
        self.bump();
        let idx = self.physical(rel);
        let len = self.count;
        self.slots[idx]
            .as_mut()
            .ok_or(RingError::OutOfRange { index: rel, len })
    }

    /// Most recently inserted element
    pub fn latest(&self) -> Option<&T> {
        self.get(0).ok()
    }

    pub fn latest_mut(&mut self) -> Option<&mut T> {
        self.get_mut(0).ok()
    }

    /// Oldest retained element
    pub fn oldest(&self) -> Option<&T> {
        self.count.checked_sub(1).and_then(|rel| self.get(rel).ok())
    }

    /// Insert at logical position `index`, pushing older elements further
    /// back. The oldest element falls out when the ring is full.
    ///
    /// O(capacity); `push` is the hot path.
    pub fn insert(&mut self, index: usize, item: T) -> Result<Option<T>, RingError> {
        if index > self.count || index >= self.capacity() {
            return Err(self.out_of_range(index));
        }

        let mut items: Vec<T> = Vec::with_capacity(self.count + 1);
        for rel in 0..self.count {
            let idx = self.physical(rel);
            if let Some(existing) = self.slots[idx].take() {
                items.push(existing);
            }
        }
        items.insert(index, item);
        let evicted = if items.len() > self.capacity() {
            items.pop()
        } else {
            None
        };

        // Re-lay oldest first from slot 0
        self.count = items.len();
        self.write_cursor = self.count % self.capacity();
        for (slot, existing) in items.into_iter().rev().enumerate() {
            self.slots[slot] = Some(existing);
        }

        self.insert_count += 1;
        self.bump();
        Ok(evicted)
    }

    /// Drop every element and start counting insertions from zero.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.write_cursor = 0;
        self.count = 0;
        self.insert_count = 0;
        self.bump();
    }

    /// Newest to oldest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count).filter_map(move |rel| self.slots[self.physical(rel)].as_ref())
    }

    pub fn cursor(&self) -> RingCursor {
        RingCursor {
            generation: self.generation,
            next: 0,
        }
    }

    /// Step a detached cursor newest to oldest. Fails once the ring has been
    /// mutated since the cursor was taken.
    pub fn advance(&self, cursor: &mut RingCursor) -> Result<Option<&T>, RingError> {
        if cursor.generation != self.generation {
            return Err(RingError::ConcurrentModification);
        }
        if cursor.next >= self.count {
            return Ok(None);
        }
        let item = self.get(cursor.next)?;
        cursor.next += 1;
        Ok(Some(item))
    }

    fn check_window(&self, n: usize, start: usize) -> Result<(), RingError> {
        if n == 0 {
            return Err(self.out_of_range(start));
        }
        match start.checked_add(n) {
            Some(end) if end <= self.count => Ok(()),
            _ => Err(self.out_of_range(start.saturating_add(n - 1))),
        }
    }

    /// Scan `n` elements from `start` back. Only a strict improvement
    /// replaces the current pick, so ties resolve to the newest element.
    fn extreme(
        &self,
        n: usize,
        start: usize,
        better: impl Fn(&T, &T) -> bool,
    ) -> Result<(usize, &T), RingError> {
        self.check_window(n, start)?;
        let mut best_rel = start;
        let mut best = self.get(start)?;
        for rel in start + 1..start + n {
            let candidate = self.get(rel)?;
            if better(candidate, best) {
                best_rel = rel;
                best = candidate;
            }
        }
        Ok((best_rel, best))
    }

    /// Highest of the `n` elements starting `start` back, with its index
    pub fn highest_by<K: PartialOrd>(
        &self,
        n: usize,
        start: usize,
        key: impl Fn(&T) -> K,
    ) -> Result<(usize, &T), RingError> {
        self.extreme(n, start, |candidate, best| key(candidate) > key(best))
    }

    /// Lowest of the `n` elements starting `start` back, with its index
    pub fn lowest_by<K: PartialOrd>(
        &self,
        n: usize,
        start: usize,
        key: impl Fn(&T) -> K,
    ) -> Result<(usize, &T), RingError> {
        self.extreme(n, start, |candidate, best| key(candidate) < key(best))
    }
}

impl<T: PartialOrd> RingBuffer<T> {
    pub fn highest(&self, n: usize, start: usize) -> Result<(usize, &T), RingError> {
        self.extreme(n, start, |candidate, best| candidate > best)
    }

    pub fn lowest(&self, n: usize, start: usize) -> Result<(usize, &T), RingError> {
        self.extreme(n, start, |candidate, best| candidate < best)
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Snapshot, newest first
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T: Timestamped> RingBuffer<T> {
    /// Logical index of the newest element stamped at or before `time`
    pub fn index_at_or_before(&self, time: i64) -> Option<usize> {
        self.iter().position(|item| item.timestamp() <= time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, items: impl IntoIterator<Item = i32>) -> RingBuffer<i32> {
        let mut ring = RingBuffer::new(capacity).unwrap();
        for item in items {
            ring.push(item);
        }
        ring
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(RingBuffer::<i32>::new(0).unwrap_err(), RingError::ZeroCapacity);
    }

    #[test]
    fn test_push_within_capacity_never_evicts() {
        for n in 1..=5 {
            let mut ring = RingBuffer::new(5).unwrap();
            for i in 0..n {
                assert_eq!(ring.push(i), None);
                assert_eq!(ring.get(0), Ok(&i));
            }
            assert!(!ring.has_overflowed());
            assert_eq!(ring.len(), n as usize);
            assert_eq!(ring.is_full(), n == 5);
        }
    }

    #[test]
    fn test_push_beyond_capacity_evicts_oldest() {
        let capacity = 4;
        for n in 5..12 {
            let mut ring = RingBuffer::new(capacity).unwrap();
            let mut evicted = Vec::new();
            for i in 0..n {
                if let Some(old) = ring.push(i) {
                    evicted.push(old);
                }
            }
            assert!(ring.has_overflowed());
            assert_eq!(ring.len(), capacity);
            assert_eq!(ring.get(capacity - 1), Ok(&(n - capacity as i32)));
            assert_eq!(ring.latest(), Some(&(n - 1)));
            assert_eq!(evicted, (0..n - capacity as i32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_exactly_full_is_not_overflowed() {
        let ring = filled(3, [1, 2, 3]);
        assert!(ring.is_full());
        assert!(!ring.has_overflowed());
        assert_eq!(ring.oldest(), Some(&1));
    }

    #[test]
    fn test_get_out_of_range() {
        let ring = filled(4, [10, 20]);
        assert_eq!(ring.get(1), Ok(&10));
        assert_eq!(ring.get(2), Err(RingError::OutOfRange { index: 2, len: 2 }));
        assert_eq!(ring.get(4), Err(RingError::OutOfRange { index: 4, len: 2 }));
        assert!(RingBuffer::<i32>::new(1).unwrap().latest().is_none());
    }

    #[test]
    fn test_highest_and_lowest_report_relative_index() {
        // newest first: 5, 9, 1, 7, 3
        let ring = filled(8, [3, 7, 1, 9, 5]);
        assert_eq!(ring.highest(5, 0), Ok((1, &9)));
        assert_eq!(ring.lowest(5, 0), Ok((2, &1)));
        assert_eq!(ring.highest(2, 2), Ok((3, &7)));
        assert_eq!(ring.lowest(1, 4), Ok((4, &3)));
    }

    #[test]
    fn test_extreme_ties_keep_first_scanned() {
        // newest first: 4, 8, 8, 2, 2
        let ring = filled(5, [2, 2, 8, 8, 4]);
        assert_eq!(ring.highest(5, 0), Ok((1, &8)));
        assert_eq!(ring.lowest(5, 0), Ok((3, &2)));
    }

    #[test]
    fn test_extreme_window_bounds() {
        let ring = filled(5, [1, 2, 3]);
        assert!(ring.highest(0, 0).is_err());
        assert!(ring.highest(3, 1).is_err());
        assert!(ring.lowest(1, 3).is_err());
        assert!(ring.highest(3, 0).is_ok());
    }

    #[test]
    fn test_highest_by_key() {
        let mut ring = RingBuffer::new(4).unwrap();
        ring.push(("a", 1.5));
        ring.push(("b", 0.5));
        ring.push(("c", 2.5));
        let (idx, item) = ring.highest_by(3, 0, |p| p.1).unwrap();
        assert_eq!((idx, item.0), (0, "c"));
        let (idx, item) = ring.lowest_by(3, 0, |p| p.1).unwrap();
        assert_eq!((idx, item.0), (1, "b"));
    }

    #[test]
    fn test_insert_shifts_older_elements() {
        // newest first: 3, 2, 1
        let mut ring = filled(5, [1, 2, 3]);
        assert_eq!(ring.insert(1, 99), Ok(None));
        assert_eq!(ring.to_vec(), vec![3, 99, 2, 1]);
        assert_eq!(ring.insert_count(), 4);

        // append as oldest
        assert_eq!(ring.insert(4, 0), Ok(None));
        assert_eq!(ring.to_vec(), vec![3, 99, 2, 1, 0]);
    }

    #[test]
    fn test_insert_when_full_drops_oldest() {
        let mut ring = filled(3, [1, 2, 3]);
        assert_eq!(ring.insert(0, 4), Ok(Some(1)));
        assert_eq!(ring.to_vec(), vec![4, 3, 2]);
        assert!(ring.has_overflowed());

        // ring stays consistent for subsequent pushes
        assert_eq!(ring.push(5), Some(2));
        assert_eq!(ring.to_vec(), vec![5, 4, 3]);
    }

    #[test]
    fn test_insert_out_of_range() {
        let mut ring = filled(3, [1]);
        assert!(ring.insert(2, 7).is_err());
        let mut full = filled(2, [1, 2]);
        assert!(full.insert(2, 7).is_err());
    }

    #[test]
    fn test_cursor_detects_modification() {
        let mut ring = filled(4, [1, 2, 3]);
        let mut cursor = ring.cursor();
        assert_eq!(ring.advance(&mut cursor), Ok(Some(&3)));
        assert_eq!(ring.advance(&mut cursor), Ok(Some(&2)));

        ring.push(4);
        assert_eq!(ring.advance(&mut cursor), Err(RingError::ConcurrentModification));

        let mut fresh = ring.cursor();
        let mut seen = Vec::new();
        while let Some(item) = ring.advance(&mut fresh).unwrap() {
            seen.push(*item);
        }
        assert_eq!(seen, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_mutating_latest_bumps_generation() {
        let mut ring = filled(2, [1]);
        let before = ring.generation();
        if let Some(latest) = ring.latest_mut() {
            *latest = 10;
        }
        assert_ne!(ring.generation(), before);
        assert_eq!(ring.latest(), Some(&10));
    }

    #[test]
    fn test_clear_resets_overflow() {
        let mut ring = filled(2, [1, 2, 3]);
        assert!(ring.has_overflowed());
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.insert_count(), 0);
        assert!(!ring.has_overflowed());
        assert_eq!(ring.push(9), None);
        assert_eq!(ring.latest(), Some(&9));
    }

    #[test]
    fn test_refill_after_clear_without_eviction() {
        let mut ring = filled(3, [1, 2]);
        ring.clear();
        ring.push(3);
        ring.push(4);
        assert_eq!(ring.len(), 2);
        assert!(!ring.has_overflowed());
    }

    struct Stamped(i64);

    impl Timestamped for Stamped {
        fn timestamp(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn test_index_at_or_before() {
        let mut ring = RingBuffer::new(4).unwrap();
        for t in [10, 20, 30] {
            ring.push(Stamped(t));
        }
        assert_eq!(ring.index_at_or_before(35), Some(0));
        assert_eq!(ring.index_at_or_before(25), Some(1));
        assert_eq!(ring.index_at_or_before(10), Some(2));
        assert_eq!(ring.index_at_or_before(5), None);
    }
}
