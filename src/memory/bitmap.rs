//! Region bitmap for chunk and slot tracking.

/// Bits per bitmap word.
const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-capacity bitmap tracking which units of a region are free.
///
/// Each bit represents one unit (a segment chunk or a doorbell slot):
/// 1 = free, 0 = allocated. Bits past `capacity` in the last word are
/// always 0 so they can never be handed out.
///
/// The bitmap is not synchronized. Its owner (a huge segment or a doorbell
/// page) keeps it behind the same lock as the structure it belongs to, so
/// no search ever observes a half-updated region.
///
/// # Performance
///
/// - `find_free_region`: O(n/64) words per candidate start, skipping
///   fully-allocated words
/// - `take_first_free`: O(n/64)
/// - `release`: O(1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionBitmap {
    /// 64-bit words, lowest unit in the lowest bit of word 0.
    words: Box<[u64]>,
    /// Number of units tracked (may be less than words.len() * 64).
    capacity: usize,
}

impl RegionBitmap {
    /// Create a bitmap with every unit free.
    pub fn new(capacity: usize) -> Self {
        let num_words = capacity.div_ceil(WORD_BITS);
        let mut words = vec![u64::MAX; num_words].into_boxed_slice();

        let tail = capacity % WORD_BITS;
        if tail != 0 {
            words[num_words - 1] = (1u64 << tail) - 1;
        }

        Self { words, capacity }
    }

    /// Number of units tracked.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Find the first run of `n` free units.
    ///
    /// Returns the offset of the run, or `capacity()` if no run of that
    /// length exists. `n == 0` and `n > capacity()` also return the sentinel.
    pub fn find_free_region(&self, n: usize) -> usize {
        if n == 0 || n > self.capacity {
            return self.capacity;
        }

        let mut start = 0;
        while let Some(free) = self.next_free(start) {
            if free + n > self.capacity {
                break;
            }
            match self.next_allocated(free, free + n) {
                None => return free,
                Some(taken) => start = taken + 1,
            }
        }

        self.capacity
    }

    /// Mark units `start..end` as allocated.
    ///
    /// # Panics
    ///
    /// Panics if the range is reversed or extends past `capacity()`.
    pub fn fill_region(&mut self, start: usize, end: usize) {
        self.update_region(start, end, |word, mask| *word &= !mask);
    }

    /// Mark units `start..end` as free.
    ///
    /// # Panics
    ///
    /// Panics if the range is reversed or extends past `capacity()`.
    pub fn zero_region(&mut self, start: usize, end: usize) {
        self.update_region(start, end, |word, mask| *word |= mask);
    }

    /// True when no unit is free.
    pub fn is_full(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    /// True when every unit is free.
    pub fn is_empty(&self) -> bool {
        self.count_free() == self.capacity
    }

    /// Whether unit `idx` is free. Out-of-range units are never free.
    pub fn is_free(&self, idx: usize) -> bool {
        if idx >= self.capacity {
            return false;
        }
        self.words[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS)) != 0
    }

    /// Count the free units.
    pub fn count_free(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Allocate the lowest free unit.
    ///
    /// Scans for the first non-zero word, then its lowest set bit.
    pub fn take_first_free(&mut self) -> Option<usize> {
        let (word_idx, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != 0)?;

        let bit_idx = word.trailing_zeros() as usize;
        *word &= !(1u64 << bit_idx);

        Some(word_idx * WORD_BITS + bit_idx)
    }

    /// Return a single unit to the free set.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn release(&mut self, idx: usize) {
        assert!(idx < self.capacity, "unit index out of bounds");
        self.words[idx / WORD_BITS] |= 1u64 << (idx % WORD_BITS);
    }

    /// First free unit at or after `from`.
    fn next_free(&self, from: usize) -> Option<usize> {
        let mut word_idx = from / WORD_BITS;
        if word_idx >= self.words.len() {
            return None;
        }

        let mut word = self.words[word_idx] & (u64::MAX << (from % WORD_BITS));
        loop {
            if word != 0 {
                let idx = word_idx * WORD_BITS + word.trailing_zeros() as usize;
                return (idx < self.capacity).then_some(idx);
            }
            word_idx += 1;
            if word_idx == self.words.len() {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    /// First allocated unit in `from..end`.
    fn next_allocated(&self, from: usize, end: usize) -> Option<usize> {
        let mut bit = from;
        while bit < end {
            let word_idx = bit / WORD_BITS;
            let taken = !self.words[word_idx] & (u64::MAX << (bit % WORD_BITS));
            if taken != 0 {
                let idx = word_idx * WORD_BITS + taken.trailing_zeros() as usize;
                return (idx < end).then_some(idx);
            }
            bit = (word_idx + 1) * WORD_BITS;
        }
        None
    }

    fn update_region(&mut self, start: usize, end: usize, apply: impl Fn(&mut u64, u64)) {
        assert!(
            start <= end && end <= self.capacity,
            "region {}..{} out of bounds for capacity {}",
            start,
            end,
            self.capacity
        );

        let mut bit = start;
        while bit < end {
            let word_idx = bit / WORD_BITS;
            let lo = bit % WORD_BITS;
            let hi = (end - word_idx * WORD_BITS).min(WORD_BITS);
            let width = hi - lo;
            let mask = if width == WORD_BITS {
                u64::MAX
            } else {
                ((1u64 << width) - 1) << lo
            };
            apply(&mut self.words[word_idx], mask);
            bit = word_idx * WORD_BITS + hi;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bitmap_starts_free() {
        let bitmap = RegionBitmap::new(100);
        assert_eq!(bitmap.capacity(), 100);
        assert_eq!(bitmap.count_free(), 100);
        assert!(bitmap.is_empty());
        assert!(!bitmap.is_full());
        assert!(!bitmap.is_free(100));
    }

    #[test]
    fn test_find_and_fill() {
        let mut bitmap = RegionBitmap::new(64);

        assert_eq!(bitmap.find_free_region(2), 0);
        bitmap.fill_region(0, 2);
        assert_eq!(bitmap.find_free_region(3), 2);
        bitmap.fill_region(2, 5);
        assert_eq!(bitmap.count_free(), 59);

        // Hole of two at 0..2 is too small for three.
        bitmap.zero_region(0, 2);
        assert_eq!(bitmap.find_free_region(3), 5);
        assert_eq!(bitmap.find_free_region(2), 0);
    }

    #[test]
    fn test_region_spanning_words() {
        let mut bitmap = RegionBitmap::new(200);
        bitmap.fill_region(0, 60);

        assert_eq!(bitmap.find_free_region(100), 60);
        bitmap.fill_region(60, 160);
        assert_eq!(bitmap.count_free(), 40);
        assert_eq!(bitmap.find_free_region(41), 200);
        assert_eq!(bitmap.find_free_region(40), 160);
    }

    #[test]
    fn test_sentinel_cases() {
        let mut bitmap = RegionBitmap::new(10);
        assert_eq!(bitmap.find_free_region(0), 10);
        assert_eq!(bitmap.find_free_region(11), 10);
        assert_eq!(bitmap.find_free_region(10), 0);

        bitmap.fill_region(0, 10);
        assert!(bitmap.is_full());
        assert_eq!(bitmap.find_free_region(1), 10);
    }

    #[test]
    fn test_take_first_free_lowest_first() {
        let mut bitmap = RegionBitmap::new(130);

        assert_eq!(bitmap.take_first_free(), Some(0));
        assert_eq!(bitmap.take_first_free(), Some(1));

        bitmap.fill_region(2, 128);
        assert_eq!(bitmap.take_first_free(), Some(128));

        bitmap.release(0);
        assert_eq!(bitmap.take_first_free(), Some(0));
        assert_eq!(bitmap.take_first_free(), Some(129));
        assert_eq!(bitmap.take_first_free(), None);
        assert!(bitmap.is_full());
    }

    #[test]
    #[should_panic(expected = "unit index out of bounds")]
    fn test_release_out_of_bounds() {
        let mut bitmap = RegionBitmap::new(10);
        bitmap.release(10);
    }

    #[test]
    #[should_panic(expected = "out of bounds for capacity")]
    fn test_fill_past_capacity() {
        let mut bitmap = RegionBitmap::new(10);
        bitmap.fill_region(5, 11);
    }

    /// Reference first-fit over a plain bool vector.
    fn naive_find(free: &[bool], n: usize) -> usize {
        if n == 0 || n > free.len() {
            return free.len();
        }
        (0..=free.len() - n)
            .find(|&start| free[start..start + n].iter().all(|&f| f))
            .unwrap_or(free.len())
    }

    proptest! {
        #[test]
        fn prop_find_matches_reference(
            capacity in 1usize..300,
            taken in proptest::collection::vec((0usize..300, 1usize..40), 0..12),
            n in 1usize..80,
        ) {
            let mut bitmap = RegionBitmap::new(capacity);
            let mut reference = vec![true; capacity];
            for (start, len) in taken {
                let start = start % capacity;
                let end = (start + len).min(capacity);
                bitmap.fill_region(start, end);
                reference[start..end].iter_mut().for_each(|f| *f = false);
            }

            let found = bitmap.find_free_region(n);
            prop_assert_eq!(found, naive_find(&reference, n));
            if found != capacity {
                prop_assert!(found + n <= capacity);
            }
        }

        #[test]
        fn prop_fill_then_zero_restores(
            capacity in 1usize..300,
            start in 0usize..300,
            len in 0usize..300,
        ) {
            let mut bitmap = RegionBitmap::new(capacity);
            bitmap.fill_region(0, capacity / 3);
            let before = bitmap.clone();

            let start = start % capacity;
            let end = (start + len).min(capacity);
            let free = bitmap.find_free_region(end - start);
            if end > start && free != capacity {
                bitmap.fill_region(free, free + (end - start));
                bitmap.zero_region(free, free + (end - start));
                prop_assert_eq!(bitmap, before);
            }
        }
    }
}
