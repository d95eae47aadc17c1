//! Fixed-capacity ring of slots indexed by sequence ordinal.
//!
//! [`SlotRing`] holds the outstanding units of a sliding-window sender.
//! Ordinals are absolute `u64` counters; ordinal `n` lives in slot
//! `n % capacity`.  The ring tracks the half-open range `[head, tail)` of
//! occupied ordinals and never grows, so `tail - head <= capacity` holds by
//! construction.

#[derive(Debug, Clone)]
pub struct SlotRing<T> {
    slots: Vec<Option<T>>,
    head: u64,
    tail: u64,
}

impl<T> SlotRing<T> {
    /// Create an empty ring whose first ordinal is `start`.
    pub fn new(capacity: usize, start: u64) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: start,
            tail: start,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Oldest occupied ordinal (equal to [`tail`](Self::tail) when empty).
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Ordinal the next [`push_back`](Self::push_back) will receive.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    fn index(&self, ordinal: u64) -> usize {
        (ordinal % self.slots.len() as u64) as usize
    }

    /// Append `value` at ordinal [`tail`](Self::tail).
    ///
    /// Returns the value back when the ring is full.
    pub fn push_back(&mut self, value: T) -> Result<u64, T> {
        if self.is_full() {
            return Err(value);
        }
        let ordinal = self.tail;
        let idx = self.index(ordinal);
        self.slots[idx] = Some(value);
        self.tail += 1;
        Ok(ordinal)
    }

    /// Remove and return the oldest value with its ordinal.
    pub fn pop_front(&mut self) -> Option<(u64, T)> {
        if self.is_empty() {
            return None;
        }
        let ordinal = self.head;
        let idx = self.index(ordinal);
        self.head += 1;
        self.slots[idx].take().map(|value| (ordinal, value))
    }

    pub fn front(&self) -> Option<&T> {
        self.get(self.head)
    }

    pub fn get(&self, ordinal: u64) -> Option<&T> {
        if ordinal < self.head || ordinal >= self.tail {
            return None;
        }
        self.slots[self.index(ordinal)].as_ref()
    }

    pub fn get_mut(&mut self, ordinal: u64) -> Option<&mut T> {
        if ordinal < self.head || ordinal >= self.tail {
            return None;
        }
        let idx = self.index(ordinal);
        self.slots[idx].as_mut()
    }

    /// Occupied entries from oldest to newest, with their ordinals.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        (self.head..self.tail).filter_map(move |ordinal| self.get(ordinal).map(|v| (ordinal, v)))
    }

    /// Remove every entry.  `head` catches up with `tail`.
    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_until_full() {
        let mut ring = SlotRing::new(3, 0);
        assert_eq!(ring.push_back('a'), Ok(0));
        assert_eq!(ring.push_back('b'), Ok(1));
        assert_eq!(ring.push_back('c'), Ok(2));
        assert!(ring.is_full());
        assert_eq!(ring.push_back('d'), Err('d'));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn slots_are_reused_after_pop() {
        let mut ring = SlotRing::new(2, 10);
        ring.push_back(10).unwrap();
        ring.push_back(11).unwrap();
        assert_eq!(ring.pop_front(), Some((10, 10)));
        assert_eq!(ring.push_back(12), Ok(12));
        assert_eq!(ring.get(10), None);
        assert_eq!(ring.get(11), Some(&11));
        assert_eq!(ring.get(12), Some(&12));
        assert_eq!(ring.head(), 11);
        assert_eq!(ring.tail(), 13);
    }

    #[test]
    fn iter_runs_oldest_to_newest() {
        let mut ring = SlotRing::new(4, 0);
        for v in ["x", "y", "z"] {
            ring.push_back(v).unwrap();
        }
        ring.pop_front();
        let seen: Vec<_> = ring.iter().collect();
        assert_eq!(seen, vec![(1, &"y"), (2, &"z")]);
    }

    #[test]
    fn get_mut_outside_range_is_none() {
        let mut ring: SlotRing<u8> = SlotRing::new(2, 5);
        assert!(ring.get_mut(5).is_none());
        ring.push_back(1).unwrap();
        *ring.get_mut(5).unwrap() = 9;
        assert_eq!(ring.front(), Some(&9));
    }

    #[test]
    fn clear_empties_ring() {
        let mut ring = SlotRing::new(2, 0);
        ring.push_back(()).unwrap();
        ring.push_back(()).unwrap();
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.head(), 2);
    }
}
