//! A fixed-capacity ring of recent entries
//!
//! Entries are written into the next free slot; once every slot is used the
//! oldest write is overwritten (eviction by insertion order, not by recency of use).
//!
//! An entry whose key matches one already stored replaces it in place
//! and does not advance the write pointer.
//!
//! The ring is not synchronised, owners wrap it in a lock.

#[derive(Debug, Clone)]
pub struct RingBuf<T> {
    slots: Vec<Option<T>>,
    next: usize,
}

impl<T> RingBuf<T> {
    /// Create a new RingBuf holding at most `cap` entries
    /// A zero capacity is bumped to one
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || None);
        Self { slots, next: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Write an element into the next slot
    /// Returns the element it evicted, if the slot was occupied
    pub fn push(&mut self, elem: T) -> Option<T> {
        let evicted = self.slots[self.next].replace(elem);
        self.next = (self.next + 1) % self.slots.len();
        evicted
    }

    /// Overwrite the first element for which `same_key` holds,
    /// otherwise push into the next slot
    /// Returns whatever was displaced
    pub fn upsert<F>(&mut self, elem: T, same_key: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        match self.position(same_key) {
            Some(pos) => self.slots[pos].replace(elem),
            None => self.push(elem),
        }
    }

    /// First stored element matching the predicate
    pub fn find<F>(&self, pred: F) -> Option<&T>
    where
        F: Fn(&T) -> bool,
    {
        self.iter().find(|e| pred(e))
    }

    /// Remove the first element matching the predicate
    /// The slot is left empty, the write pointer does not move
    pub fn remove<F>(&mut self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let pos = self.position(pred)?;
        self.slots[pos].take()
    }

    /// Iterate over the occupied slots in slot order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    fn position<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&T) -> bool,
    {
        self.slots
            .iter()
            .position(|s| s.as_ref().map_or(false, |e| pred(e)))
    }
}
