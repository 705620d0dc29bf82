//! Bounded-capacity accounting.

/// Tracks how much of a block's bounded capacity is in use.
///
/// Every unit charged on acceptance is credited exactly once, when the
/// output buffer reports its removal or the block drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingState {
    capacity: usize,
    current: usize,
}

impl BoundingState {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            current: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn has_room(&self) -> bool {
        self.current < self.capacity
    }

    pub fn has_room_for(&self, count: usize) -> bool {
        self.current.saturating_add(count) <= self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.current)
    }

    pub fn charge(&mut self, count: usize) {
        self.current += count;
    }

    pub fn credit(&mut self, count: usize) {
        debug_assert!(count <= self.current, "bounding credit exceeds charge");
        self.current = self.current.saturating_sub(count);
    }
}
