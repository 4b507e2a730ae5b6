//! Bounded FIFO of publishes parked while the broker session is down

use std::collections::VecDeque;

/// Bounded FIFO buffer; pushing beyond capacity hands the item back
#[derive(Debug)]
pub struct Outbox<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Outbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Queue an item, or return it when the buffer is exhausted
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Put an item back at the head after a failed flush
    pub fn push_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    /// Remove everything, dropping queued items
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
