//! FIFO buffers sitting on edges.
//!
//! A full buffer refuses new items and hands them back to the caller; that
//! is backpressure, not an error. Multi-item removal is all-or-nothing.

use crate::item::Item;
use std::collections::VecDeque;

/// Returned when a planned removal no longer matches the buffer contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("needed {needed} item(s) but only {available} queued")]
pub struct Shortfall {
    pub needed: usize,
    pub available: usize,
}

/// Queue of items waiting on one edge.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    capacity: Option<u32>,
    queue: VecDeque<Item>,
    total_passed: u64,
}

impl Buffer {
    /// `None` means unbounded.
    pub fn new(capacity: Option<u32>) -> Self {
        Self {
            capacity,
            queue: VecDeque::new(),
            total_passed: 0,
        }
    }

    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Free slots, or `None` when unbounded.
    pub fn free_space(&self) -> Option<usize> {
        self.capacity
            .map(|cap| (cap as usize).saturating_sub(self.queue.len()))
    }

    pub fn has_space_for(&self, n: usize) -> bool {
        self.free_space().is_none_or(|free| free >= n)
    }

    pub fn is_full(&self) -> bool {
        !self.has_space_for(1)
    }

    /// Items ever accepted by this buffer.
    pub fn total_passed(&self) -> u64 {
        self.total_passed
    }

    /// Append an item, or hand it back if the buffer is full.
    pub fn try_push(&mut self, item: Item) -> Result<(), Item> {
        if self.is_full() {
            return Err(item);
        }
        self.queue.push_back(item);
        self.total_passed += 1;
        Ok(())
    }

    /// Append every item or none of them.
    pub fn try_push_all(&mut self, items: Vec<Item>) -> Result<(), Vec<Item>> {
        if !self.has_space_for(items.len()) {
            return Err(items);
        }
        self.total_passed += items.len() as u64;
        self.queue.extend(items);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Item> {
        self.queue.pop_front()
    }

    /// Remove exactly `n` items from the front, or nothing at all.
    pub fn take(&mut self, n: usize) -> Result<Vec<Item>, Shortfall> {
        if self.queue.len() < n {
            return Err(Shortfall {
                needed: n,
                available: self.queue.len(),
            });
        }
        Ok(self.queue.drain(..n).collect())
    }

    pub fn front(&self) -> Option<&Item> {
        self.queue.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.queue.iter()
    }

    /// Drop all queued items, keeping the lifetime counter.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
