//! Block history — a sliding window of recently accepted block pointers,
//! scanned newest-first to locate the fork point during a reorg.

use std::collections::VecDeque;

use crate::types::BlockPointer;

/// Retains the last `capacity` accepted `(block_number, block_hash)` pairs.
///
/// The window is owned exclusively by the reader; it must be at least as
/// deep as the worst reorg the chain can produce, or fork resolution fails
/// with `ReorgTooDeep`.
pub struct BlockHistory {
    /// Oldest first.
    window: VecDeque<BlockPointer>,
    capacity: usize,
}

impl BlockHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an accepted block, evicting the oldest entry when full.
    pub fn push(&mut self, pointer: BlockPointer) {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(pointer);
    }

    /// The most recently accepted block.
    pub fn head(&self) -> Option<&BlockPointer> {
        self.window.back()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    /// Discard every entry above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.block_number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    /// Iterate from the most recent entry to the oldest.
    pub fn newest_first(&self) -> impl Iterator<Item = &BlockPointer> {
        self.window.iter().rev()
    }
}
