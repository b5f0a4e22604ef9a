//! Height-to-hash index of the current canonical chain.

use std::collections::HashMap;

use crate::record::BlockHash;

/// Which hash is considered canonical at each height.
///
/// Written on every head move. Entries are never pruned; the index is a
/// by-product of head updates, not a bounded structure like the history.
#[derive(Debug, Clone, Default)]
pub struct CanonicalIndex {
    by_height: HashMap<u64, BlockHash>,
}

impl CanonicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `hash` canonical at `number`, replacing any previous entry.
    pub fn set(&mut self, number: u64, hash: BlockHash) {
        self.by_height.insert(number, hash);
    }

    pub fn get(&self, number: u64) -> Option<BlockHash> {
        self.by_height.get(&number).copied()
    }

    pub fn len(&self) -> usize {
        self.by_height.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }
}
