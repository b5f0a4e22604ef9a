//! Bounded multi-version block history.
//!
//! [`BlockHistory`] retains the most recent [`HISTORY_LIMIT`] distinct block
//! heights, and at each height every competing block seen there, keyed by
//! hash. It is the window within which the tracker can still unwind a reorg;
//! anything older is gone for good.
//!
//! Heights are kept in first-seen insertion order, which is what eviction
//! walks. Because records arrive mostly monotonically this order usually
//! coincides with numeric order, but the min/max extremes are tracked in a
//! separate sorted index so `oldest_key`/`newest_key` stay correct even when
//! it does not.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::record::{BlockHash, SupplyRecord};

/// Maximum number of distinct block heights retained.
pub const HISTORY_LIMIT: usize = 1024;

/// Competing blocks at one height, keyed by hash.
pub type HeightBucket = HashMap<BlockHash, SupplyRecord>;

#[derive(Debug, Clone)]
pub struct BlockHistory {
    buckets: HashMap<u64, HeightBucket>,
    /// Heights in first-seen order; the front is next to be evicted.
    order: VecDeque<u64>,
    /// Sorted index of present heights, for the window extremes.
    keys: BTreeSet<u64>,
    limit: usize,
}

impl Default for BlockHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHistory {
    pub fn new() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }

    /// A history with a custom height capacity.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            order: VecDeque::new(),
            keys: BTreeSet::new(),
            limit,
        }
    }

    /// Number of distinct heights retained.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Smallest height present.
    pub fn oldest_key(&self) -> Option<u64> {
        self.keys.first().copied()
    }

    /// Largest height present.
    pub fn newest_key(&self) -> Option<u64> {
        self.keys.last().copied()
    }

    /// Store `record` under its height and hash.
    ///
    /// A new height takes the newest position in insertion order; reusing an
    /// existing height does not reorder it. A record at an already-present
    /// (height, hash) pair is overwritten.
    pub fn upsert(&mut self, record: SupplyRecord) {
        let number = record.number;
        match self.buckets.get_mut(&number) {
            Some(bucket) => {
                bucket.insert(record.hash, record);
            }
            None => {
                let mut bucket = HeightBucket::new();
                bucket.insert(record.hash, record);
                self.buckets.insert(number, bucket);
                self.order.push_back(number);
                self.keys.insert(number);
            }
        }
    }

    /// All competing blocks at `number`.
    pub fn get(&self, number: u64) -> Option<&HeightBucket> {
        self.buckets.get(&number)
    }

    /// The block at exactly `(number, hash)`.
    pub fn get_at(&self, number: u64, hash: &BlockHash) -> Option<&SupplyRecord> {
        self.buckets.get(&number).and_then(|bucket| bucket.get(hash))
    }

    /// Scan from the newest height to the oldest for a block with `hash`.
    ///
    /// Linear in the window size; only used when a parent must be located
    /// without knowing its height.
    pub fn find_by_hash(&self, hash: &BlockHash) -> Option<&SupplyRecord> {
        self.iter_newest_first()
            .find_map(|(_, bucket)| bucket.get(hash))
    }

    /// Iterate `(height, bucket)` pairs in reverse insertion order.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = (u64, &HeightBucket)> {
        self.order
            .iter()
            .rev()
            .filter_map(move |number| self.buckets.get(number).map(|bucket| (*number, bucket)))
    }

    /// Drop oldest-first-seen heights until the capacity holds.
    ///
    /// Eviction is unconditional: it never checks whether a height is still
    /// referenced by the canonical index.
    pub fn evict_oldest_over_limit(&mut self) {
        while self.order.len() > self.limit {
            if let Some(number) = self.order.pop_front() {
                self.buckets.remove(&number);
                self.keys.remove(&number);
            }
        }
    }
}
