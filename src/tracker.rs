//! Reorg-aware supply aggregation.
//!
//! [`SupplyTracker`] is the heart of the daemon: it accepts per-block supply
//! records in whatever order the log delivers them (clean successors,
//! forward gaps, rollbacks, competing blocks at the same height) and keeps
//! the running totals equal to the sum of block effects along the current
//! canonical chain.
//!
//! Reconciliation works on the bounded [`BlockHistory`]: a rewind walks the
//! formerly-canonical chain downward and subtracts each reverted block's
//! effect; a forward traces parent links backward from the target to the
//! join point with the current head and then replays the missing blocks.
//! Both directions can hand off to each other (a sibling replacement rewinds
//! one height and then forwards onto the new block; a forward replay across
//! a divergent branch rewinds back to the fork point first), so the walk
//! depth is explicitly capped.
//!
//! On failure the tracker does not roll back: an error surfaced mid-walk can
//! leave the head repositioned part-way through the reorg. The caller is
//! expected to log and continue; a subsequent valid record re-converges the
//! state (see the parent-mismatch tests).

use thiserror::Error;
use tracing::warn;

use crate::amount::Amount;
use crate::canonical::CanonicalIndex;
use crate::history::{BlockHistory, HISTORY_LIMIT};
use crate::record::{BlockHash, Burn, Issuance, SupplyRecord};

/// Cap on nested rewind/forward steps while reconciling one record.
///
/// The mutual recursion is naturally bounded by the history window; the cap
/// turns a malformed history into an error instead of a stack overflow.
pub const MAX_WALK_DEPTH: usize = 2 * HISTORY_LIMIT;

/// Identity of the most recently applied canonical block.
///
/// The all-zero value (number 0, zero hash) is the uninitialised state: the
/// first record ingested becomes the head without any reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub number: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
}

impl HeadInfo {
    pub fn is_uninitialized(&self) -> bool {
        self.number == 0 && self.hash.is_zero()
    }
}

/// Running aggregate of every block effect applied and not later reverted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupplyTotals {
    /// Net supply change: issuance total minus burn total. Signed.
    pub delta: Amount,
    pub issuance: Issuance,
    pub burn: Burn,
}

impl SupplyTotals {
    /// Credit one block's effect.
    pub fn add(&mut self, record: &SupplyRecord) {
        self.issuance.genesis_alloc += &record.issuance.genesis_alloc;
        self.issuance.reward += &record.issuance.reward;
        self.issuance.withdrawals += &record.issuance.withdrawals;
        self.burn.eip1559 += &record.burn.eip1559;
        self.burn.blob += &record.burn.blob;
        self.burn.misc += &record.burn.misc;
        self.delta += record.delta();
    }

    /// Revert one block's effect.
    pub fn sub(&mut self, record: &SupplyRecord) {
        self.issuance.genesis_alloc -= &record.issuance.genesis_alloc;
        self.issuance.reward -= &record.issuance.reward;
        self.issuance.withdrawals -= &record.issuance.withdrawals;
        self.burn.eip1559 -= &record.burn.eip1559;
        self.burn.blob -= &record.burn.blob;
        self.burn.misc -= &record.burn.misc;
        self.delta -= record.delta();
    }
}

/// Where a rewind is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindTarget {
    /// Height unknown: locate the block by scanning the history for its hash.
    ByHash(BlockHash),
    /// Height known.
    ByHeight { number: u64, hash: BlockHash },
}

impl RewindTarget {
    fn hash(&self) -> BlockHash {
        match *self {
            RewindTarget::ByHash(hash) => hash,
            RewindTarget::ByHeight { hash, .. } => hash,
        }
    }
}

/// How a rewind or forward target is identified in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Height(u64),
    Hash(BlockHash),
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockRef::Height(number) => write!(f, "#{number}"),
            BlockRef::Hash(hash) => write!(f, "{hash}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// After reconciliation the head still does not match the record's
    /// claimed parent; the record is skipped.
    #[error(
        "skipping block {number}: claims parent {parent_hash}, head is block {head_number} ({head_hash})"
    )]
    ParentMismatch {
        number: u64,
        parent_hash: BlockHash,
        head_number: u64,
        head_hash: BlockHash,
    },

    /// A rewind or forward target lies outside the retained window.
    #[error("block {target} is not in history (oldest {oldest}, newest {newest})")]
    NotInHistory {
        target: BlockRef,
        oldest: u64,
        newest: u64,
    },

    /// No canonical hash recorded for a height mid-rewind.
    #[error("no canonical hash for block {number}")]
    MissingCanonical { number: u64 },

    /// The canonical block at a height is missing from history mid-rewind.
    #[error("no supply record for block {number} ({hash})")]
    MissingHistory { number: u64, hash: BlockHash },

    /// The parent-hash chain broke while tracing a forward path.
    #[error("parent chain broken: hash {hash} not in history at block {number}")]
    ParentChainBroken { number: u64, hash: BlockHash },

    /// A forward walk finished somewhere other than its target.
    #[error(
        "forward walk stopped at block {have_number} ({have_hash}), wanted block {want_number} ({want_hash})"
    )]
    ForwardIncomplete {
        want_number: u64,
        want_hash: BlockHash,
        have_number: u64,
        have_hash: BlockHash,
    },

    /// The rewind/forward recursion exceeded its cap; the history is
    /// malformed.
    #[error("reorg walk exceeded {limit} nested steps")]
    WalkDepthExceeded { limit: usize },
}

/// The aggregator state machine.
#[derive(Debug, Default)]
pub struct SupplyTracker {
    head: HeadInfo,
    totals: SupplyTotals,
    history: BlockHistory,
    canonical: CanonicalIndex,
}

impl SupplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted head and totals.
    ///
    /// History and canonical index start empty, so the tracker can extend
    /// the checkpointed head but cannot reorganise across it; records that
    /// try fail with [`TrackerError::NotInHistory`].
    pub fn from_checkpoint(head: HeadInfo, totals: SupplyTotals) -> Self {
        Self {
            head,
            totals,
            history: BlockHistory::new(),
            canonical: CanonicalIndex::new(),
        }
    }

    pub fn head(&self) -> &HeadInfo {
        &self.head
    }

    pub fn totals(&self) -> &SupplyTotals {
        &self.totals
    }

    pub fn history(&self) -> &BlockHistory {
        &self.history
    }

    /// Consistent copy of head and totals.
    pub fn snapshot(&self) -> (HeadInfo, SupplyTotals) {
        (self.head, self.totals.clone())
    }

    /// Apply one record, reconciling the head first if it does not follow
    /// cleanly.
    ///
    /// On success the record is the new head, its effect is in the totals,
    /// and it has been stored in the history. On failure the record is
    /// skipped, but reconciliation may already have moved the head and
    /// totals part-way; the next valid record re-converges the state.
    pub fn ingest(&mut self, record: SupplyRecord) -> Result<(), TrackerError> {
        if !self.head.is_uninitialized() {
            self.reconcile(&record)?;

            // The reconciled head must be the record's parent.
            let parent_number = record.number.wrapping_sub(1);
            if self.head.number != parent_number || self.head.hash != record.parent_hash {
                return Err(TrackerError::ParentMismatch {
                    number: record.number,
                    parent_hash: record.parent_hash,
                    head_number: self.head.number,
                    head_hash: self.head.hash,
                });
            }
        }

        self.set_head(&record);
        self.totals.add(&record);
        self.history.upsert(record);
        self.history.evict_oldest_over_limit();
        Ok(())
    }

    /// Bring the head to the record's parent, whichever side of it the head
    /// currently sits.
    fn reconcile(&mut self, record: &SupplyRecord) -> Result<(), TrackerError> {
        if record.number > self.head.number + 1 {
            // The log skipped ahead; walk up to the record's parent.
            self.forward_to(record.number - 1, record.parent_hash, 0)
        } else if record.number <= self.head.number || record.parent_hash != self.head.hash {
            let target = if record.parent_hash != self.head.hash {
                // Unknown parent: its height must be found by hash.
                RewindTarget::ByHash(record.parent_hash)
            } else {
                match record.number.checked_sub(1) {
                    Some(number) => RewindTarget::ByHeight {
                        number,
                        hash: record.parent_hash,
                    },
                    // A height-0 record has no parent height to aim at.
                    None => RewindTarget::ByHash(record.parent_hash),
                }
            };
            self.rewind_to(target, 0)
        } else {
            // Clean successor.
            Ok(())
        }
    }

    /// Move the head to `record` and mark it canonical at its height.
    fn set_head(&mut self, record: &SupplyRecord) {
        self.head = HeadInfo {
            number: record.number,
            hash: record.hash,
            parent_hash: record.parent_hash,
        };
        self.canonical.set(record.number, record.hash);
    }

    fn window(&self) -> (u64, u64) {
        (
            self.history.oldest_key().unwrap_or_default(),
            self.history.newest_key().unwrap_or_default(),
        )
    }

    /// Reposition the head on `target`, subtracting each reverted block's
    /// effect on the way down. The block at the target height itself stays
    /// applied.
    ///
    /// When the target sits at the current head height this is a sibling
    /// replacement, not a true rewind: the walk steps down one extra height
    /// and a forward onto the replacement block runs afterwards.
    fn rewind_to(&mut self, target: RewindTarget, depth: usize) -> Result<(), TrackerError> {
        if depth > MAX_WALK_DEPTH {
            return Err(TrackerError::WalkDepthExceeded {
                limit: MAX_WALK_DEPTH,
            });
        }

        let from = self.head.number;
        let (oldest, newest) = self.window();

        let number = match target {
            RewindTarget::ByHash(hash) => {
                self.history
                    .find_by_hash(&hash)
                    .ok_or(TrackerError::NotInHistory {
                        target: BlockRef::Hash(hash),
                        oldest,
                        newest,
                    })?
                    .number
            }
            RewindTarget::ByHeight { number, .. } => {
                if self.history.is_empty() || newest < number || oldest > number {
                    return Err(TrackerError::NotInHistory {
                        target: BlockRef::Height(number),
                        oldest,
                        newest,
                    });
                }
                number
            }
        };

        // Sibling replacement: rewind to the parent height first, then
        // forward onto the replacement block.
        let mut deferred_forward = None;
        let walk_floor = if number == self.head.number {
            deferred_forward = Some((number, target.hash()));
            number.checked_sub(1)
        } else {
            Some(number)
        };

        if let Some(floor) = walk_floor {
            if self.head.number >= floor {
                let mut reverted = 0usize;
                let mut current = self.head.number;
                loop {
                    let hash =
                        self.canonical
                            .get(current)
                            .ok_or(TrackerError::MissingCanonical { number: current })?;
                    let record = self
                        .history
                        .get_at(current, &hash)
                        .cloned()
                        .ok_or(TrackerError::MissingHistory {
                            number: current,
                            hash,
                        })?;

                    self.set_head(&record);

                    if current == floor {
                        // The block at the target height stays applied.
                        break;
                    }
                    self.totals.sub(&record);
                    reverted += 1;
                    current -= 1;
                }

                if reverted > 3 {
                    warn!(
                        "Rewound from block {} to block {} across {} reverted blocks",
                        from, self.head.number, reverted
                    );
                }
            }
        }

        if let Some((number, hash)) = deferred_forward {
            self.forward_to(number, hash, depth + 1)?;
        }

        Ok(())
    }

    /// Advance the head to block `(number, hash)`.
    ///
    /// Traces parent links backward from the target through the history to
    /// the join point with the current head, then replays the collected
    /// blocks oldest-first, adding each effect. A replayed block whose
    /// height the head already occupies sits on a divergent branch; the
    /// replay rewinds back to its parent before applying it.
    fn forward_to(&mut self, number: u64, hash: BlockHash, depth: usize) -> Result<(), TrackerError> {
        if depth > MAX_WALK_DEPTH {
            return Err(TrackerError::WalkDepthExceeded {
                limit: MAX_WALK_DEPTH,
            });
        }

        let (oldest, newest) = self.window();
        // Strictly above the oldest retained height: the block below the
        // target must still be in the window for the join-point search.
        if self.history.is_empty() || newest < number || oldest >= number {
            return Err(TrackerError::NotInHistory {
                target: BlockRef::Height(number),
                oldest,
                newest,
            });
        }

        let mut lookup = hash;
        let mut pending: Vec<SupplyRecord> = Vec::new();
        for (height, bucket) in self.history.iter_newest_first() {
            // Newer heights are irrelevant to this target.
            if height > number {
                continue;
            }
            let record = bucket
                .get(&lookup)
                .ok_or(TrackerError::ParentChainBroken {
                    number: height,
                    hash: lookup,
                })?;
            let at_join = height < number && self.head.number > height;
            lookup = record.parent_hash;
            if at_join {
                break;
            }
            pending.push(record.clone());
        }
        // Collected newest-first; replay oldest-first.
        pending.reverse();

        let replayed = pending.len();
        let started_at = self.head.number;
        for record in pending {
            if self.head.number >= record.number {
                // The head sits on a divergent branch at or above this
                // height; back off to the record's parent first.
                let parent_number = record.number.checked_sub(1).ok_or(
                    TrackerError::NotInHistory {
                        target: BlockRef::Height(record.number),
                        oldest,
                        newest,
                    },
                )?;
                self.rewind_to(
                    RewindTarget::ByHeight {
                        number: parent_number,
                        hash: record.parent_hash,
                    },
                    depth + 1,
                )?;
            }

            self.set_head(&record);
            self.totals.add(&record);
        }

        if self.head.number != number || self.head.hash != hash {
            return Err(TrackerError::ForwardIncomplete {
                want_number: number,
                want_hash: hash,
                have_number: self.head.number,
                have_hash: self.head.hash,
            });
        }

        if replayed > 3 {
            warn!(
                "Forwarded from block {} to block {} across {} replayed blocks",
                started_at, number, replayed
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        BlockHash::new(bytes)
    }

    fn reward_record(number: u64, hash_: BlockHash, parent: BlockHash, reward: u64) -> SupplyRecord {
        SupplyRecord {
            number,
            hash: hash_,
            parent_hash: parent,
            issuance: Issuance {
                reward: Amount::from(reward),
                ..Default::default()
            },
            burn: Burn::default(),
        }
    }

    /// Chain 0..len with hash byte == height byte and reward 1 each.
    fn ingest_unit_chain(tracker: &mut SupplyTracker, len: u64) {
        for number in 0..len {
            let parent = if number == 0 {
                BlockHash::ZERO
            } else {
                hash(number as u8 - 1)
            };
            tracker
                .ingest(reward_record(number, hash(number as u8), parent, 1))
                .unwrap();
        }
    }

    #[test]
    fn test_bootstrap_from_uninitialized() {
        let mut tracker = SupplyTracker::new();
        assert!(tracker.head().is_uninitialized());

        ingest_unit_chain(&mut tracker, 2);

        assert_eq!(tracker.head().number, 1);
        assert_eq!(tracker.head().hash, hash(1));
        assert_eq!(tracker.head().parent_hash, hash(0));
        assert_eq!(tracker.totals().issuance.reward, Amount::from(2u64));
        assert_eq!(tracker.totals().delta, Amount::from(2u64));
    }

    #[test]
    fn test_clean_successor_keeps_summing() {
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 5);

        assert_eq!(tracker.totals().delta, Amount::from(5u64));
        assert_eq!(tracker.history().len(), 5);
        for number in 0..5u64 {
            assert!(tracker.history().get_at(number, &hash(number as u8)).is_some());
        }
    }

    #[test]
    fn test_sibling_replacement_at_head_height() {
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 4);
        assert_eq!(tracker.totals().issuance.reward, Amount::from(4u64));

        // Competing block at height 3 with the same parent, reward 2.
        tracker
            .ingest(reward_record(3, hash(31), hash(2), 2))
            .unwrap();

        assert_eq!(tracker.head().number, 3);
        assert_eq!(tracker.head().hash, hash(31));
        assert_eq!(tracker.totals().issuance.reward, Amount::from(5u64));
        assert_eq!(tracker.totals().delta, Amount::from(5u64));
        // Both competitors remain in history.
        assert_eq!(tracker.history().get(3).unwrap().len(), 2);
    }

    #[test]
    fn test_rewind_multiple_heights() {
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 5);

        // New block at height 2 extending block 1: heights 2..4 unwind.
        tracker
            .ingest(reward_record(2, hash(21), hash(1), 3))
            .unwrap();

        assert_eq!(tracker.head().number, 2);
        assert_eq!(tracker.head().hash, hash(21));
        // 5 - 3 reverted + 3 = 5.
        assert_eq!(tracker.totals().issuance.reward, Amount::from(5u64));
    }

    #[test]
    fn test_parent_mismatch_is_surfaced_and_recoverable() {
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 3);

        // Block 3 claiming block 1 as parent: a one-block-late fork point.
        let err = tracker
            .ingest(reward_record(3, hash(3), hash(1), 1))
            .unwrap_err();
        assert!(matches!(err, TrackerError::ParentMismatch { number: 3, .. }));

        // The failed reconcile rewound the head to block 1.
        assert_eq!(tracker.head().number, 1);

        // A valid successor of the original chain still lands.
        tracker
            .ingest(reward_record(3, hash(31), hash(2), 1))
            .unwrap();
        assert_eq!(tracker.head().number, 3);
        assert_eq!(tracker.head().hash, hash(31));
        assert_eq!(tracker.totals().issuance.reward, Amount::from(4u64));
    }

    #[test]
    fn test_unknown_parent_not_in_history() {
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 3);

        let err = tracker
            .ingest(reward_record(3, hash(3), hash(99), 1))
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::NotInHistory {
                target: BlockRef::Hash(_),
                ..
            }
        ));
    }

    #[test]
    fn test_forward_gap_replays_intermediate_blocks() {
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 2);

        // Blocks 2 and 3 arrive out of band (e.g. seen while head was
        // elsewhere), then block 4 references block 3 as parent.
        tracker.history.upsert(reward_record(2, hash(2), hash(1), 1));
        tracker.history.upsert(reward_record(3, hash(3), hash(2), 1));

        tracker
            .ingest(reward_record(4, hash(4), hash(3), 1))
            .unwrap();

        assert_eq!(tracker.head().number, 4);
        assert_eq!(tracker.totals().issuance.reward, Amount::from(5u64));
    }

    #[test]
    fn test_forward_across_divergent_branch() {
        // Mirrors the deep-reorg scenario: two complete chains to height 3,
        // head on the lighter one at height 1.
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 2);

        tracker.history.upsert(reward_record(1, hash(11), hash(0), 2));
        tracker.history.upsert(reward_record(2, hash(2), hash(1), 1));
        tracker.history.upsert(reward_record(2, hash(21), hash(11), 2));
        tracker.history.upsert(reward_record(3, hash(3), hash(2), 1));
        tracker.history.upsert(reward_record(3, hash(31), hash(21), 2));

        // Block 4 extends the heavier branch tip.
        tracker
            .ingest(reward_record(4, hash(41), hash(31), 2))
            .unwrap();

        assert_eq!(tracker.head().number, 4);
        assert_eq!(tracker.head().hash, hash(41));
        // 1 (block 0) + 2 + 2 + 2 (replacement branch) + 2 (block 4).
        assert_eq!(tracker.totals().issuance.reward, Amount::from(9u64));
    }

    #[test]
    fn test_forward_refuses_oldest_retained_height() {
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 3);

        let oldest = tracker.history().oldest_key().unwrap();
        let err = tracker.forward_to(oldest, hash(0), 0).unwrap_err();
        assert!(matches!(err, TrackerError::NotInHistory { .. }));
    }

    #[test]
    fn test_negative_delta_block() {
        let mut tracker = SupplyTracker::new();
        let record = SupplyRecord {
            number: 0,
            hash: hash(1),
            parent_hash: BlockHash::ZERO,
            issuance: Issuance {
                reward: Amount::from(5u64),
                ..Default::default()
            },
            burn: Burn {
                eip1559: Amount::from(8u64),
                ..Default::default()
            },
        };
        tracker.ingest(record).unwrap();

        assert_eq!(tracker.totals().delta, Amount::from(-3i64));
        assert_eq!(tracker.totals().issuance.reward, Amount::from(5u64));
        assert_eq!(tracker.totals().burn.eip1559, Amount::from(8u64));
    }

    #[test]
    fn test_checkpoint_resume_extends_but_cannot_reorg() {
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 3);
        let (head, totals) = tracker.snapshot();

        let mut resumed = SupplyTracker::from_checkpoint(head, totals);
        assert!(!resumed.head().is_uninitialized());
        assert!(resumed.history().is_empty());

        // Clean successor extends the checkpointed head.
        resumed
            .ingest(reward_record(3, hash(3), hash(2), 1))
            .unwrap();
        assert_eq!(resumed.totals().issuance.reward, Amount::from(4u64));

        // A sibling of the checkpointed head needs pre-checkpoint history.
        let err = resumed
            .ingest(reward_record(3, hash(32), hash(21), 1))
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotInHistory { .. }));
    }

    #[test]
    fn test_reingesting_head_rewinds_and_reapplies() {
        // There is no deduplication, but re-feeding the current head walks
        // the rewind path first: its effect is subtracted and re-added, and
        // the history entry is overwritten rather than duplicated.
        let mut tracker = SupplyTracker::new();
        ingest_unit_chain(&mut tracker, 2);

        tracker
            .ingest(reward_record(1, hash(1), hash(0), 1))
            .unwrap();

        assert_eq!(tracker.totals().issuance.reward, Amount::from(2u64));
        assert_eq!(tracker.head().number, 1);
        assert_eq!(tracker.history().get(1).unwrap().len(), 1);
    }
}
