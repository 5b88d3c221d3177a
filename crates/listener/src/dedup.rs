//! Processed-transaction set with a block-depth retention window.
//!
//! Each id remembers the block it was seen in. [ProcessedSet::prune] drops ids that fell more than
//! `retention_blocks` behind the cursor; those blocks are never rescanned, so their ids can no
//! longer collide. A `(block, id)` index keeps the persisted order without re-sorting.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct ProcessedSet {
    seen: HashMap<String, u64>,
    by_block: BTreeSet<(u64, String)>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted ids. The file only carries ids, so each is pinned to `block`
    /// (the resumed cursor) and kept for a full retention window from there.
    pub fn from_persisted(ids: impl IntoIterator<Item = String>, block: u64) -> Self {
        let mut set = Self::new();
        for id in ids {
            set.insert(id, block);
        }
        set
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.seen.contains_key(tx_id)
    }

    /// Record `tx_id` as processed. Returns false if it was already present.
    pub fn insert(&mut self, tx_id: String, block: u64) -> bool {
        use std::collections::hash_map::Entry;
        match self.seen.entry(tx_id) {
            Entry::Occupied(mut e) => {
                let prev = *e.get();
                if block > prev {
                    self.by_block.remove(&(prev, e.key().clone()));
                    self.by_block.insert((block, e.key().clone()));
                    e.insert(block);
                }
                false
            }
            Entry::Vacant(e) => {
                self.by_block.insert((block, e.key().clone()));
                e.insert(block);
                true
            }
        }
    }

    /// Evict ids seen below `cursor - retention_blocks`. Returns the number evicted.
    pub fn prune(&mut self, cursor: u64, retention_blocks: u64) -> usize {
        let floor = cursor.saturating_sub(retention_blocks);
        let kept = self.by_block.split_off(&(floor, String::new()));
        let evicted = std::mem::replace(&mut self.by_block, kept);
        for (_, id) in &evicted {
            self.seen.remove(id);
        }
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Ids in a stable order (by block, then id) for the state file.
    pub fn to_sorted_ids(&self) -> Vec<String> {
        self.by_block.iter().map(|(_, id)| id.clone()).collect()
    }
}
