//! Finality policy: which blocks are safe to scan given the current chain tip.
//!
//! Configure via [Strategy]; [ConfirmationDepth] treats a block as final once `K` blocks are mined
//! on top of it. [plan_range] turns the cursor and the tip into the range to scan, split into
//! eth_getLogs-sized batches.

/// Defines the highest block that is final given the current chain tip.
pub trait Strategy: Send + Sync {
    /// Highest final block. Blocks above it must not be scanned.
    fn safe_head(&self, latest: u64) -> u64;

    /// Returns true if `block` is final at `latest`.
    fn is_final(&self, block: u64, latest: u64) -> bool {
        block <= self.safe_head(latest)
    }
}

/// Confirmation-depth strategy: final when `latest >= block + K`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationDepth(pub u64);

impl Strategy for ConfirmationDepth {
    fn safe_head(&self, latest: u64) -> u64 {
        latest.saturating_sub(self.0)
    }

    fn is_final(&self, block: u64, latest: u64) -> bool {
        latest >= block.saturating_add(self.0)
    }
}

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Split into consecutive ranges of at most `max_len` blocks.
    pub fn batches(&self, max_len: u64) -> Vec<BlockRange> {
        let max_len = max_len.max(1);
        let mut out = Vec::new();
        let mut from = self.from;
        loop {
            let to = from.saturating_add(max_len - 1).min(self.to);
            out.push(BlockRange { from, to });
            if to == self.to {
                break;
            }
            from = to + 1;
        }
        out
    }
}

/// Range to scan this iteration: `[cursor + 1, safe_head]`, or `None` when nothing new is final.
pub fn plan_range(cursor: u64, latest: u64, strategy: &dyn Strategy) -> Option<BlockRange> {
    let safe_head = strategy.safe_head(latest);
    if safe_head <= cursor {
        return None;
    }
    Some(BlockRange {
        from: cursor + 1,
        to: safe_head,
    })
}
