//! Scan cursor and the one-time start decision.
//!
//! The cursor is the highest block whose qualifying events all have a terminal outcome. It only
//! moves forward; persistence is the [crate::checkpoint] store's job.

/// Cursor: last fully scanned block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub last_scanned_block: u64,
}

impl Cursor {
    pub fn new(last_scanned_block: u64) -> Self {
        Self { last_scanned_block }
    }

    /// First block not yet covered by the cursor.
    pub fn next_block(&self) -> u64 {
        self.last_scanned_block.saturating_add(1)
    }

    /// Move the cursor to `block`. Returns false (and leaves the cursor alone) if that would
    /// move it backwards.
    pub fn advance_to(&mut self, block: u64) -> bool {
        if block < self.last_scanned_block {
            tracing::warn!(
                current = self.last_scanned_block,
                requested = block,
                "refusing to move cursor backwards"
            );
            return false;
        }
        self.last_scanned_block = block;
        true
    }
}

/// Where the scan starts, decided once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    /// Persisted state found.
    Resumed {
        cursor: Cursor,
        processed: Vec<String>,
    },
    /// No persisted state. The cursor starts at `start_height`; scanning begins at the next block.
    Fresh { start_height: u64 },
}

impl StartPoint {
    /// Cursor the coordinator begins with.
    pub fn cursor(&self) -> Cursor {
        match self {
            StartPoint::Resumed { cursor, .. } => *cursor,
            StartPoint::Fresh { start_height } => Cursor::new(*start_height),
        }
    }
}
