//! Edit batching
//!
//! A batch is an ordered sequence of canonical edits for one destination
//! namespace, flushed by the caller's count/time policy and consumed
//! exactly once by the writer. A batch is wholesale-retryable only when
//! every edit in it is idempotent; plain inserts disqualify it, so a lost
//! connection mid-commit degrades those to per-edit replay instead.

use crate::oplog::OplogEdit;

/// An ordered sequence of edits sharing one destination namespace.
#[derive(Debug, Clone)]
pub struct EditBatch {
    /// Destination database
    pub db: String,
    /// Destination collection
    pub coll: String,
    /// Edits in original log order
    pub edits: Vec<OplogEdit>,
    /// Whether the destination must apply edits in order
    pub ordered: bool,
}

impl EditBatch {
    /// Create an empty batch for a namespace.
    pub fn new(db: impl Into<String>, coll: impl Into<String>, ordered: bool) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
            edits: Vec::new(),
            ordered,
        }
    }

    /// Append an edit, preserving log order.
    pub fn push(&mut self, edit: OplogEdit) {
        self.edits.push(edit);
    }

    /// Number of edits in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Check if the batch is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// The namespace as `db.coll`.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    /// Whether the whole batch may be retried from scratch after a lost
    /// connection. True iff every edit is idempotent.
    pub fn retryable(&self) -> bool {
        self.edits.iter().all(OplogEdit::is_idempotent)
    }

    /// Count edits by kind, for logging.
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for edit in &self.edits {
            match edit {
                OplogEdit::Insert { .. } => counts.inserts += 1,
                OplogEdit::Upsert { .. } => counts.upserts += 1,
                OplogEdit::Update { .. } => counts.updates += 1,
                OplogEdit::Delete { .. } => counts.deletes += 1,
            }
        }
        counts
    }
}

/// Per-kind edit counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub inserts: usize,
    pub upserts: usize,
    pub updates: usize,
    pub deletes: usize,
}
