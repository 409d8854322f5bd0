//! Batch planning for bulk message sync.
//!
//! Messages that need nothing but a document write go through the bulk
//! write primitive in fixed-size chunks. MMS with attachments need uploads
//! first and are synced one by one.

use crate::address::LocalMessage;

/// Default chunk size for bulk writes.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// A sync plan: chunks for bulk writes, plus messages that need uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan<'a> {
    /// Chunks of batchable messages, each at most `batch_size` long.
    pub chunks: Vec<Vec<&'a LocalMessage>>,
    /// Messages synced individually.
    pub individual: Vec<&'a LocalMessage>,
}

impl BatchPlan<'_> {
    /// Total messages in the plan.
    pub fn total(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum::<usize>() + self.individual.len()
    }
}

/// Split messages into bulk chunks and individual messages.
///
/// `batch_size` of zero is treated as one. Input order is kept within
/// each group.
pub fn plan<'a>(
    messages: impl IntoIterator<Item = &'a LocalMessage>,
    batch_size: usize,
    skip_attachments: bool,
) -> BatchPlan<'a> {
    let size = batch_size.max(1);
    let mut batchable = Vec::new();
    let mut individual = Vec::new();

    for msg in messages {
        if msg.needs_upload() && !skip_attachments {
            individual.push(msg);
        } else {
            batchable.push(msg);
        }
    }

    let chunks = batchable.chunks(size).map(|c| c.to_vec()).collect();
    BatchPlan { chunks, individual }
}

/// Cumulative sync progress reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Messages handled so far (written, skipped or dropped).
    pub synced: usize,
    /// Messages in the run.
    pub total: usize,
}

impl Progress {
    /// Start a run of `total` messages.
    pub fn new(total: usize) -> Self {
        Self { synced: 0, total }
    }

    /// Record `n` more handled messages. Never exceeds `total`.
    pub fn advance(&mut self, n: usize) -> Self {
        self.synced = (self.synced + n).min(self.total);
        *self
    }

    /// Whether every message has been handled.
    pub fn is_complete(&self) -> bool {
        self.synced >= self.total
    }
}
