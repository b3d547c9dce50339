//! Single-item pop over a batch primitive.
//!
//! Both consumers hand out records one at a time while fetching them in
//! batches. [`PopBuffer`] is the shared FIFO adapter: it only refills when
//! it runs dry and never waits for new data.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::ChangeRecord;

/// Anything that can fetch a batch of change records.
#[async_trait]
pub trait BatchSource: Send {
    /// Replace the contents of `out` with the next batch.
    ///
    /// `out` is cleared first; leaving it empty means nothing is available.
    async fn pops(&mut self, out: &mut VecDeque<ChangeRecord>) -> Result<()>;
}

/// FIFO of records fetched ahead of the caller.
#[derive(Debug, Default)]
pub struct PopBuffer {
    records: VecDeque<ChangeRecord>,
}

impl PopBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next record, refilling from `source` when empty.
    ///
    /// Yields the empty [`ChangeRecord`] when the source has nothing either.
    pub async fn pop<S: BatchSource + ?Sized>(&mut self, source: &mut S) -> Result<ChangeRecord> {
        if self.records.is_empty() {
            source.pops(&mut self.records).await?;
        }
        Ok(self.records.pop_front().unwrap_or_default())
    }

    /// Number of records waiting.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no records are waiting.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
