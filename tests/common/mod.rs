//! Shared test utilities for the change-feed integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::collections::VecDeque;

use ferrite_changefeed::transport::memory::{MemoryStore, MemoryTransport};
use ferrite_changefeed::{
    ChangeRecord, ConsumerConfig, ConsumerKeySpaceTable, ConsumerStateTable, RetryPolicy,
};

// ============================================================================
// Producer helpers
// ============================================================================

/// Write a row and enqueue its key the way a producer does.
///
/// An empty `fields` slice deletes the row instead.
#[allow(dead_code)]
pub fn produce(store: &MemoryStore, table: &str, key: &str, fields: &[(&str, &str)]) {
    let row = format!("{}:{}", table, key);
    if fields.is_empty() {
        store.del(&row);
    } else {
        store.hset(&row, fields);
    }
    store.sadd(&format!("{}_KEY_SET", table), &[key]);
    store.publish(&format!("{}_CHANNEL", table), "G");
}

/// Cardinality of the table's pending set.
#[allow(dead_code)]
pub fn pending(store: &MemoryStore, table: &str) -> usize {
    store.scard(&format!("{}_KEY_SET", table))
}

// ============================================================================
// Consumer helpers
// ============================================================================

/// Create a pending-queue consumer with the given batch size.
#[allow(dead_code)]
pub async fn state_table(
    store: &MemoryStore,
    table: &str,
    batch: usize,
) -> ConsumerStateTable<MemoryTransport> {
    let config = ConsumerConfig::new(table)
        .with_pop_batch_size(batch)
        .with_retry(RetryPolicy::unbounded());
    ConsumerStateTable::new(store.connect(), store.connect(), &config)
        .await
        .expect("consumer should initialize")
}

/// Create a keyspace consumer.
#[allow(dead_code)]
pub async fn keyspace_table(store: &MemoryStore, table: &str) -> ConsumerKeySpaceTable<MemoryTransport> {
    ConsumerKeySpaceTable::new(store.connect(), store.connect(), table)
        .await
        .expect("keyspace consumer should subscribe")
}

/// Pop until the empty record comes back.
#[allow(dead_code)]
pub async fn drain(table: &mut ConsumerStateTable<MemoryTransport>) -> Vec<ChangeRecord> {
    let mut records = Vec::new();
    loop {
        let record = table.pop().await.expect("pop should succeed");
        if record.is_empty() {
            return records;
        }
        records.push(record);
    }
}

/// Call `pops` until a batch comes back empty, concatenating the batches.
#[allow(dead_code)]
pub async fn drain_batches(table: &mut ConsumerStateTable<MemoryTransport>) -> Vec<ChangeRecord> {
    let mut records = Vec::new();
    let mut batch = VecDeque::new();
    loop {
        table.pops(&mut batch).await.expect("pops should succeed");
        if batch.is_empty() {
            return records;
        }
        records.extend(batch.drain(..));
    }
}

/// Build a record the way a consumer would.
#[allow(dead_code)]
pub fn record(key: &str, fields: &[(&str, &str)]) -> ChangeRecord {
    ChangeRecord::from_snapshot(
        key,
        fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect(),
    )
}

/// Sort records by key, for comparisons where claim order is unspecified.
#[allow(dead_code)]
pub fn sorted(mut records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    records.sort_by(|a, b| a.key.cmp(&b.key));
    records
}

/// A current-thread runtime for driving async code from proptest bodies.
#[allow(dead_code)]
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime should build")
}
