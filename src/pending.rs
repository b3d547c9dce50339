//! Pending-queue consumer.
//!
//! Producers write a row, add its key to the table's pending set and publish
//! on the announcement channel. [`ConsumerStateTable`] captures the queue
//! depth and subscribes at start-up, then claims pending keys in atomic
//! batches and hands the resulting records out one at a time.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use crate::batch::BatchScriptRunner;
use crate::buffer::{BatchSource, PopBuffer};
use crate::config::ConsumerConfig;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::Result;
use crate::initializer::TransactionalInitializer;
use crate::naming::TableNaming;
use crate::record::ChangeRecord;
use crate::transport::{Transport, MESSAGE_KINDS};

/// Command connection plus the batch claim it runs.
struct PendingSource<T> {
    conn: T,
    runner: BatchScriptRunner,
}

#[async_trait]
impl<T: Transport> BatchSource for PendingSource<T> {
    async fn pops(&mut self, out: &mut VecDeque<ChangeRecord>) -> Result<()> {
        self.runner.run(&mut self.conn, out).await
    }
}

/// Consumer draining a table's pending set.
///
/// Holds two connections: `conn` runs commands and the batch claim,
/// `subscription` carries announcement messages. Neither [`pop`](Self::pop)
/// nor [`pops`](Self::pops) waits for new work; an empty result means the
/// pending set was empty when claimed.
pub struct ConsumerStateTable<T: Transport> {
    naming: TableNaming,
    source: PendingSource<T>,
    subscription: T,
    buffer: PopBuffer,
    queue_depth: i64,
}

/// The pending-queue consumer under its descriptive name.
pub type PendingQueueConsumer<T> = ConsumerStateTable<T>;

impl<T: Transport> ConsumerStateTable<T> {
    /// Initialize a consumer: capture the queue depth and subscribe to the
    /// announcement channel, retrying per `config.retry` while producers
    /// race the transaction.
    pub async fn new(mut conn: T, mut subscription: T, config: &ConsumerConfig) -> Result<Self> {
        let naming = TableNaming::new(config.table.as_str())?;
        let runner = BatchScriptRunner::new(&naming, config.pop_batch_size)?;
        let initializer = TransactionalInitializer::new(&naming, config.retry);
        let queue_depth = initializer.run(&mut conn, &mut subscription).await?;

        info!(
            table = naming.table(),
            queue_depth,
            batch_size = config.pop_batch_size,
            "pending-queue consumer ready"
        );
        Ok(Self {
            naming,
            source: PendingSource { conn, runner },
            subscription,
            buffer: PopBuffer::new(),
            queue_depth,
        })
    }

    /// Return the next record, or the empty record when nothing is pending.
    pub async fn pop(&mut self) -> Result<ChangeRecord> {
        self.buffer.pop(&mut self.source).await
    }

    /// Claim one batch directly into `out`, replacing its contents.
    ///
    /// Records already buffered for [`pop`](Self::pop) are not included.
    pub async fn pops(&mut self, out: &mut VecDeque<ChangeRecord>) -> Result<()> {
        self.source.pops(out).await
    }

    /// Pending-set size captured at start-up. Not updated by later pops.
    pub fn queue_depth(&self) -> i64 {
        self.queue_depth
    }

    /// Returns true if work was pending when the consumer started.
    pub fn initialized_with_data(&self) -> bool {
        self.queue_depth > 0
    }

    /// Returns true if records are buffered and `pop` will not hit the store.
    pub fn has_cached_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Consume announcement messages that have already arrived.
    ///
    /// Returns how many announcements were seen; a positive count means a
    /// producer enqueued work since the last drain. Never waits.
    pub fn drain_announcements(&mut self) -> Result<usize> {
        let mut seen = 0;
        while let Some(push) = self.subscription.try_next_push()? {
            let kind = push
                .into_message_parts()
                .and_then(|parts| parts.into_iter().next())
                .and_then(|kind| kind.into_string().ok());
            match kind {
                Some(kind) if MESSAGE_KINDS.contains(&kind.as_str()) => seen += 1,
                other => trace!(kind = ?other, "ignoring non-message push"),
            }
        }
        if seen > 0 {
            debug!(table = self.naming.table(), seen, "announcements drained");
        }
        Ok(seen)
    }

    /// Naming policy of the consumed table.
    pub fn naming(&self) -> &TableNaming {
        &self.naming
    }

    /// Name of the consumed table.
    pub fn table_name(&self) -> &str {
        self.naming.table()
    }

    /// Batch size used when refilling.
    pub fn pop_batch_size(&self) -> usize {
        self.source.runner.batch_size()
    }
}

impl ConsumerStateTable<Connection> {
    /// Open the command and subscription connections and initialize.
    pub async fn connect(connection: &ConnectionConfig, consumer: &ConsumerConfig) -> Result<Self> {
        let conn = Connection::connect(connection).await?;
        let subscription = Connection::connect(connection).await?;
        Self::new(conn, subscription, consumer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Op;
    use crate::transport::memory::{MemoryStore, MemoryTransport};

    async fn consumer(store: &MemoryStore, batch: usize) -> ConsumerStateTable<MemoryTransport> {
        let config = ConsumerConfig::new("T").with_pop_batch_size(batch);
        ConsumerStateTable::new(store.connect(), store.connect(), &config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_queue_depth_snapshot() {
        let store = MemoryStore::new();
        store.sadd("T_KEY_SET", &["a", "b"]);
        let mut table = consumer(&store, 10).await;
        assert_eq!(table.queue_depth(), 2);
        assert!(table.initialized_with_data());

        table.pop().await.unwrap();
        assert_eq!(table.queue_depth(), 2);
    }

    #[tokio::test]
    async fn test_pop_uses_buffer() {
        let store = MemoryStore::new();
        store.sadd("T_KEY_SET", &["a", "b", "c"]);
        store.hset("T:a", &[("f", "1")]);
        let mut table = consumer(&store, 2).await;

        let first = table.pop().await.unwrap();
        assert_eq!((first.key.as_str(), first.op), ("a", Some(Op::Set)));
        assert!(table.has_cached_data());
        assert_eq!(store.scard("T_KEY_SET"), 1);

        assert_eq!(table.pop().await.unwrap(), ChangeRecord::deleted("b"));
        assert!(!table.has_cached_data());
        assert_eq!(table.pop().await.unwrap(), ChangeRecord::deleted("c"));
        assert!(table.pop().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_announcements() {
        let store = MemoryStore::new();
        let mut table = consumer(&store, 10).await;
        assert!(!table.initialized_with_data());
        assert_eq!(table.drain_announcements().unwrap(), 0);

        store.publish("T_CHANNEL", "G");
        store.publish("T_CHANNEL", "G");
        store.publish("OTHER_CHANNEL", "G");
        assert_eq!(table.drain_announcements().unwrap(), 2);
        assert_eq!(table.drain_announcements().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_config() {
        let store = MemoryStore::new();
        let bad_table = ConsumerConfig::new("A:B");
        assert!(ConsumerStateTable::new(store.connect(), store.connect(), &bad_table)
            .await
            .is_err());

        let zero = ConsumerConfig::new("T").with_pop_batch_size(0);
        assert!(ConsumerStateTable::new(store.connect(), store.connect(), &zero)
            .await
            .is_err());
    }
}
