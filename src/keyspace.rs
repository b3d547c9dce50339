//! Keyspace-notification consumer.
//!
//! Instead of claiming a pending set, [`ConsumerKeySpaceTable`] listens to
//! the store's keyspace notifications for every row of a table and rebuilds
//! change records from them. A `del` event becomes a deletion without a
//! lookup; any other event triggers a read of the row as it is *now*, so a
//! record may reflect writes newer than the event that produced it.
//!
//! Only events that arrive after construction are observed.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::buffer::{BatchSource, PopBuffer};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::Result;
use crate::naming::{split_keyspace_key, TableNaming};
use crate::record::{ChangeRecord, Op};
use crate::row;
use crate::transport::{SubscriptionKind, Transport};
use crate::types::{ToArg, Value};

/// Event name that denotes a deleted row.
const DEL_EVENT: &str = "del";

struct KeyspaceSource<T> {
    conn: T,
    subscription: T,
    pattern: String,
}

impl<T: Transport> KeyspaceSource<T> {
    /// Turn one notification into a record, or `None` if it is dropped.
    async fn decode(&mut self, push: Value) -> Result<Option<ChangeRecord>> {
        let parts = match push.into_message_parts() {
            Some(parts) => parts,
            None => {
                error!(pattern = %self.pattern, "notification is not a message");
                return Ok(None);
            }
        };
        let [_kind, pattern, raw_key, event]: [Value; 4] = match parts.try_into() {
            Ok(parts) => parts,
            Err(parts) => {
                error!(
                    pattern = %self.pattern,
                    parts = parts.len(),
                    "notification does not have 4 parts"
                );
                return Ok(None);
            }
        };

        if pattern.as_str() != Some(self.pattern.as_str()) {
            error!(expected = %self.pattern, actual = %pattern, "notification pattern mismatch");
            return Ok(None);
        }
        let (raw_key, event) = match (raw_key.as_str(), event.as_str()) {
            (Some(raw_key), Some(event)) => (raw_key, event),
            _ => {
                error!(pattern = %self.pattern, "notification key or event is not UTF-8");
                return Ok(None);
            }
        };
        let parsed = match split_keyspace_key(raw_key) {
            Some(parsed) => parsed,
            None => {
                error!(key = raw_key, "cannot split notification key");
                return Ok(None);
            }
        };

        if event == DEL_EVENT {
            return Ok(Some(ChangeRecord::deleted(parsed.key)));
        }
        match row::get(&mut self.conn, parsed.row_key).await? {
            Some(fields) => Ok(Some(ChangeRecord {
                key: parsed.key.to_string(),
                op: Some(Op::Set),
                fields,
            })),
            None => {
                warn!(key = parsed.row_key, event, "row gone before it could be read");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl<T: Transport> BatchSource for KeyspaceSource<T> {
    async fn pops(&mut self, out: &mut VecDeque<ChangeRecord>) -> Result<()> {
        out.clear();
        while let Some(push) = self.subscription.try_next_push()? {
            if let Some(record) = self.decode(push).await? {
                out.push_back(record);
            }
        }
        if !out.is_empty() {
            debug!(pattern = %self.pattern, records = out.len(), "notifications decoded");
        }
        Ok(())
    }
}

/// Consumer rebuilding change records from keyspace notifications.
///
/// `conn` reads rows; `subscription` receives the notifications.
pub struct ConsumerKeySpaceTable<T: Transport> {
    naming: TableNaming,
    source: KeyspaceSource<T>,
    buffer: PopBuffer,
}

/// The keyspace-notification consumer under its descriptive name.
pub type NotificationStreamConsumer<T> = ConsumerKeySpaceTable<T>;

impl<T: Transport> ConsumerKeySpaceTable<T> {
    /// Subscribe to `__keyspace@<db>__:<table>:*` on `subscription`.
    ///
    /// The database index is the one `subscription` has selected.
    pub async fn new(conn: T, mut subscription: T, table: &str) -> Result<Self> {
        let naming = TableNaming::new(table)?;
        let pattern = naming.keyspace_pattern(subscription.database());
        subscription
            .subscribe(SubscriptionKind::Pattern, pattern.to_arg())
            .await?;
        debug!(table = naming.table(), pattern = %pattern, "keyspace consumer subscribed");

        Ok(Self {
            naming,
            source: KeyspaceSource {
                conn,
                subscription,
                pattern,
            },
            buffer: PopBuffer::new(),
        })
    }

    /// Return the next record, or the empty record when no event is queued.
    pub async fn pop(&mut self) -> Result<ChangeRecord> {
        self.buffer.pop(&mut self.source).await
    }

    /// Decode every queued notification into `out`, replacing its contents.
    ///
    /// If reading a row fails, the error is returned and the notification
    /// that caused it is dropped. `out` keeps the records decoded before it;
    /// later notifications stay queued for the next call.
    pub async fn pops(&mut self, out: &mut VecDeque<ChangeRecord>) -> Result<()> {
        self.source.pops(out).await
    }

    /// Always 0: there is no backlog in this mode.
    pub fn queue_depth(&self) -> i64 {
        0
    }

    /// Returns true if records are buffered and `pop` will not hit the store.
    pub fn has_cached_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// The subscribed notification pattern.
    pub fn pattern(&self) -> &str {
        &self.source.pattern
    }

    /// Naming policy of the consumed table.
    pub fn naming(&self) -> &TableNaming {
        &self.naming
    }
}

impl ConsumerKeySpaceTable<Connection> {
    /// Open the command and subscription connections and subscribe.
    pub async fn connect(connection: &ConnectionConfig, table: &str) -> Result<Self> {
        let conn = Connection::connect(connection).await?;
        let subscription = Connection::connect(connection).await?;
        Self::new(conn, subscription, table).await
    }
}
