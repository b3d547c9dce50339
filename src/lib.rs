//! # ferrite-changefeed: change-feed consumers for Ferrite and Redis
//!
//! Producers write a row as a hash under `<table>:<key>`, add the key to the
//! table's pending set `<table>_KEY_SET` and publish on `<table>_CHANNEL`.
//! This crate is the consuming side. It turns pending work into
//! [`ChangeRecord`]s: `(key, SET, fields)` for a row that exists and
//! `(key, DEL, [])` for one that is gone.
//!
//! ## Consumers
//!
//! - [`ConsumerStateTable`] drains the pending set. At start-up it captures
//!   the queue depth and subscribes to the announcement channel inside one
//!   optimistic transaction; afterwards it claims keys in atomic batches via
//!   a server-side script, so no key is ever handed to two consumers.
//! - [`ConsumerKeySpaceTable`] follows keyspace notifications instead and
//!   reads each row when the event is processed. It is weaker: events that
//!   fire before it subscribes are never seen.
//!
//! Neither consumer waits for work. `pop()` returns the empty record when
//! nothing is available; the caller decides when to try again, typically
//! after [`Connection::readable`] fires.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ferrite_changefeed::{ConnectionConfig, ConsumerConfig, ConsumerStateTable};
//!
//! #[tokio::main]
//! async fn main() -> ferrite_changefeed::Result<()> {
//!     let connection = ConnectionConfig::from_addr("127.0.0.1", 6379);
//!     let consumer = ConsumerConfig::new("PORT");
//!     let mut table = ConsumerStateTable::connect(&connection, &consumer).await?;
//!
//!     loop {
//!         let record = table.pop().await?;
//!         if record.is_empty() {
//!             break;
//!         }
//!         println!("{} {:?} {:?}", record.key, record.op, record.fields);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## In-process store
//!
//! [`transport::memory::MemoryStore`] implements the same command surface in
//! memory, including the batch claim script, and is what the test suite
//! runs against.

pub mod batch;
pub mod buffer;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod initializer;
pub mod keyspace;
pub mod logging;
pub mod naming;
pub mod pending;
pub mod record;
pub mod resp;
pub mod row;
pub mod script;
pub mod transport;
pub mod types;

// ── Re-exports for ergonomic top-level usage ────────────────────────────────

pub use batch::BatchScriptRunner;
pub use buffer::{BatchSource, PopBuffer};
pub use config::{Config, ConsumerConfig, LogFormat, LoggingConfig, DEFAULT_POP_BATCH_SIZE};
pub use connection::{Connection, ConnectionConfig, Protocol};
pub use error::{Error, Result};
pub use initializer::{RetryPolicy, TransactionalInitializer};
pub use keyspace::{ConsumerKeySpaceTable, NotificationStreamConsumer};
pub use naming::TableNaming;
pub use pending::{ConsumerStateTable, PendingQueueConsumer};
pub use record::{ChangeRecord, FieldValue, Op};
pub use script::{Script, ScriptRegistry};
pub use transport::{SubscriptionKind, Transport};
pub use types::{ToArg, Value};
