//! The seam between the consumers and the backing store.
//!
//! A [`Transport`] is one logical connection: it runs commands and hands
//! back their replies, and it buffers any server push messages (pub/sub
//! deliveries) that arrive on the same socket so they can be drained later
//! without blocking. [`crate::connection::Connection`] talks RESP over TCP;
//! [`memory::MemoryTransport`] runs against an in-process store.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::Value;

/// Kind of pub/sub subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Exact channel name (`SUBSCRIBE`).
    Channel,
    /// Glob pattern over channel names (`PSUBSCRIBE`).
    Pattern,
}

impl SubscriptionKind {
    /// The command that creates this subscription.
    pub fn command(&self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    /// The first element of the server's confirmation message.
    pub fn confirmation(&self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "subscribe",
            SubscriptionKind::Pattern => "psubscribe",
        }
    }
}

/// Message kinds delivered for an active subscription.
pub(crate) const MESSAGE_KINDS: [&str; 3] = ["message", "pmessage", "smessage"];

/// One logical connection to the store.
#[async_trait]
pub trait Transport: Send {
    /// Send a command and wait for its reply.
    ///
    /// Push messages received before the reply are queued for
    /// [`try_next_push`](Transport::try_next_push). A top-level error reply
    /// is returned as [`crate::Error::Server`].
    async fn execute(&mut self, args: Vec<Bytes>) -> Result<Value>;

    /// Activate a subscription and wait for the server to confirm it.
    async fn subscribe(&mut self, kind: SubscriptionKind, channel: Bytes) -> Result<()>;

    /// Return the next push message if one is already available.
    ///
    /// Never waits: `Ok(None)` means nothing has arrived yet.
    fn try_next_push(&mut self) -> Result<Option<Value>>;

    /// Index of the database this connection has selected.
    fn database(&self) -> u8;
}
