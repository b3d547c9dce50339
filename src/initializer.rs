//! Consistent start-up: queue depth snapshot plus announcement subscription.
//!
//! The pending set is watched, its cardinality queued inside a transaction,
//! the announcement channel subscribed, and the transaction committed. A
//! producer touching the set in between aborts the commit and the whole
//! sequence is retried under the configured [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::commands;
use crate::error::{Error, Result};
use crate::naming::TableNaming;
use crate::transport::{SubscriptionKind, Transport};
use crate::types::{ToArg, Value};

/// How often an aborted transaction is retried.
///
/// The default retries forever without pausing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, 0 for unbounded.
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Retry forever with no pause.
    pub const fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            backoff_ms: 0,
        }
    }

    /// Give up after `max_attempts` attempts.
    pub const fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_ms: 0,
        }
    }

    /// Pause `backoff` between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Returns true if another attempt may follow `attempts` failed ones.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Pause between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Establishes the queue depth snapshot and the announcement subscription.
#[derive(Debug, Clone)]
pub struct TransactionalInitializer {
    key_set: String,
    channel: String,
    policy: RetryPolicy,
}

impl TransactionalInitializer {
    /// Create an initializer for `naming`'s pending set and channel.
    pub fn new(naming: &TableNaming, policy: RetryPolicy) -> Self {
        Self {
            key_set: naming.key_set(),
            channel: naming.channel(),
            policy,
        }
    }

    /// Run the watch/count/subscribe/commit sequence until it commits.
    ///
    /// Commands run on `conn`. The subscription is made on `subscription`
    /// during the first attempt and stays active across retries. Returns the
    /// committed cardinality of the pending set.
    pub async fn run<C, S>(&self, conn: &mut C, subscription: &mut S) -> Result<i64>
    where
        C: Transport + ?Sized,
        S: Transport + ?Sized,
    {
        let mut subscribed = false;
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            if let Some(depth) = self.attempt(conn, subscription, &mut subscribed).await? {
                debug!(key_set = %self.key_set, depth, attempts, "queue depth captured");
                return Ok(depth);
            }

            if !self.policy.allows(attempts) {
                warn!(key_set = %self.key_set, attempts, "pending set kept changing, giving up");
                return Err(Error::RetriesExhausted { attempts });
            }
            debug!(key_set = %self.key_set, attempt = attempts, "transaction aborted, retrying");
            let backoff = self.policy.backoff();
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
        }
    }

    /// One round; `None` means a concurrent write aborted the commit.
    async fn attempt<C, S>(
        &self,
        conn: &mut C,
        subscription: &mut S,
        subscribed: &mut bool,
    ) -> Result<Option<i64>>
    where
        C: Transport + ?Sized,
        S: Transport + ?Sized,
    {
        commands::watch(conn, &self.key_set).await?;
        commands::multi(conn).await?;

        if let Err(e) = self.queue_and_subscribe(conn, subscription, subscribed).await {
            if let Err(discard) = commands::discard(conn).await {
                debug!(error = %discard, "DISCARD after failed transaction setup");
            }
            return Err(e);
        }

        match commands::exec_transaction(conn).await? {
            None => Ok(None),
            Some(replies) => depth_from_replies(replies).map(Some),
        }
    }

    async fn queue_and_subscribe<C, S>(
        &self,
        conn: &mut C,
        subscription: &mut S,
        subscribed: &mut bool,
    ) -> Result<()>
    where
        C: Transport + ?Sized,
        S: Transport + ?Sized,
    {
        commands::enqueue(conn, commands::scard_args(&self.key_set)).await?;
        if !*subscribed {
            subscription
                .subscribe(SubscriptionKind::Channel, self.channel.to_arg())
                .await?;
            *subscribed = true;
        }
        Ok(())
    }
}

fn depth_from_replies(replies: Vec<Value>) -> Result<i64> {
    let mut iter = replies.into_iter();
    match (iter.next(), iter.next()) {
        (Some(Value::Integer(depth)), None) => Ok(depth),
        (Some(Value::Error(msg)), None) => Err(Error::Server(msg)),
        (first, _) => Err(Error::Protocol(format!(
            "EXEC reply is not a single count: {:?}",
            first
        ))),
    }
}
