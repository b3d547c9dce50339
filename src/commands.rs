//! Typed helpers for the commands the consumers issue.
//!
//! Each helper builds the argument vector, runs it on any [`Transport`] and
//! checks the reply shape, so callers deal in Rust types instead of raw
//! [`Value`]s.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::{ToArg, Value};

/// Helper to run a prepared argument vector.
pub(crate) async fn exec<T: Transport + ?Sized>(conn: &mut T, args: Vec<Bytes>) -> Result<Value> {
    conn.execute(args).await
}

/// Helper to create a Bytes arg from anything that implements ToArg.
#[inline]
pub(crate) fn arg<A: ToArg>(val: A) -> Bytes {
    val.to_arg()
}

fn expect_status(reply: Value, status: &'static str) -> Result<()> {
    match reply {
        Value::Status(ref s) if s == status => Ok(()),
        other => Err(Error::unexpected(status, other)),
    }
}

/// WATCH key: abort the next EXEC if `key` changes.
pub async fn watch<T: Transport + ?Sized>(conn: &mut T, key: impl ToArg) -> Result<()> {
    let reply = exec(conn, vec![Bytes::from("WATCH"), arg(key)]).await?;
    expect_status(reply, "OK")
}

/// UNWATCH: forget all watched keys.
pub async fn unwatch<T: Transport + ?Sized>(conn: &mut T) -> Result<()> {
    let reply = exec(conn, vec![Bytes::from("UNWATCH")]).await?;
    expect_status(reply, "OK")
}

/// MULTI: start queueing commands.
pub async fn multi<T: Transport + ?Sized>(conn: &mut T) -> Result<()> {
    let reply = exec(conn, vec![Bytes::from("MULTI")]).await?;
    expect_status(reply, "OK")
}

/// Queue a command inside MULTI; the server must answer `QUEUED`.
pub async fn enqueue<T: Transport + ?Sized>(conn: &mut T, args: Vec<Bytes>) -> Result<()> {
    let reply = exec(conn, args).await?;
    expect_status(reply, "QUEUED")
}

/// EXEC: run the queued commands.
///
/// Returns `None` when a watched key changed and the transaction was aborted.
pub async fn exec_transaction<T: Transport + ?Sized>(conn: &mut T) -> Result<Option<Vec<Value>>> {
    match exec(conn, vec![Bytes::from("EXEC")]).await? {
        Value::Nil => Ok(None),
        Value::Array(replies) => Ok(Some(replies)),
        other => Err(Error::unexpected("array or nil", other.type_name())),
    }
}

/// DISCARD: drop the queued commands.
pub async fn discard<T: Transport + ?Sized>(conn: &mut T) -> Result<()> {
    let reply = exec(conn, vec![Bytes::from("DISCARD")]).await?;
    expect_status(reply, "OK")
}

/// The SCARD command as queued inside a transaction.
pub fn scard_args(key: impl ToArg) -> Vec<Bytes> {
    vec![Bytes::from("SCARD"), arg(key)]
}

/// SCARD key: get the number of members in a set.
pub async fn scard<T: Transport + ?Sized>(conn: &mut T, key: impl ToArg) -> Result<i64> {
    exec(conn, scard_args(key)).await?.into_integer()
}

/// SCRIPT LOAD script: register a script and return its handle.
pub async fn script_load<T: Transport + ?Sized>(conn: &mut T, source: &str) -> Result<String> {
    exec(conn, vec![Bytes::from("SCRIPT"), Bytes::from("LOAD"), arg(source)])
        .await?
        .into_string()
}

/// EVALSHA sha numkeys key [key ...] arg [arg ...]: run a registered script.
pub async fn evalsha<T: Transport + ?Sized>(
    conn: &mut T,
    sha: &str,
    keys: &[Bytes],
    args: &[Bytes],
) -> Result<Value> {
    let mut cmd = Vec::with_capacity(3 + keys.len() + args.len());
    cmd.push(Bytes::from("EVALSHA"));
    cmd.push(arg(sha));
    cmd.push(arg(keys.len()));
    cmd.extend(keys.iter().cloned());
    cmd.extend(args.iter().cloned());
    exec(conn, cmd).await
}

/// HGETALL key: get all fields and values in a hash, flattened.
///
/// RESP3 servers answer with a map; it is flattened in wire order so both
/// protocol versions yield `[field, value, field, value, ...]`.
pub async fn hgetall<T: Transport + ?Sized>(conn: &mut T, key: impl ToArg) -> Result<Vec<Value>> {
    match exec(conn, vec![Bytes::from("HGETALL"), arg(key)]).await? {
        Value::Map(entries) => Ok(entries
            .into_iter()
            .flat_map(|(field, value)| [field, value])
            .collect()),
        other => other.into_array(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryStore;

    #[tokio::test]
    async fn test_transaction_round_trip() {
        let store = MemoryStore::new();
        store.sadd("S", &["a", "b"]);
        let mut conn = store.connect();

        watch(&mut conn, "S").await.unwrap();
        multi(&mut conn).await.unwrap();
        enqueue(&mut conn, scard_args("S")).await.unwrap();
        let replies = exec_transaction(&mut conn).await.unwrap().unwrap();
        assert_eq!(replies, vec![Value::Integer(2)]);
    }

    #[tokio::test]
    async fn test_exec_aborts_when_watched_key_changes() {
        let store = MemoryStore::new();
        let mut conn = store.connect();

        watch(&mut conn, "S").await.unwrap();
        store.sadd("S", &["late"]);
        multi(&mut conn).await.unwrap();
        enqueue(&mut conn, scard_args("S")).await.unwrap();
        assert!(exec_transaction(&mut conn).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discard_and_unwatch() {
        let store = MemoryStore::new();
        let mut conn = store.connect();

        watch(&mut conn, "S").await.unwrap();
        unwatch(&mut conn).await.unwrap();
        store.sadd("S", &["x"]);
        multi(&mut conn).await.unwrap();
        enqueue(&mut conn, scard_args("S")).await.unwrap();
        discard(&mut conn).await.unwrap();
        assert_eq!(scard(&mut conn, "S").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hgetall_flattens() {
        let store = MemoryStore::new();
        store.hset("T:k", &[("f1", "v1"), ("f2", "v2")]);
        let mut conn = store.connect();
        let flat = hgetall(&mut conn, "T:k").await.unwrap();
        assert_eq!(
            flat,
            vec![
                Value::from("f1"),
                Value::from("v1"),
                Value::from("f2"),
                Value::from("v2"),
            ]
        );
        assert!(hgetall(&mut conn, "T:missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evalsha_unknown_handle() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let err = evalsha(&mut conn, "deadbeef", &[], &[]).await.unwrap_err();
        assert!(err.is_noscript());
    }
}
