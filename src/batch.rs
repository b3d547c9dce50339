//! Atomic batch claim of pending keys.
//!
//! The claim runs as one server-side script: pop up to `N` members of the
//! pending set, read each row, delete it and return `(key, fields)` pairs.
//! Running it server-side keeps the whole batch indivisible with respect to
//! producers and other consumers.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::commands;
use crate::error::{Error, Result};
use crate::naming::TableNaming;
use crate::record::{ChangeRecord, FieldValue};
use crate::script::{Script, ScriptRegistry};
use crate::transport::Transport;
use crate::types::{ToArg, Value};

/// Lua source of the batch claim.
///
/// `KEYS[1]` is the pending set, `KEYS[2]` the row prefix and `ARGV[1]` the
/// batch size. Returns `false` (nil) when the set is empty.
pub const BATCH_POP_SCRIPT: &str = r#"local ret = {}
local keys = redis.call('SPOP', KEYS[1], ARGV[1])
local n = #keys
if n == 0 then
    return false
end
for i = 1, n do
    local key = keys[i]
    local row = KEYS[2] .. key
    local values = redis.call('HGETALL', row)
    redis.call('DEL', row)
    table.insert(ret, {key, values})
end
return ret
"#;

/// The batch claim as a registrable script.
pub const BATCH_POP: Script = Script::new("consumer_state_table_pops", BATCH_POP_SCRIPT);

/// Runs the batch claim for one table.
#[derive(Debug, Clone)]
pub struct BatchScriptRunner {
    key_set: Bytes,
    row_prefix: Bytes,
    batch_size: usize,
    registry: &'static ScriptRegistry,
}

impl BatchScriptRunner {
    /// Create a runner claiming up to `batch_size` keys per call.
    pub fn new(naming: &TableNaming, batch_size: usize) -> Result<Self> {
        Self::with_registry(naming, batch_size, ScriptRegistry::global())
    }

    /// Like [`new`](Self::new) but with an explicit handle registry.
    pub fn with_registry(
        naming: &TableNaming,
        batch_size: usize,
        registry: &'static ScriptRegistry,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidArgument("batch size must be positive".into()));
        }
        Ok(Self {
            key_set: naming.key_set().to_arg(),
            row_prefix: naming.row_prefix().to_arg(),
            batch_size,
            registry,
        })
    }

    /// Maximum number of keys claimed per call.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Claim a batch and replace the contents of `out` with its records.
    ///
    /// `out` is left empty when nothing was pending. If the server forgot the
    /// script handle it is registered again and the call retried once.
    pub async fn run<T: Transport + ?Sized>(
        &self,
        conn: &mut T,
        out: &mut VecDeque<ChangeRecord>,
    ) -> Result<()> {
        out.clear();
        let reply = match self.invoke(conn, false).await {
            Err(e) if e.is_noscript() => {
                warn!(script = BATCH_POP.name(), "script handle unknown to server, reloading");
                self.registry.invalidate(&BATCH_POP);
                self.invoke(conn, true).await?
            }
            other => other?,
        };
        parse_batch_reply(reply, out)?;
        debug!(claimed = out.len(), batch_size = self.batch_size, "batch claimed");
        Ok(())
    }

    async fn invoke<T: Transport + ?Sized>(&self, conn: &mut T, reload: bool) -> Result<Value> {
        let sha = if reload {
            self.registry.reload(conn, &BATCH_POP).await?
        } else {
            self.registry.load(conn, &BATCH_POP).await?
        };
        let keys = [self.key_set.clone(), self.row_prefix.clone()];
        let args = [self.batch_size.to_arg()];
        commands::evalsha(conn, &sha, &keys, &args).await
    }
}

/// Decode the script reply into change records appended to `out`.
///
/// Accepts nil (or an empty array) for "nothing pending" and otherwise an
/// array of `[key, [field, value, ...]]` pairs. Anything else is a protocol
/// violation.
pub fn parse_batch_reply(reply: Value, out: &mut VecDeque<ChangeRecord>) -> Result<()> {
    let items = match reply {
        Value::Nil | Value::Boolean(false) => return Ok(()),
        Value::Array(items) => items,
        other => {
            return Err(Error::Protocol(format!(
                "batch claim returned {}, expected array or nil",
                other.type_name()
            )))
        }
    };

    out.reserve(items.len());
    for item in items {
        let mut pair = match item {
            Value::Array(pair) if pair.len() == 2 => pair,
            other => {
                return Err(Error::Protocol(format!(
                    "batch claim entry is not a [key, fields] pair: {}",
                    other
                )))
            }
        };
        let fields = pair.pop().unwrap_or(Value::Nil);
        let key = match pair.pop() {
            Some(v @ Value::String(_)) => v.into_string()?,
            other => {
                return Err(Error::Protocol(format!(
                    "batch claim key is not a string: {:?}",
                    other
                )))
            }
        };
        let fields = match fields {
            Value::Array(flat) => pair_fields(flat)?,
            other => {
                return Err(Error::Protocol(format!(
                    "batch claim fields for {:?} are not an array: {}",
                    key, other
                )))
            }
        };
        out.push_back(ChangeRecord::from_snapshot(key, fields));
    }
    Ok(())
}

/// Group a flat `[field, value, ...]` list into pairs.
///
/// An odd element count means a field without a value and is rejected.
pub(crate) fn pair_fields(flat: Vec<Value>) -> Result<Vec<FieldValue>> {
    if flat.len() % 2 != 0 {
        return Err(Error::Protocol(format!(
            "field list has odd length {}",
            flat.len()
        )));
    }
    let mut fields = Vec::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        fields.push((field.into_string()?, value.into_string()?));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Op;

    fn entry(key: &str, fields: &[&str]) -> Value {
        Value::Array(vec![
            Value::from(key),
            Value::Array(fields.iter().map(|f| Value::from(*f)).collect()),
        ])
    }

    #[test]
    fn test_parse_nil_is_empty() {
        let mut out = VecDeque::new();
        parse_batch_reply(Value::Nil, &mut out).unwrap();
        assert!(out.is_empty());
        parse_batch_reply(Value::Array(vec![]), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_parse_entries() {
        let reply = Value::Array(vec![
            entry("a", &["f1", "v1"]),
            entry("b", &[]),
            entry("c", &["f2", "v2", "f3", "v3"]),
        ]);
        let mut out = VecDeque::new();
        parse_batch_reply(reply, &mut out).unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].key, "a");
        assert_eq!(out[0].op, Some(Op::Set));
        assert_eq!(out[1], ChangeRecord::deleted("b"));
        assert_eq!(
            out[2].fields,
            vec![("f2".into(), "v2".into()), ("f3".into(), "v3".into())]
        );
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        let mut out = VecDeque::new();
        assert!(parse_batch_reply(Value::Integer(1), &mut out).unwrap_err().is_fatal());

        let short = Value::Array(vec![Value::Array(vec![Value::from("a")])]);
        assert!(parse_batch_reply(short, &mut out).is_err());

        let bad_key = Value::Array(vec![Value::Array(vec![
            Value::Integer(7),
            Value::Array(vec![]),
        ])]);
        assert!(parse_batch_reply(bad_key, &mut out).is_err());

        let bad_fields = Value::Array(vec![Value::Array(vec![Value::from("a"), Value::Nil])]);
        assert!(parse_batch_reply(bad_fields, &mut out).is_err());

        let odd = Value::Array(vec![entry("a", &["f1"])]);
        assert!(matches!(parse_batch_reply(odd, &mut out), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let naming = TableNaming::new("T").unwrap();
        assert!(BatchScriptRunner::new(&naming, 0).is_err());
        assert_eq!(BatchScriptRunner::new(&naming, 5).unwrap().batch_size(), 5);
    }
}
