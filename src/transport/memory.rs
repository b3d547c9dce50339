//! In-process store implementing the consumer's collaborator contract.
//!
//! [`MemoryStore`] keeps sets and hashes behind one lock and understands the
//! commands the consumers and a typical producer issue: WATCH/MULTI/EXEC with
//! per-key versions, channel and pattern pub/sub, keyspace notifications and
//! script registration. Registered scripts run in an embedded Lua
//! interpreter with `redis.call` bound to the store, under the store lock,
//! so a script is as indivisible as it is on a real server.
//!
//! Each [`MemoryStore::connect`] call returns a [`MemoryTransport`] with its
//! own watch list, transaction queue and push inbox.
//!
//! ```
//! # use ferrite_changefeed::transport::memory::MemoryStore;
//! let store = MemoryStore::new();
//! store.hset("PORT:Ethernet0", &[("mtu", "9100")]);
//! store.sadd("PORT_KEY_SET", &["Ethernet0"]);
//! assert_eq!(store.scard("PORT_KEY_SET"), 1);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mlua::{Lua, MultiValue, Value as LuaValue};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::warn;

use super::{SubscriptionKind, Transport};
use crate::error::{Error, Result};
use crate::record::FieldValue;
use crate::types::Value;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOSCRIPT: &str = "NOSCRIPT No matching script. Please use EVAL.";

/// Reply of a single store operation; `Err` carries the error reply text.
type Reply<T> = std::result::Result<T, String>;

fn wrong_arity(cmd: &str) -> String {
    format!("ERR wrong number of arguments for '{}' command", cmd.to_ascii_lowercase())
}

/// Match `input` against a glob `pattern` supporting `*` and `?`.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pat = pattern.as_bytes();
    let inp = input.as_bytes();
    let (mut p, mut i) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while i < inp.len() {
        if p < pat.len() && (pat[p] == b'?' || pat[p] == inp[i]) {
            p += 1;
            i += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            star = Some((p, i));
            p += 1;
        } else if let Some((sp, si)) = star {
            p = sp + 1;
            i = si + 1;
            star = Some((sp, si + 1));
        } else {
            return false;
        }
    }
    pat[p..].iter().all(|&c| c == b'*')
}

/// SHA-1 hex digest of a script source, the handle `SCRIPT LOAD` returns.
pub fn script_handle(source: &str) -> String {
    format!("{:x}", Sha1::digest(source.as_bytes()))
}

#[derive(Debug, Default)]
struct Subscriber {
    channels: HashSet<String>,
    patterns: HashSet<String>,
    inbox: VecDeque<Value>,
}

#[derive(Debug)]
struct StoreState {
    db: u8,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, Vec<FieldValue>>,
    versions: HashMap<String, u64>,
    clock: u64,
    scripts: HashMap<String, String>,
    subscribers: HashMap<u64, Subscriber>,
    next_conn: u64,
    keyspace_events: bool,
    row_reads: u64,
}

impl StoreState {
    fn new(db: u8) -> Self {
        Self {
            db,
            sets: HashMap::new(),
            hashes: HashMap::new(),
            versions: HashMap::new(),
            clock: 0,
            scripts: HashMap::new(),
            subscribers: HashMap::new(),
            next_conn: 1,
            keyspace_events: true,
            row_reads: 0,
        }
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Record a write to `key` and announce it on the keyspace channel.
    fn touch(&mut self, key: &str, event: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
        if self.keyspace_events {
            let channel = format!("__keyspace@{}__:{}", self.db, key);
            self.publish(&channel, event);
        }
    }

    fn publish(&mut self, channel: &str, message: &str) -> usize {
        let mut receivers = 0;
        for sub in self.subscribers.values_mut() {
            if sub.channels.contains(channel) {
                sub.inbox.push_back(Value::Push(vec![
                    Value::from("message"),
                    Value::from(channel),
                    Value::from(message),
                ]));
                receivers += 1;
            }
            for pattern in sub.patterns.iter().filter(|p| glob_match(p, channel)) {
                sub.inbox.push_back(Value::Push(vec![
                    Value::from("pmessage"),
                    Value::from(pattern.as_str()),
                    Value::from(channel),
                    Value::from(message),
                ]));
                receivers += 1;
            }
        }
        receivers
    }

    fn set_mut(&mut self, key: &str) -> Reply<&mut BTreeSet<String>> {
        if self.hashes.contains_key(key) {
            return Err(WRONGTYPE.into());
        }
        Ok(self.sets.entry(key.to_string()).or_default())
    }

    fn hash_mut(&mut self, key: &str) -> Reply<&mut Vec<FieldValue>> {
        if self.sets.contains_key(key) {
            return Err(WRONGTYPE.into());
        }
        Ok(self.hashes.entry(key.to_string()).or_default())
    }

    /// Drop `key` if the write left its container empty.
    fn reap(&mut self, key: &str) -> bool {
        let empty = self.sets.get(key).map(BTreeSet::is_empty).unwrap_or(false)
            || self.hashes.get(key).map(Vec::is_empty).unwrap_or(false);
        if empty {
            self.sets.remove(key);
            self.hashes.remove(key);
        }
        empty
    }

    fn sadd(&mut self, key: &str, members: &[String]) -> Reply<i64> {
        let set = self.set_mut(key)?;
        let added = members.iter().filter(|m| set.insert((*m).clone())).count();
        self.reap(key);
        if added > 0 {
            self.touch(key, "sadd");
        }
        Ok(added as i64)
    }

    fn srem(&mut self, key: &str, members: &[String]) -> Reply<i64> {
        if self.hashes.contains_key(key) {
            return Err(WRONGTYPE.into());
        }
        let removed = match self.sets.get_mut(key) {
            Some(set) => members.iter().filter(|m| set.remove(m.as_str())).count(),
            None => 0,
        };
        if removed > 0 {
            self.touch(key, "srem");
            if self.reap(key) {
                self.touch(key, "del");
            }
        }
        Ok(removed as i64)
    }

    fn spop(&mut self, key: &str, count: usize) -> Reply<Vec<String>> {
        if self.hashes.contains_key(key) {
            return Err(WRONGTYPE.into());
        }
        let mut popped = Vec::new();
        if let Some(set) = self.sets.get_mut(key) {
            while popped.len() < count {
                match set.pop_first() {
                    Some(member) => popped.push(member),
                    None => break,
                }
            }
        }
        if !popped.is_empty() {
            self.touch(key, "spop");
            if self.reap(key) {
                self.touch(key, "del");
            }
        }
        Ok(popped)
    }

    fn scard(&self, key: &str) -> Reply<i64> {
        if self.hashes.contains_key(key) {
            return Err(WRONGTYPE.into());
        }
        Ok(self.sets.get(key).map(|s| s.len() as i64).unwrap_or(0))
    }

    fn hset(&mut self, key: &str, pairs: &[String]) -> Reply<i64> {
        let hash = self.hash_mut(key)?;
        let mut added = 0;
        for pair in pairs.chunks_exact(2) {
            let (field, value) = (&pair[0], &pair[1]);
            match hash.iter_mut().find(|(f, _)| f == field) {
                Some(slot) => slot.1 = value.clone(),
                None => {
                    hash.push((field.clone(), value.clone()));
                    added += 1;
                }
            }
        }
        self.touch(key, "hset");
        Ok(added)
    }

    fn hdel(&mut self, key: &str, fields: &[String]) -> Reply<i64> {
        if self.sets.contains_key(key) {
            return Err(WRONGTYPE.into());
        }
        let removed = match self.hashes.get_mut(key) {
            Some(hash) => {
                let before = hash.len();
                hash.retain(|(f, _)| !fields.contains(f));
                before - hash.len()
            }
            None => 0,
        };
        if removed > 0 {
            self.touch(key, "hdel");
            if self.reap(key) {
                self.touch(key, "del");
            }
        }
        Ok(removed as i64)
    }

    fn hgetall(&self, key: &str) -> Reply<Vec<FieldValue>> {
        if self.sets.contains_key(key) {
            return Err(WRONGTYPE.into());
        }
        Ok(self.hashes.get(key).cloned().unwrap_or_default())
    }

    fn del(&mut self, keys: &[String]) -> i64 {
        let mut removed = 0;
        for key in keys {
            let existed =
                self.sets.remove(key.as_str()).is_some() | self.hashes.remove(key.as_str()).is_some();
            if existed {
                self.touch(key, "del");
                removed += 1;
            }
        }
        removed
    }

    fn exists(&self, key: &str) -> bool {
        self.sets.contains_key(key) || self.hashes.contains_key(key)
    }

    fn script(&mut self, args: &[String]) -> Reply<Value> {
        let sub = args.first().ok_or_else(|| wrong_arity("script"))?;
        match sub.to_ascii_uppercase().as_str() {
            "LOAD" => {
                let source = args.get(1).ok_or_else(|| wrong_arity("script|load"))?;
                let sha = script_handle(source);
                self.scripts.insert(sha.clone(), source.clone());
                Ok(Value::from(sha))
            }
            "EXISTS" => Ok(Value::Array(
                args[1..]
                    .iter()
                    .map(|sha| Value::Integer(self.scripts.contains_key(sha) as i64))
                    .collect(),
            )),
            "FLUSH" => {
                self.scripts.clear();
                Ok(Value::Status("OK".into()))
            }
            other => Err(format!("ERR unknown subcommand '{}'", other)),
        }
    }

    fn evalsha(&mut self, args: &[String]) -> Reply<Value> {
        if args.len() < 2 {
            return Err(wrong_arity("evalsha"));
        }
        let source = self
            .scripts
            .get(&args[0])
            .cloned()
            .ok_or_else(|| NOSCRIPT.to_string())?;
        let numkeys: usize = args[1]
            .parse()
            .map_err(|_| "ERR value is not an integer or out of range".to_string())?;
        if args.len() < 2 + numkeys {
            return Err("ERR Number of keys can't be greater than number of args".into());
        }
        let (keys, argv) = args[2..].split_at(numkeys);
        self.eval(&source, keys, argv)
    }

    /// Run `source` with `KEYS`, `ARGV` and `redis.call` bound to this store.
    fn eval(&mut self, source: &str, keys: &[String], argv: &[String]) -> Reply<Value> {
        let lua = Lua::new();
        let result = lua.scope(|scope| {
            let globals = lua.globals();
            globals.set("KEYS", lua.create_sequence_from(keys.iter().map(String::as_str))?)?;
            globals.set("ARGV", lua.create_sequence_from(argv.iter().map(String::as_str))?)?;

            let redis = lua.create_table()?;
            let call = scope
                .create_function_mut(|lua, args: MultiValue| self.script_call(lua, args))?;
            redis.set("call", call)?;
            globals.set("redis", redis)?;

            let value = lua.load(source).eval::<LuaValue>()?;
            Ok(lua_to_value(value))
        });
        result.map_err(|e| format!("ERR Error running script: {}", e))
    }

    /// `redis.call` from a script: run one data command, raising on error.
    fn script_call(&mut self, lua: &Lua, args: MultiValue) -> mlua::Result<LuaValue> {
        let mut args = args.into_iter().map(|arg| -> mlua::Result<String> {
            match arg {
                LuaValue::String(s) => Ok(s.to_str()?.to_string()),
                LuaValue::Integer(n) => Ok(n.to_string()),
                LuaValue::Number(n) => Ok(n.to_string()),
                _ => Err(mlua::Error::RuntimeError(
                    "Lua redis lib command arguments must be strings or integers".into(),
                )),
            }
        });
        let cmd = match args.next() {
            Some(cmd) => cmd?.to_ascii_uppercase(),
            None => {
                return Err(mlua::Error::RuntimeError(
                    "Please specify at least one argument for this redis lib call".into(),
                ))
            }
        };
        let args = args.collect::<mlua::Result<Vec<String>>>()?;
        if matches!(cmd.as_str(), "EVALSHA" | "SCRIPT") {
            return Err(mlua::Error::RuntimeError(
                "This Redis command is not allowed from script".into(),
            ));
        }
        let reply = self.try_apply(&cmd, &args).map_err(mlua::Error::RuntimeError)?;
        value_to_lua(lua, reply)
    }

    /// Run a data command; errors come back as [`Value::Error`].
    fn apply(&mut self, cmd: &str, args: &[String]) -> Value {
        match self.try_apply(cmd, args) {
            Ok(value) => value,
            Err(msg) => Value::Error(msg),
        }
    }

    fn try_apply(&mut self, cmd: &str, args: &[String]) -> Reply<Value> {
        let key_and_rest = |min: usize| split_key(cmd, args, min);
        match cmd {
            "PING" => Ok(Value::Status("PONG".into())),
            "SADD" => {
                let (key, members) = key_and_rest(2)?;
                self.sadd(key, members).map(Value::Integer)
            }
            "SREM" => {
                let (key, members) = key_and_rest(2)?;
                self.srem(key, members).map(Value::Integer)
            }
            "SCARD" => {
                let (key, _) = key_and_rest(1)?;
                self.scard(key).map(Value::Integer)
            }
            "SMEMBERS" => {
                let (key, _) = key_and_rest(1)?;
                if self.hashes.contains_key(key.as_str()) {
                    return Err(WRONGTYPE.into());
                }
                let members = self.sets.get(key.as_str()).cloned().unwrap_or_default();
                Ok(Value::Array(members.into_iter().map(Value::from).collect()))
            }
            "SPOP" => {
                let (key, rest) = key_and_rest(1)?;
                match rest.first() {
                    Some(count) => {
                        let count = count
                            .parse()
                            .map_err(|_| "ERR value is out of range, must be positive".to_string())?;
                        let popped = self.spop(key, count)?;
                        Ok(Value::Array(popped.into_iter().map(Value::from).collect()))
                    }
                    None => Ok(self
                        .spop(key, 1)?
                        .pop()
                        .map(Value::from)
                        .unwrap_or(Value::Nil)),
                }
            }
            "HSET" => {
                let (key, pairs) = key_and_rest(3)?;
                if pairs.len() % 2 != 0 {
                    return Err(wrong_arity(cmd));
                }
                self.hset(key, pairs).map(Value::Integer)
            }
            "HDEL" => {
                let (key, fields) = key_and_rest(2)?;
                self.hdel(key, fields).map(Value::Integer)
            }
            "HGETALL" => {
                let (key, _) = key_and_rest(1)?;
                self.hgetall(key).map(|fields| Value::Array(flatten(fields)))
            }
            "DEL" => {
                key_and_rest(1)?;
                Ok(Value::Integer(self.del(args)))
            }
            "EXISTS" => {
                key_and_rest(1)?;
                Ok(Value::Integer(args.iter().filter(|k| self.exists(k)).count() as i64))
            }
            "PUBLISH" => match args {
                [channel, message] => Ok(Value::Integer(self.publish(channel, message) as i64)),
                _ => Err(wrong_arity(cmd)),
            },
            "SCRIPT" => self.script(args),
            "EVALSHA" => self.evalsha(args),
            other => Err(format!("ERR unknown command '{}'", other)),
        }
    }
}

/// Split off the key argument, requiring at least `min` arguments in total.
fn split_key<'a>(cmd: &str, args: &'a [String], min: usize) -> Reply<(&'a String, &'a [String])> {
    match args.split_first() {
        Some((key, rest)) if rest.len() + 1 >= min => Ok((key, rest)),
        _ => Err(wrong_arity(cmd)),
    }
}

/// Convert a command reply to what `redis.call` hands a script.
fn value_to_lua(lua: &Lua, value: Value) -> mlua::Result<LuaValue> {
    let sequence = |items: Vec<Value>| -> mlua::Result<LuaValue> {
        let table = lua.create_table()?;
        for (i, item) in items.into_iter().enumerate() {
            table.raw_set(i + 1, value_to_lua(lua, item)?)?;
        }
        Ok(LuaValue::Table(table))
    };
    match value {
        Value::String(data) => Ok(LuaValue::String(lua.create_string(&data)?)),
        Value::Integer(n) => Ok(LuaValue::Integer(n)),
        Value::Nil => Ok(LuaValue::Boolean(false)),
        Value::Boolean(b) => Ok(LuaValue::Boolean(b)),
        Value::Double(d) => Ok(LuaValue::Number(d)),
        Value::Status(status) => {
            let table = lua.create_table()?;
            table.set("ok", status)?;
            Ok(LuaValue::Table(table))
        }
        Value::Error(msg) => Err(mlua::Error::RuntimeError(msg)),
        Value::Array(items) | Value::Push(items) => sequence(items),
        Value::Map(pairs) => sequence(pairs.into_iter().flat_map(|(k, v)| [k, v]).collect()),
    }
}

/// Convert a script's return value to a reply.
fn lua_to_value(value: LuaValue) -> Value {
    match value {
        LuaValue::Boolean(true) => Value::Integer(1),
        LuaValue::Integer(n) => Value::Integer(n),
        // Lua numbers are truncated to integers.
        LuaValue::Number(n) => Value::Integer(n as i64),
        LuaValue::String(s) => Value::String(Bytes::copy_from_slice(&s.as_bytes())),
        LuaValue::Table(table) => {
            if let Ok(LuaValue::String(s)) = table.raw_get::<LuaValue>("ok") {
                return Value::Status(s.to_string_lossy().into());
            }
            if let Ok(LuaValue::String(s)) = table.raw_get::<LuaValue>("err") {
                return Value::Error(s.to_string_lossy().into());
            }
            let mut items = Vec::new();
            let mut i = 1;
            while let Ok(item) = table.raw_get::<LuaValue>(i) {
                if item.is_nil() {
                    break;
                }
                items.push(lua_to_value(item));
                i += 1;
            }
            Value::Array(items)
        }
        _ => Value::Nil,
    }
}

fn flatten(fields: Vec<FieldValue>) -> Vec<Value> {
    fields
        .into_iter()
        .flat_map(|(f, v)| [Value::from(f), Value::from(v)])
        .collect()
}

type ContentionHook = Box<dyn FnMut(&MemoryStore) + Send>;

struct Contention {
    remaining: u32,
    hook: ContentionHook,
}

struct Shared {
    state: Mutex<StoreState>,
    contention: Mutex<Option<Contention>>,
}

/// Shared in-process store. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryStore")
            .field("db", &state.db)
            .field("sets", &state.sets.len())
            .field("hashes", &state.hashes.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store serving database 0.
    pub fn new() -> Self {
        Self::with_database(0)
    }

    /// Create an empty store serving database `db`.
    pub fn with_database(db: u8) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(StoreState::new(db)),
                contention: Mutex::new(None),
            }),
        }
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryTransport {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_conn;
            state.next_conn += 1;
            id
        };
        MemoryTransport {
            store: self.clone(),
            id,
            watched: Vec::new(),
            queued: None,
        }
    }

    /// Database index reported by connections and used in keyspace channels.
    pub fn database(&self) -> u8 {
        self.inner.state.lock().db
    }

    /// Turn keyspace notifications on or off. They start enabled.
    pub fn set_keyspace_events(&self, enabled: bool) {
        self.inner.state.lock().keyspace_events = enabled;
    }

    fn run(&self, cmd: &str, args: Vec<String>) -> Value {
        let reply = {
            let mut state = self.inner.state.lock();
            if cmd == "HGETALL" {
                state.row_reads += 1;
            }
            state.apply(cmd, &args)
        };
        if let Value::Error(ref msg) = reply {
            warn!(command = cmd, error = %msg, "memory store command failed");
        }
        reply
    }

    fn run_count(&self, cmd: &str, args: Vec<String>) -> usize {
        self.run(cmd, args).as_integer().unwrap_or(0) as usize
    }

    /// Add members to a set, returning how many were new.
    pub fn sadd(&self, key: &str, members: &[&str]) -> usize {
        self.run_count("SADD", owned(key, members))
    }

    /// Remove members from a set, returning how many were present.
    pub fn srem(&self, key: &str, members: &[&str]) -> usize {
        self.run_count("SREM", owned(key, members))
    }

    /// Members of a set in enumeration order.
    pub fn smembers(&self, key: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cardinality of a set.
    pub fn scard(&self, key: &str) -> usize {
        self.run_count("SCARD", vec![key.to_string()])
    }

    /// Write fields of a hash, returning how many were new.
    pub fn hset(&self, key: &str, pairs: &[(&str, &str)]) -> usize {
        let mut args = vec![key.to_string()];
        for (field, value) in pairs {
            args.push(field.to_string());
            args.push(value.to_string());
        }
        self.run_count("HSET", args)
    }

    /// Remove fields of a hash, returning how many were present.
    pub fn hdel(&self, key: &str, fields: &[&str]) -> usize {
        self.run_count("HDEL", owned(key, fields))
    }

    /// All fields of a hash in insertion order.
    pub fn hgetall(&self, key: &str) -> Vec<FieldValue> {
        self.inner.state.lock().hgetall(key).unwrap_or_default()
    }

    /// Delete a key of any type, returning whether it existed.
    pub fn del(&self, key: &str) -> bool {
        self.run_count("DEL", vec![key.to_string()]) == 1
    }

    /// Returns true if `key` holds a set or a hash.
    pub fn exists(&self, key: &str) -> bool {
        self.inner.state.lock().exists(key)
    }

    /// Publish `message` on `channel`, returning the number of receivers.
    pub fn publish(&self, channel: &str, message: &str) -> usize {
        self.inner.state.lock().publish(channel, message)
    }

    /// Append `message` to the inbox of every subscribed connection as-is.
    ///
    /// Lets callers feed malformed pushes that a real server would never send.
    pub fn deliver_raw(&self, message: Value) -> usize {
        let mut state = self.inner.state.lock();
        let mut receivers = 0;
        for sub in state.subscribers.values_mut() {
            if !sub.channels.is_empty() || !sub.patterns.is_empty() {
                sub.inbox.push_back(message.clone());
                receivers += 1;
            }
        }
        receivers
    }

    /// Returns true if a script with handle `sha` is registered.
    pub fn script_exists(&self, sha: &str) -> bool {
        self.inner.state.lock().scripts.contains_key(sha)
    }

    /// Forget every registered script, as `SCRIPT FLUSH` does.
    pub fn flush_scripts(&self) {
        self.inner.state.lock().scripts.clear();
    }

    /// Number of `HGETALL` commands clients have issued.
    pub fn row_reads(&self) -> u64 {
        self.inner.state.lock().row_reads
    }

    /// Run `hook` right before each of the next `rounds` EXEC commands.
    ///
    /// The hook sees the store before the watched versions are checked, so a
    /// write to a watched key aborts that transaction.
    pub fn contend_on_exec<F>(&self, rounds: u32, hook: F)
    where
        F: FnMut(&MemoryStore) + Send + 'static,
    {
        *self.inner.contention.lock() = Some(Contention {
            remaining: rounds,
            hook: Box::new(hook),
        });
    }

    fn run_contention(&self) {
        let mut slot = self.inner.contention.lock();
        if let Some(contention) = slot.as_mut() {
            if contention.remaining > 0 {
                contention.remaining -= 1;
                (contention.hook)(self);
            }
            if contention.remaining == 0 {
                *slot = None;
            }
        }
    }
}

fn owned(key: &str, rest: &[&str]) -> Vec<String> {
    std::iter::once(key)
        .chain(rest.iter().copied())
        .map(str::to_string)
        .collect()
}

/// One connection to a [`MemoryStore`].
pub struct MemoryTransport {
    store: MemoryStore,
    id: u64,
    watched: Vec<(String, u64)>,
    queued: Option<Vec<(String, Vec<String>)>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.id)
            .field("watched", &self.watched.len())
            .field("in_multi", &self.queued.is_some())
            .finish()
    }
}

impl MemoryTransport {
    /// The store this connection talks to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn dispatch(&mut self, args: Vec<Bytes>) -> Value {
        let mut args: Vec<String> = args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        if args.is_empty() {
            return Value::Error("ERR empty command".into());
        }
        let cmd = args.remove(0).to_ascii_uppercase();

        if let Some(queue) = self.queued.as_mut() {
            if !matches!(cmd.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH") {
                queue.push((cmd, args));
                return Value::Status("QUEUED".into());
            }
        }

        match cmd.as_str() {
            "HELLO" => Value::Map(vec![
                (Value::from("server"), Value::from("memory")),
                (Value::from("proto"), Value::Integer(3)),
            ]),
            "SELECT" => match args.first().and_then(|db| db.parse::<u8>().ok()) {
                Some(db) if db == self.store.database() => Value::Status("OK".into()),
                _ => Value::Error("ERR DB index is out of range".into()),
            },
            "WATCH" if self.queued.is_some() => {
                Value::Error("ERR WATCH inside MULTI is not allowed".into())
            }
            "WATCH" if args.is_empty() => Value::Error(wrong_arity("watch")),
            "WATCH" => {
                let state = self.store.inner.state.lock();
                for key in args {
                    let version = state.version(&key);
                    self.watched.push((key, version));
                }
                Value::Status("OK".into())
            }
            "UNWATCH" => {
                self.watched.clear();
                Value::Status("OK".into())
            }
            "MULTI" if self.queued.is_some() => {
                Value::Error("ERR MULTI calls can not be nested".into())
            }
            "MULTI" => {
                self.queued = Some(Vec::new());
                Value::Status("OK".into())
            }
            "DISCARD" => match self.queued.take() {
                Some(_) => {
                    self.watched.clear();
                    Value::Status("OK".into())
                }
                None => Value::Error("ERR DISCARD without MULTI".into()),
            },
            "EXEC" => self.exec(),
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                let kind = if cmd == "SUBSCRIBE" {
                    SubscriptionKind::Channel
                } else {
                    SubscriptionKind::Pattern
                };
                match args.first() {
                    Some(channel) => {
                        let count = self.add_subscription(kind, channel);
                        Value::Push(vec![
                            Value::from(kind.confirmation()),
                            Value::from(channel.as_str()),
                            Value::Integer(count as i64),
                        ])
                    }
                    None => Value::Error(wrong_arity(&cmd)),
                }
            }
            _ => self.store.run(&cmd, args),
        }
    }

    fn exec(&mut self) -> Value {
        let queue = match self.queued.take() {
            Some(queue) => queue,
            None => return Value::Error("ERR EXEC without MULTI".into()),
        };
        self.store.run_contention();

        let watched = std::mem::take(&mut self.watched);
        let mut state = self.store.inner.state.lock();
        if watched.iter().any(|(key, v)| state.version(key) != *v) {
            return Value::Nil;
        }
        Value::Array(
            queue
                .into_iter()
                .map(|(cmd, args)| state.apply(&cmd, &args))
                .collect(),
        )
    }

    fn add_subscription(&mut self, kind: SubscriptionKind, channel: &str) -> usize {
        let mut state = self.store.inner.state.lock();
        let sub = state.subscribers.entry(self.id).or_default();
        match kind {
            SubscriptionKind::Channel => sub.channels.insert(channel.to_string()),
            SubscriptionKind::Pattern => sub.patterns.insert(channel.to_string()),
        };
        sub.channels.len() + sub.patterns.len()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.store.inner.state.lock().subscribers.remove(&self.id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn execute(&mut self, args: Vec<Bytes>) -> Result<Value> {
        match self.dispatch(args) {
            Value::Error(msg) => Err(Error::Server(msg)),
            other => Ok(other),
        }
    }

    async fn subscribe(&mut self, kind: SubscriptionKind, channel: Bytes) -> Result<()> {
        let channel = std::str::from_utf8(&channel)
            .map_err(|_| Error::InvalidArgument("channel name is not UTF-8".into()))?;
        self.add_subscription(kind, channel);
        Ok(())
    }

    fn try_next_push(&mut self) -> Result<Option<Value>> {
        let mut state = self.store.inner.state.lock();
        Ok(state
            .subscribers
            .get_mut(&self.id)
            .and_then(|sub| sub.inbox.pop_front()))
    }

    fn database(&self) -> u8 {
        self.store.database()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BATCH_POP_SCRIPT;
    use crate::commands;

    fn cmd(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("__keyspace@0__:T:*", "__keyspace@0__:T:k1"));
        assert!(glob_match("__keyspace@0__:T:*", "__keyspace@0__:T:"));
        assert!(!glob_match("__keyspace@0__:T:*", "__keyspace@0__:TT:k1"));
        assert!(glob_match("h?llo", "hello"));
        assert!(glob_match("*a*b", "xxaYYb"));
        assert!(!glob_match("*a*b", "xxaYYbc"));
    }

    #[test]
    fn test_set_and_hash_helpers() {
        let store = MemoryStore::new();
        assert_eq!(store.sadd("S", &["b", "a", "b"]), 2);
        assert_eq!(store.smembers("S"), vec!["a", "b"]);
        assert_eq!(store.srem("S", &["a", "zz"]), 1);
        assert_eq!(store.scard("S"), 1);

        assert_eq!(store.hset("H", &[("f1", "1"), ("f2", "2")]), 2);
        assert_eq!(store.hset("H", &[("f1", "one")]), 0);
        assert_eq!(
            store.hgetall("H"),
            vec![("f1".into(), "one".into()), ("f2".into(), "2".into())]
        );
        assert_eq!(store.hdel("H", &["f1", "f2"]), 2);
        assert!(!store.exists("H"));
        assert!(store.del("S"));
        assert!(!store.del("S"));
    }

    #[tokio::test]
    async fn test_wrongtype_is_server_error() {
        let store = MemoryStore::new();
        store.hset("H", &[("f", "v")]);
        let mut conn = store.connect();
        let err = conn.execute(cmd(&["SADD", "H", "x"])).await.unwrap_err();
        assert!(matches!(err, Error::Server(msg) if msg.starts_with("WRONGTYPE")));
    }

    #[tokio::test]
    async fn test_keyspace_events() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        conn.subscribe(SubscriptionKind::Pattern, Bytes::from("__keyspace@0__:T:*"))
            .await
            .unwrap();

        store.hset("T:k1", &[("f", "v")]);
        store.hdel("T:k1", &["f"]);
        store.sadd("T_KEY_SET", &["k1"]);

        let events: Vec<String> = std::iter::from_fn(|| conn.try_next_push().unwrap())
            .map(|push| {
                let parts = push.into_message_parts().unwrap();
                assert_eq!(parts[0], Value::from("pmessage"));
                assert_eq!(parts[2], Value::from("__keyspace@0__:T:k1"));
                parts[3].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(events, vec!["hset", "hdel", "del"]);
    }

    #[tokio::test]
    async fn test_keyspace_events_can_be_disabled() {
        let store = MemoryStore::with_database(3);
        store.set_keyspace_events(false);
        let mut conn = store.connect();
        assert_eq!(conn.database(), 3);
        conn.subscribe(SubscriptionKind::Pattern, Bytes::from("__keyspace@3__:*"))
            .await
            .unwrap();
        store.hset("T:k1", &[("f", "v")]);
        assert!(conn.try_next_push().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_publish_and_drop() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        conn.subscribe(SubscriptionKind::Channel, Bytes::from("C"))
            .await
            .unwrap();
        assert_eq!(store.publish("C", "G"), 1);
        let push = conn.try_next_push().unwrap().unwrap();
        assert_eq!(
            push,
            Value::Push(vec![Value::from("message"), Value::from("C"), Value::from("G")])
        );

        drop(conn);
        assert_eq!(store.publish("C", "G"), 0);
    }

    #[tokio::test]
    async fn test_batch_script_runs_through_lua() {
        let store = MemoryStore::new();
        store.sadd("T_KEY_SET", &["a", "b"]);
        store.hset("T:a", &[("f", "v")]);
        let mut conn = store.connect();

        let sha = commands::script_load(&mut conn, BATCH_POP_SCRIPT).await.unwrap();
        let reply = conn
            .execute(cmd(&["EVALSHA", sha.as_str(), "2", "T_KEY_SET", "T:", "10"]))
            .await
            .unwrap();
        assert_eq!(
            reply,
            Value::Array(vec![
                Value::Array(vec![
                    Value::from("a"),
                    Value::Array(vec![Value::from("f"), Value::from("v")]),
                ]),
                Value::Array(vec![Value::from("b"), Value::Array(vec![])]),
            ])
        );
        assert_eq!(store.scard("T_KEY_SET"), 0);
        assert!(!store.exists("T:a"));

        let empty = conn
            .execute(cmd(&["EVALSHA", sha.as_str(), "2", "T_KEY_SET", "T:", "10"]))
            .await
            .unwrap();
        assert!(empty.is_nil());
        // The claim script does not count as a client row read.
        assert_eq!(store.row_reads(), 0);
    }

    #[tokio::test]
    async fn test_script_calls_store_commands() {
        let store = MemoryStore::new();
        store.sadd("S", &["a", "b", "c"]);
        let mut conn = store.connect();

        let sha = commands::script_load(
            &mut conn,
            "redis.call('SREM', KEYS[1], ARGV[1])\nreturn redis.call('SCARD', KEYS[1])",
        )
        .await
        .unwrap();
        let reply = conn
            .execute(cmd(&["EVALSHA", sha.as_str(), "1", "S", "b"]))
            .await
            .unwrap();
        assert_eq!(reply, Value::Integer(2));
        assert_eq!(store.smembers("S"), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_script_status_and_error_replies() {
        let store = MemoryStore::new();
        store.hset("H", &[("f", "v")]);
        let mut conn = store.connect();

        let ok = commands::script_load(&mut conn, "return redis.call('PING')")
            .await
            .unwrap();
        let reply = conn.execute(cmd(&["EVALSHA", ok.as_str(), "0"])).await.unwrap();
        assert_eq!(reply, Value::Status("PONG".into()));

        let wrongtype = commands::script_load(&mut conn, "return redis.call('SCARD', KEYS[1])")
            .await
            .unwrap();
        let err = conn
            .execute(cmd(&["EVALSHA", wrongtype.as_str(), "1", "H"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Server(msg) if msg.contains("WRONGTYPE")));

        let syntax = commands::script_load(&mut conn, "return (").await.unwrap();
        let err = conn
            .execute(cmd(&["EVALSHA", syntax.as_str(), "0"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Server(msg) if msg.starts_with("ERR Error running script")));
    }

    #[test]
    fn test_script_handle_is_sha1() {
        assert_eq!(script_handle(""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(script_handle("return 1"), "e0e1f9fabfc9d4800c877a703b823ac0578ff8db");
        assert_eq!(script_handle(BATCH_POP_SCRIPT).len(), 40);
    }

    #[tokio::test]
    async fn test_script_exists_and_flush() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let sha = commands::script_load(&mut conn, "return 1").await.unwrap();
        let reply = conn
            .execute(cmd(&["SCRIPT", "EXISTS", sha.as_str(), "nope"]))
            .await
            .unwrap();
        assert_eq!(reply, Value::Array(vec![Value::Integer(1), Value::Integer(0)]));

        conn.execute(cmd(&["SCRIPT", "FLUSH"])).await.unwrap();
        assert!(!store.script_exists(&sha));
    }

    #[tokio::test]
    async fn test_errors_inside_exec_stay_nested() {
        let store = MemoryStore::new();
        store.hset("H", &[("f", "v")]);
        let mut conn = store.connect();
        commands::multi(&mut conn).await.unwrap();
        commands::enqueue(&mut conn, cmd(&["SCARD", "H"])).await.unwrap();
        commands::enqueue(&mut conn, cmd(&["EXISTS", "H"])).await.unwrap();
        let replies = commands::exec_transaction(&mut conn).await.unwrap().unwrap();
        assert!(matches!(replies[0], Value::Error(_)));
        assert_eq!(replies[1], Value::Integer(1));
    }
}
