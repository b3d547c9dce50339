//! Server-side scripts and the process-wide handle registry.
//!
//! A script is identified by its source text. The first time a script is
//! needed it is registered with `SCRIPT LOAD` and the handle the server
//! returns is cached; later invocations go straight to `EVALSHA`.

use std::sync::OnceLock;

use dashmap::DashMap;
use tracing::debug;

use crate::commands;
use crate::error::Result;
use crate::transport::Transport;

/// A Lua script run on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Script {
    name: &'static str,
    source: &'static str,
}

impl Script {
    /// Create a script with a short diagnostic name.
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lua source text.
    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// Content-addressed cache of script source to server handle.
///
/// Entries are only ever replaced wholesale, either on a miss or after the
/// server reported that it forgot a handle.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    handles: DashMap<&'static str, String>,
}

static GLOBAL: OnceLock<ScriptRegistry> = OnceLock::new();

impl ScriptRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every consumer in the process.
    pub fn global() -> &'static ScriptRegistry {
        GLOBAL.get_or_init(ScriptRegistry::new)
    }

    /// Cached handle for `script`, if it has been loaded.
    pub fn cached(&self, script: &Script) -> Option<String> {
        self.handles.get(script.source).map(|h| h.value().clone())
    }

    /// Return the handle for `script`, registering it on the server on a miss.
    pub async fn load<T: Transport + ?Sized>(&self, conn: &mut T, script: &Script) -> Result<String> {
        if let Some(sha) = self.cached(script) {
            return Ok(sha);
        }
        self.reload(conn, script).await
    }

    /// Register `script` unconditionally and cache the new handle.
    pub async fn reload<T: Transport + ?Sized>(&self, conn: &mut T, script: &Script) -> Result<String> {
        let sha = commands::script_load(conn, script.source).await?;
        debug!(script = script.name, sha = %sha, "script loaded");
        self.handles.insert(script.source, sha.clone());
        Ok(sha)
    }

    /// Forget the cached handle for `script`.
    pub fn invalidate(&self, script: &Script) {
        self.handles.remove(script.source);
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
