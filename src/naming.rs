//! Key naming shared by producers and both consumer variants.
//!
//! | Name | Form |
//! |---|---|
//! | pending set | `<table>_KEY_SET` |
//! | row | `<table>:<key>` |
//! | announcement channel | `<table>_CHANNEL` |
//! | keyspace pattern | `__keyspace@<db>__:<table>:*` |

use crate::error::{Error, Result};

/// Separator between the table name and the row key.
pub const TABLE_NAME_SEPARATOR: char = ':';

const KEYSPACE_PREFIX: &str = "__keyspace@";

/// Naming policy for one logical table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNaming {
    table: String,
}

impl TableNaming {
    /// Create the naming policy for `table`.
    ///
    /// The table name must be non-empty and must not contain the separator,
    /// otherwise keyspace keys could not be split back into table and key.
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if table.is_empty() {
            return Err(Error::InvalidArgument("table name is empty".into()));
        }
        if table.contains(TABLE_NAME_SEPARATOR) {
            return Err(Error::InvalidArgument(format!(
                "table name {:?} contains '{}'",
                table, TABLE_NAME_SEPARATOR
            )));
        }
        Ok(Self { table })
    }

    /// The logical table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the set holding keys with unconsumed changes.
    pub fn key_set(&self) -> String {
        format!("{}_KEY_SET", self.table)
    }

    /// Channel producers publish to after enqueueing a change.
    pub fn channel(&self) -> String {
        format!("{}_CHANNEL", self.table)
    }

    /// Prefix shared by all row keys of the table, e.g. `PORT:`.
    pub fn row_prefix(&self) -> String {
        format!("{}{}", self.table, TABLE_NAME_SEPARATOR)
    }

    /// Full store key of a row.
    pub fn row_key(&self, key: &str) -> String {
        format!("{}{}{}", self.table, TABLE_NAME_SEPARATOR, key)
    }

    /// Keyspace notification pattern covering every row of the table in `db`.
    pub fn keyspace_pattern(&self, db: u8) -> String {
        format!("{}{}__:{}{}*", KEYSPACE_PREFIX, db, self.table, TABLE_NAME_SEPARATOR)
    }
}

/// A keyspace notification channel split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceKey<'a> {
    /// Full row key in the store, `<table>:<key>`.
    pub row_key: &'a str,
    /// Logical key with the table prefix removed.
    pub key: &'a str,
}

/// Split a notification channel such as `__keyspace@0__:PORT:Ethernet0`.
///
/// The first segment names the database and is dropped; the next segment is
/// the table and everything after it is the key, which may itself contain
/// separators. Returns `None` when either separator is missing.
pub fn split_keyspace_key(raw: &str) -> Option<KeyspaceKey<'_>> {
    let (_, row_key) = raw.split_once(TABLE_NAME_SEPARATOR)?;
    let (_, key) = row_key.split_once(TABLE_NAME_SEPARATOR)?;
    Some(KeyspaceKey { row_key, key })
}
