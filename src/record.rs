//! Change records produced by the consumers.

use std::fmt;

/// A single `(field, value)` pair of a row.
pub type FieldValue = (String, String);

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// The row was written; the record carries its current fields.
    Set,
    /// The row is gone; the record carries no fields.
    Del,
}

impl Op {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Set => "SET",
            Op::Del => "DEL",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The reconstructed "what changed" unit for one row key.
///
/// `op` is `Some(Op::Del)` exactly when `fields` is empty. The default value,
/// with an empty key and no op, is the "nothing available" result of a pop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Logical row key, without the table prefix.
    pub key: String,
    /// Operation, `None` only for the empty record.
    pub op: Option<Op>,
    /// Current fields of the row, in store order.
    pub fields: Vec<FieldValue>,
}

impl ChangeRecord {
    /// Build a record from a row snapshot: no fields means the row was deleted.
    pub fn from_snapshot(key: impl Into<String>, fields: Vec<FieldValue>) -> Self {
        let op = if fields.is_empty() { Op::Del } else { Op::Set };
        Self {
            key: key.into(),
            op: Some(op),
            fields,
        }
    }

    /// A deletion record.
    pub fn deleted(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: Some(Op::Del),
            fields: Vec::new(),
        }
    }

    /// Returns true for the "nothing available" record.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() && self.op.is_none()
    }

    /// Reset to the "nothing available" record, keeping allocations.
    pub fn clear(&mut self) {
        self.key.clear();
        self.op = None;
        self.fields.clear();
    }
}
