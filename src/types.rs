//! Value types for store replies and command arguments.

use bytes::Bytes;
use std::fmt;

use crate::error::{Error, Result};

/// Represents a value returned from the store.
///
/// This maps to the RESP2 and RESP3 reply types. Server-initiated messages
/// (RESP3 push frames) are kept apart from ordinary replies in [`Value::Push`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A string value (from RESP Bulk String).
    String(Bytes),

    /// An integer value (from RESP Integer).
    Integer(i64),

    /// An array of values (from RESP Array or RESP3 Set).
    Array(Vec<Value>),

    /// A null value (null bulk string, null array, or RESP3 null).
    Nil,

    /// A boolean value (RESP3).
    Boolean(bool),

    /// A double/float value (RESP3).
    Double(f64),

    /// A map of key-value pairs in wire order (RESP3).
    Map(Vec<(Value, Value)>),

    /// A status response (from RESP Simple String like "+OK").
    Status(String),

    /// An error reply nested inside an aggregate, e.g. one element of an EXEC reply.
    Error(String),

    /// A server push message (RESP3 `>` frame).
    Push(Vec<Value>),
}

impl Value {
    /// Returns the value as a string, if it is one.
    ///
    /// # Examples
    /// ```
    /// # use ferrite_changefeed::types::Value;
    /// let val = Value::String(bytes::Bytes::from("hello"));
    /// assert_eq!(val.as_str(), Some("hello"));
    /// ```
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(b) => std::str::from_utf8(b).ok(),
            Value::Status(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the value as bytes, if it is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(b) => Some(b),
            Value::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns the value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Returns `true` if the value is nil/null.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns `true` for a `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::Status(s) if s == "OK")
    }

    /// Returns `true` if this value arrived as a server push.
    pub fn is_push(&self) -> bool {
        matches!(self, Value::Push(_))
    }

    /// Converts the value into a `String`.
    ///
    /// Returns an error if the value is not a string type.
    pub fn into_string(self) -> Result<String> {
        match self {
            Value::String(b) => String::from_utf8(b.to_vec())
                .map_err(|e| Error::Protocol(format!("invalid UTF-8 in string value: {}", e))),
            Value::Status(s) => Ok(s),
            other => Err(Error::unexpected("string", other.type_name())),
        }
    }

    /// Converts the value into an `i64`.
    ///
    /// Returns an error if the value is not an integer.
    pub fn into_integer(self) -> Result<i64> {
        match self {
            Value::Integer(n) => Ok(n),
            other => Err(Error::unexpected("integer", other.type_name())),
        }
    }

    /// Converts the value into a `Vec<Value>`.
    ///
    /// Nil converts to an empty vector. Returns an error for any other
    /// non-array value.
    pub fn into_array(self) -> Result<Vec<Value>> {
        match self {
            Value::Array(arr) => Ok(arr),
            Value::Nil => Ok(vec![]),
            other => Err(Error::unexpected("array", other.type_name())),
        }
    }

    /// Splits a pub/sub message into its parts.
    ///
    /// RESP3 delivers messages as push frames, RESP2 as plain arrays; both
    /// are accepted.
    pub fn into_message_parts(self) -> Option<Vec<Value>> {
        match self {
            Value::Push(parts) | Value::Array(parts) => Some(parts),
            _ => None,
        }
    }

    /// Returns a human-readable type name for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Array(_) => "array",
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Double(_) => "double",
            Value::Map(_) => "map",
            Value::Status(_) => "status",
            Value::Error(_) => "error",
            Value::Push(_) => "push",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "<binary {} bytes>", b.len()),
            },
            Value::Integer(n) => write!(f, "(integer) {}", n),
            Value::Array(arr) | Value::Push(arr) => {
                write!(f, "[")?;
                for (i, val) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val)?;
                }
                write!(f, "]")
            }
            Value::Nil => write!(f, "(nil)"),
            Value::Boolean(b) => write!(f, "(boolean) {}", b),
            Value::Double(d) => write!(f, "(double) {}", d),
            Value::Map(m) => write!(f, "(map) {} entries", m.len()),
            Value::Status(s) => write!(f, "{}", s),
            Value::Error(e) => write!(f, "(error) {}", e),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Bytes::from(s))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

/// Trait for types that can be converted into command arguments.
pub trait ToArg {
    /// Encode this value as a RESP bulk string argument.
    fn to_arg(&self) -> Bytes;
}

impl ToArg for &str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for &String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for i64 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl ToArg for u32 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl ToArg for u8 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl ToArg for usize {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}
