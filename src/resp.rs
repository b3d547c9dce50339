//! RESP2/RESP3 protocol encoder and decoder.
//!
//! Commands are always sent as RESP2 arrays of bulk strings. Replies are
//! decoded in both protocol versions so a connection that negotiated RESP3
//! can tell server pushes (`>`) apart from ordinary replies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::types::Value;

/// Encode a command as a RESP2 array of bulk strings.
///
/// # Example wire format
/// ```text
/// *2\r\n$5\r\nSCARD\r\n$12\r\nPORT_KEY_SET\r\n
/// ```
pub fn encode_command(args: &[Bytes], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");

    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Attempt to decode a single value from the buffer.
///
/// Returns `Ok(Some(value))` and consumes the frame if it is complete,
/// `Ok(None)` if more data is needed, or `Err` if the data is malformed.
/// Error replies decode to [`Value::Error`]; turning them into
/// [`Error::Server`] is left to the caller so the frame is always consumed.
pub fn decode_value(buf: &mut BytesMut) -> Result<Option<Value>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&buf[..]);

    match check_complete(&mut cursor) {
        Ok(len) => {
            cursor.set_position(0);
            let value = parse_value(&mut cursor)?;
            buf.advance(len);
            Ok(Some(value))
        }
        Err(Error::Protocol(ref s)) if s == INCOMPLETE => Ok(None),
        Err(e) => Err(e),
    }
}

const INCOMPLETE: &str = "incomplete";

/// Returns true if the next [`decode_value`] on `buf` makes progress: the
/// buffer starts with a complete frame or with bytes that are malformed.
pub fn frame_ready(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    !matches!(
        check_complete(&mut Cursor::new(buf)),
        Err(Error::Protocol(ref s)) if s == INCOMPLETE
    )
}

/// Check if a complete frame is available, returning its byte length.
fn check_complete(cursor: &mut Cursor<&[u8]>) -> Result<usize> {
    match get_byte(cursor)? {
        b'+' | b'-' | b':' | b'_' | b'#' | b',' | b'(' => {
            find_line(cursor)?;
        }
        b'$' | b'!' | b'=' => {
            let len = read_decimal(cursor)?;
            if len == -1 {
                return Ok(cursor.position() as usize);
            }
            if len < -1 {
                return Err(Error::Protocol("negative bulk length".into()));
            }
            let total = cursor.position() as usize + len as usize + 2;
            if cursor.get_ref().len() < total {
                return Err(incomplete());
            }
            cursor.set_position(total as u64);
        }
        prefix @ (b'*' | b'~' | b'>') => {
            let count = read_decimal(cursor)?;
            // Only RESP2 arrays have a null form.
            if count == -1 && prefix == b'*' {
                return Ok(cursor.position() as usize);
            }
            if count < 0 {
                return Err(Error::Protocol("negative aggregate length".into()));
            }
            for _ in 0..count {
                check_complete(cursor)?;
            }
        }
        prefix @ (b'%' | b'|') => {
            let count = read_decimal(cursor)?;
            if count < 0 {
                return Err(Error::Protocol("negative map length".into()));
            }
            for _ in 0..count * 2 {
                check_complete(cursor)?;
            }
            // An attribute frame annotates the value that follows it.
            if prefix == b'|' {
                check_complete(cursor)?;
            }
        }
        byte => return Err(Error::Protocol(format!("unexpected byte: 0x{:02x}", byte))),
    }
    Ok(cursor.position() as usize)
}

/// Parse a value from the cursor (assumes complete data).
fn parse_value(cursor: &mut Cursor<&[u8]>) -> Result<Value> {
    match get_byte(cursor)? {
        b'+' => Ok(Value::Status(read_utf8_line(cursor)?)),
        b'-' => Ok(Value::Error(read_utf8_line(cursor)?)),
        b':' => Ok(Value::Integer(read_decimal(cursor)?)),
        b'_' => {
            read_line(cursor)?;
            Ok(Value::Nil)
        }
        b'#' => match read_line(cursor)? {
            b"t" => Ok(Value::Boolean(true)),
            b"f" => Ok(Value::Boolean(false)),
            other => Err(Error::Protocol(format!(
                "invalid boolean: {}",
                String::from_utf8_lossy(other)
            ))),
        },
        b',' => {
            let line = read_utf8_line(cursor)?;
            let d = match line.as_str() {
                "inf" => f64::INFINITY,
                "-inf" => f64::NEG_INFINITY,
                s => s
                    .parse::<f64>()
                    .map_err(|_| Error::Protocol(format!("invalid double: {}", s)))?,
            };
            Ok(Value::Double(d))
        }
        b'(' => {
            let line = read_line(cursor)?;
            Ok(Value::String(Bytes::copy_from_slice(line)))
        }
        b'$' => match read_blob(cursor)? {
            Some(data) => Ok(Value::String(Bytes::copy_from_slice(data))),
            None => Ok(Value::Nil),
        },
        b'!' => {
            let data = read_blob(cursor)?.unwrap_or_default();
            Ok(Value::Error(String::from_utf8_lossy(data).into_owned()))
        }
        b'=' => {
            let data = read_blob(cursor)?.unwrap_or_default();
            // Verbatim strings carry a three byte format tag and a colon.
            let body = if data.len() >= 4 && data[3] == b':' {
                &data[4..]
            } else {
                data
            };
            Ok(Value::String(Bytes::copy_from_slice(body)))
        }
        b'*' => {
            let count = read_decimal(cursor)?;
            if count == -1 {
                return Ok(Value::Nil);
            }
            Ok(Value::Array(parse_elements(cursor, count as usize)?))
        }
        b'~' => {
            let count = read_decimal(cursor)?;
            Ok(Value::Array(parse_elements(cursor, count as usize)?))
        }
        b'>' => {
            let count = read_decimal(cursor)?;
            Ok(Value::Push(parse_elements(cursor, count as usize)?))
        }
        b'%' => {
            let count = read_decimal(cursor)? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = parse_value(cursor)?;
                let value = parse_value(cursor)?;
                entries.push((key, value));
            }
            Ok(Value::Map(entries))
        }
        b'|' => {
            let count = read_decimal(cursor)? as usize;
            for _ in 0..count * 2 {
                parse_value(cursor)?;
            }
            parse_value(cursor)
        }
        byte => Err(Error::Protocol(format!("unexpected byte: 0x{:02x}", byte))),
    }
}

fn parse_elements(cursor: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(parse_value(cursor)?);
    }
    Ok(values)
}

// ── Low-level cursor helpers ────────────────────────────────────────────────

fn incomplete() -> Error {
    Error::Protocol(INCOMPLETE.into())
}

fn get_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let pos = cursor.position() as usize;
    if pos >= cursor.get_ref().len() {
        return Err(incomplete());
    }
    let byte = cursor.get_ref()[pos];
    cursor.advance(1);
    Ok(byte)
}

fn find_line(cursor: &mut Cursor<&[u8]>) -> Result<()> {
    read_line(cursor).map(|_| ())
}

fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8]> {
    let start = cursor.position() as usize;
    let buf: &'a [u8] = *cursor.get_ref();
    for i in start..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return Ok(&buf[start..i]);
        }
    }
    Err(incomplete())
}

fn read_utf8_line(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let line = read_line(cursor)?;
    String::from_utf8(line.to_vec()).map_err(|e| Error::Protocol(format!("invalid UTF-8: {}", e)))
}

fn read_decimal(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    let line = read_line(cursor)?;
    let s = std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("invalid UTF-8 in integer".into()))?;
    s.parse::<i64>()
        .map_err(|_| Error::Protocol(format!("invalid integer: {}", s)))
}

/// Read a length-prefixed payload; `None` for the `-1` null length.
fn read_blob<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<Option<&'a [u8]>> {
    let len = read_decimal(cursor)?;
    if len < 0 {
        return Ok(None);
    }
    let data = read_bytes(cursor, len as usize)?;
    skip_crlf(cursor)?;
    Ok(Some(data))
}

fn read_bytes<'a>(cursor: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8]> {
    let start = cursor.position() as usize;
    let buf: &'a [u8] = *cursor.get_ref();
    if start + n > buf.len() {
        return Err(incomplete());
    }
    cursor.set_position((start + n) as u64);
    Ok(&buf[start..start + n])
}

fn skip_crlf(cursor: &mut Cursor<&[u8]>) -> Result<()> {
    let pos = cursor.position() as usize;
    let buf = cursor.get_ref();
    if pos + 2 > buf.len() {
        return Err(incomplete());
    }
    if buf[pos] != b'\r' || buf[pos + 1] != b'\n' {
        return Err(Error::Protocol("expected CRLF".into()));
    }
    cursor.advance(2);
    Ok(())
}
