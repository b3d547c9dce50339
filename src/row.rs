//! Row snapshot reads.

use crate::batch::pair_fields;
use crate::commands;
use crate::error::Result;
use crate::record::FieldValue;
use crate::transport::Transport;

/// Read every field of the row stored at `row_key`.
///
/// Returns `None` when the row has no fields. A reply with a field but no
/// matching value is a protocol error: the stored row cannot be trusted.
pub async fn get<T: Transport + ?Sized>(
    conn: &mut T,
    row_key: &str,
) -> Result<Option<Vec<FieldValue>>> {
    let flat = commands::hgetall(conn, row_key).await?;
    if flat.is_empty() {
        return Ok(None);
    }
    pair_fields(flat).map(Some)
}
