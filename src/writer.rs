//! Scatter/gather writes for frames made of many small parts.
//!
//! A frame is a frame header record followed by, per message, a header
//! record and a payload segment. Instead of copying those parts into one
//! buffer, both pumps hand them to [`write_parts`] as a slice list and let
//! `write_vectored` push as many as the kernel accepts per syscall.

use std::io::IoSlice;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{FramewireError, Result};

/// Write every part in order, then flush.
///
/// Empty parts are skipped. Partial vectored writes are resumed from the
/// first unwritten byte.
pub async fn write_parts<W>(writer: &mut W, parts: &[&[u8]]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = parts.iter().map(|p| p.len()).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(parts, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(FramewireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after `skip_bytes` were written.
fn build_remaining_slices<'a>(parts: &[&'a [u8]], skip_bytes: usize) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(parts.len());
    let mut offset = 0;

    for part in parts {
        let start = offset;
        let end = offset + part.len();
        offset = end;

        if part.is_empty() || skip_bytes >= end {
            continue;
        }
        let start_in_part = skip_bytes.saturating_sub(start);
        slices.push(IoSlice::new(&part[start_in_part..]));
    }

    slices
}
