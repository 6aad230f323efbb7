//! Terminator-aligned buffer partitioning
//!
//! A buffer is split into up to `C` byte ranges whose boundaries fall
//! immediately after a record terminator, so every partition starts a fresh
//! packet run and can be decoded independently. Boundaries are found by a
//! header-only packet walk: payload bytes are skipped, never interpreted, so
//! the scan is cheap relative to the decode itself.

use crate::errors::{DecodeError, Result};
use crate::packet::{is_terminator, PacketReader};
use std::ops::Range;

/// Plan up to `concurrency` terminator-aligned partitions.
///
/// A buffer that admits no partition boundary (no reachable terminator, or
/// one the scan cannot walk) errors with `PartitionBoundaryNotFound`; the
/// caller falls back to a single partition.
pub fn plan_partitions(buf: &[u8], concurrency: usize) -> Result<Vec<Range<usize>>> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let c = concurrency.max(1);
    if c == 1 {
        return Ok(vec![0..buf.len()]);
    }

    let boundaries = find_boundaries(buf, c);
    if boundaries.is_empty() {
        return Err(DecodeError::PartitionBoundaryNotFound);
    }

    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0;
    for b in boundaries {
        ranges.push(start..b);
        start = b;
    }
    ranges.push(start..buf.len());
    Ok(ranges)
}

/// Walk packets from offset 0, collecting the first post-terminator offset
/// at or after each target `k * len / c`. Stops early once all targets are
/// covered or the walk hits bytes it cannot frame (the decode proper will
/// report those).
fn find_boundaries(buf: &[u8], c: usize) -> Vec<usize> {
    let len = buf.len();
    let mut boundaries = Vec::new();
    let mut k = 1;
    let mut reader = PacketReader::new(buf, 0);

    while k < c {
        let pkt = match reader.next() {
            Some(Ok(pkt)) => pkt,
            // Unframable tail: leave it all to the last partition.
            Some(Err(_)) | None => break,
        };
        if pkt.ext_header.is_some() || !is_terminator(pkt.header) {
            continue;
        }
        let boundary = reader.offset();
        if boundary >= len {
            break;
        }
        if boundary >= k * len / c {
            boundaries.push(boundary);
            // One boundary may satisfy several targets; never duplicate it.
            while k < c && boundary >= k * len / c {
                k += 1;
            }
        }
    }
    boundaries
}
