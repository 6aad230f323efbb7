//! Error taxonomy for SPE decoding
//!
//! Decode-local failures (truncated or unclassifiable packets) are recovered
//! inside the owning partition and surface only through the diagnostic
//! counters; the variants here are returned to callers when a failure is
//! fatal to a whole buffer or when a partition reports why it stopped.

use thiserror::Error;

/// Errors produced while decoding an SPE trace buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The input buffer contains no bytes at all.
    #[error("trace buffer is empty")]
    EmptyBuffer,

    /// A packet header declared more payload bytes than remain in the buffer.
    #[error("truncated packet at offset {offset}: header declares {needed} payload bytes, {available} remain")]
    TruncatedPacket {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A header byte matches no known packet class, not even as an opaque
    /// reserved encoding. Fatal only at offset 0; elsewhere the decoder
    /// resynchronizes within a bounded window.
    #[error("unclassifiable packet header {header:#04x} at offset {offset}")]
    MalformedStream { offset: usize, header: u8 },

    /// No record terminator was found while planning partitions. The caller
    /// falls back to single-partition decode.
    #[error("no record boundary found while partitioning buffer")]
    PartitionBoundaryNotFound,

    /// The run was aborted through the session's abort flag.
    #[error("decode cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DecodeError>;
