//! Spedec - Arm SPE trace buffer decoder
//!
//! This library decodes Statistical Profiling Extension (SPE) trace buffers
//! into typed load/store, branch and "other" sample records, decoding large
//! buffers concurrently while preserving source order, and exposes the three
//! record tables plus per-partition diagnostics for downstream writers.

pub mod assembler;
pub mod cli;
pub mod decode;
pub mod errors;
pub mod output;
pub mod packet;
pub mod partition;
pub mod record;
pub mod schema;
pub mod session;
pub mod symbols;

pub use errors::DecodeError;
pub use record::{BranchRecord, LoadStoreRecord, OtherRecord, Record, RecordKind};
pub use session::{
    DecodeOutput, Diagnostics, KindFilter, SegmentMeta, Session, SessionConfig, Tables,
    TraceSegment,
};
