//! Decode session: partitioned, parallel record extraction
//!
//! Ties the pipeline together: partition planning, one worker per partition
//! running read → decode → assemble → classify with a private sticky
//! context, then an ownership-transferring merge in partition-index order so
//! the per-kind output tables are always in source order regardless of
//! scheduling.

use crate::assembler::Assembler;
use crate::decode::{decode, Payload};
use crate::errors::{DecodeError, Result};
use crate::packet::{classify_header, HeaderClass, PacketReader};
use crate::partition::plan_partitions;
use crate::record::{BranchRecord, LoadStoreRecord, OtherRecord, Record};
use crate::symbols::SymbolProvider;
use serde::Serialize;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// How many bytes to skip, at most, when resynchronizing after an
/// unclassifiable header before abandoning the partition.
const RESYNC_WINDOW: usize = 64;

/// Metadata supplied by an external container reader for one trace segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentMeta {
    pub pid: u32,
    pub tid: u32,
    pub cpu: i32,
    pub base_timestamp: u64,
    /// Execution mode string index as recorded by the container, if any.
    pub exec_mode: Option<u32>,
}

/// One contiguous run of SPE trace bytes, with container metadata when the
/// caller has any ("raw buffer" inputs carry none).
#[derive(Debug, Clone, Copy)]
pub struct TraceSegment<'a> {
    pub data: &'a [u8],
    pub meta: Option<SegmentMeta>,
}

impl<'a> TraceSegment<'a> {
    pub fn raw(data: &'a [u8]) -> TraceSegment<'a> {
        TraceSegment { data, meta: None }
    }

    pub fn with_meta(data: &'a [u8], meta: SegmentMeta) -> TraceSegment<'a> {
        TraceSegment {
            data,
            meta: Some(meta),
        }
    }
}

/// Per-kind record toggles. A disabled kind is dropped at emit time and its
/// table stays empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindFilter {
    pub load_store: bool,
    pub branch: bool,
    pub other: bool,
}

impl Default for KindFilter {
    fn default() -> Self {
        KindFilter {
            load_store: true,
            branch: true,
            other: true,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Worker count; 0 or 1 decodes on the calling thread. The caller picks
    /// the value (the CLI defaults it to the host's parallelism).
    pub concurrency: usize,
    pub kinds: KindFilter,
    /// Cooperative abort flag, checked at packet granularity.
    pub abort: Option<Arc<AtomicBool>>,
}

/// The three per-kind output tables, each in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    pub load_store: Vec<LoadStoreRecord>,
    pub branch: Vec<BranchRecord>,
    pub other: Vec<OtherRecord>,
}

impl Tables {
    pub fn is_empty(&self) -> bool {
        self.load_store.is_empty() && self.branch.is_empty() && self.other.is_empty()
    }

    pub fn len(&self) -> usize {
        self.load_store.len() + self.branch.len() + self.other.len()
    }

    fn push(&mut self, record: Record, kinds: &KindFilter) {
        match record {
            Record::LoadStore(r) if kinds.load_store => self.load_store.push(r),
            Record::Branch(r) if kinds.branch => self.branch.push(r),
            Record::Other(r) if kinds.other => self.other.push(r),
            _ => {}
        }
    }

    fn append(&mut self, mut other: Tables) {
        self.load_store.append(&mut other.load_store);
        self.branch.append(&mut other.branch);
        self.other.append(&mut other.other);
    }
}

/// Decode health counters, summed over partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Packets successfully framed and decoded.
    pub packets: u64,
    /// Reserved/unrecognized packet classes preserved opaquely.
    pub unknown_packets: u64,
    /// Packets whose declared width overran the buffer.
    pub truncated_packets: u64,
    /// Records flushed without a terminator and marked truncated.
    pub truncated_records: u64,
    /// Headers that matched no class at all.
    pub bad_headers: u64,
    /// Bytes skipped while resynchronizing after a bad header.
    pub resync_bytes: u64,
    /// Partitions abandoned after resynchronization failed.
    pub abandoned_partitions: u64,
    /// Partitions decoded.
    pub partitions: u64,
}

impl Diagnostics {
    fn merge(&mut self, other: &Diagnostics) {
        self.packets += other.packets;
        self.unknown_packets += other.unknown_packets;
        self.truncated_packets += other.truncated_packets;
        self.truncated_records += other.truncated_records;
        self.bad_headers += other.bad_headers;
        self.resync_bytes += other.resync_bytes;
        self.abandoned_partitions += other.abandoned_partitions;
        self.partitions += other.partitions;
    }
}

/// Result of decoding one segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeOutput {
    pub tables: Tables,
    pub diags: Diagnostics,
}

/// A configured decode pipeline. Cheap to construct; one per input.
#[derive(Debug, Clone, Default)]
pub struct Session {
    config: SessionConfig,
}

impl Session {
    pub fn new(config: SessionConfig) -> Session {
        Session { config }
    }

    /// Decode one trace segment into per-kind record tables.
    ///
    /// Only a buffer that cannot be read at all is fatal: empty input, or an
    /// unclassifiable header at offset 0. Everything else degrades into
    /// diagnostics on a per-partition basis.
    pub fn decode(&self, segment: &TraceSegment<'_>) -> Result<DecodeOutput> {
        let buf = segment.data;
        if buf.is_empty() {
            return Err(DecodeError::EmptyBuffer);
        }
        if classify_header(buf[0]) == HeaderClass::Bad {
            return Err(DecodeError::MalformedStream {
                offset: 0,
                header: buf[0],
            });
        }

        let cpu = segment.meta.map_or(-1, |m| m.cpu);
        let ranges = match plan_partitions(buf, self.config.concurrency.max(1)) {
            Ok(ranges) => ranges,
            Err(DecodeError::PartitionBoundaryNotFound) => {
                warn!("no record boundary found while partitioning; decoding as a single partition");
                vec![0..buf.len()]
            }
            Err(other) => return Err(other),
        };
        debug!(partitions = ranges.len(), bytes = buf.len(), "decoding segment");

        let outputs = if ranges.len() == 1 {
            vec![self.decode_partition(buf, ranges[0].clone(), cpu)]
        } else {
            self.decode_parallel(buf, &ranges, cpu)
        };

        let mut merged = DecodeOutput::default();
        for out in outputs {
            let part = out?;
            merged.tables.append(part.tables);
            merged.diags.merge(&part.diags);
        }
        Ok(merged)
    }

    /// Decode a segment and annotate instruction addresses with symbols.
    /// Symbolization runs batched after the merge, never inside the decode
    /// pipeline.
    pub fn decode_symbolized(
        &self,
        segment: &TraceSegment<'_>,
        provider: &dyn SymbolProvider,
    ) -> Result<DecodeOutput> {
        let mut out = self.decode(segment)?;
        crate::symbols::annotate_tables(&mut out.tables, provider);
        Ok(out)
    }

    fn decode_parallel(
        &self,
        buf: &[u8],
        ranges: &[Range<usize>],
        cpu: i32,
    ) -> Vec<Result<DecodeOutput>> {
        crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .map(|range| {
                    let range = range.clone();
                    scope.spawn(move |_| self.decode_partition(buf, range, cpu))
                })
                .collect();
            // Join in partition-index order, which equals source order.
            handles
                .into_iter()
                .map(|h| h.join().expect("partition worker panicked"))
                .collect()
        })
        .expect("decode scope panicked")
    }

    fn aborted(&self) -> bool {
        self.config
            .abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Run the full pipeline over one partition with a private context.
    fn decode_partition(&self, buf: &[u8], range: Range<usize>, cpu: i32) -> Result<DecodeOutput> {
        let base = range.start;
        let chunk = &buf[range];
        let mut reader = PacketReader::new(chunk, 0);
        let mut asm = Assembler::new(cpu);
        let mut tables = Tables::default();
        let mut diags = Diagnostics {
            partitions: 1,
            ..Diagnostics::default()
        };

        loop {
            if self.aborted() {
                return Err(DecodeError::Cancelled);
            }
            match reader.next() {
                None => break,
                Some(Ok(pkt)) => {
                    diags.packets += 1;
                    let payload = decode(&pkt);
                    if matches!(payload, Payload::Unknown { .. }) {
                        diags.unknown_packets += 1;
                    }
                    if let Some(record) = asm.feed(&payload) {
                        tables.push(record, &self.config.kinds);
                    }
                }
                Some(Err(DecodeError::TruncatedPacket { offset, .. })) => {
                    // Legitimate at a partition tail; the in-progress record
                    // is flushed below, marked truncated.
                    debug!(offset = base + offset, "truncated packet at partition tail");
                    diags.truncated_packets += 1;
                    break;
                }
                Some(Err(DecodeError::MalformedStream { offset, header })) => {
                    diags.bad_headers += 1;
                    match resync(chunk, offset) {
                        Some(next) => {
                            warn!(
                                offset = base + offset,
                                header,
                                skipped = next - offset - 1,
                                "bad header, resynchronized"
                            );
                            diags.resync_bytes += (next - offset - 1) as u64;
                            reader = PacketReader::new(chunk, next);
                        }
                        None => {
                            warn!(
                                offset = base + offset,
                                header, "bad header, abandoning partition"
                            );
                            diags.abandoned_partitions += 1;
                            break;
                        }
                    }
                }
                Some(Err(other)) => return Err(other),
            }
        }

        if let Some(record) = asm.flush_truncated() {
            diags.truncated_records += 1;
            tables.push(record, &self.config.kinds);
        }
        Ok(DecodeOutput { tables, diags })
    }
}

/// Skip forward from a bad header to the next byte that frames as a known
/// packet class, within a bounded window. Returns the offset to resume at.
fn resync(buf: &[u8], bad_offset: usize) -> Option<usize> {
    let start = bad_offset + 1;
    let end = (start + RESYNC_WINDOW).min(buf.len());
    (start..end).find(|&o| classify_header(buf[o]) != HeaderClass::Bad)
}
