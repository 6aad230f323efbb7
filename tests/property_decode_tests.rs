//! Property-based tests for the decode pipeline
//!
//! Properties covered:
//! 1. Arbitrary input bytes never panic the decoder
//! 2. Cutting a valid trace at any offset damages at most one record
//! 3. Partitioned decoding is indistinguishable from single-threaded decoding

use proptest::prelude::*;
use spedec::{Session, SessionConfig, TraceSegment};

/// A complete load sample terminated by an END packet.
const LOAD_FRAME: &str = "b0 00 b6 a9 e4 aa aa 00 80 \
     49 00 \
     52 16 00 \
     99 04 00 \
     98 08 00 \
     b2 43 da 5d e6 aa aa 00 00 \
     9a 01 00 \
     b3 43 5a 95 2c 03 08 00 80 \
     43 00 \
     01";

/// A mispredicted conditional branch, END-terminated.
const BRANCH_FRAME: &str = "b0 04 b6 a9 e4 aa aa 00 80 \
     4a 01 \
     52 80 00 \
     b1 40 b7 a9 e4 aa aa 00 80 \
     01";

fn bytes(hex: &str) -> Vec<u8> {
    hex.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).unwrap())
        .collect()
}

fn session(concurrency: usize) -> Session {
    Session::new(SessionConfig {
        concurrency,
        ..SessionConfig::default()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        // Property: any input produces either an output or an error, never
        // a panic. Errors are only ever EmptyBuffer or a bad leading header.
        let _ = session(1).decode(&TraceSegment::raw(&data));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_truncation_damages_at_most_one_record(
        frames in 1usize..6,
        cut_frac in 0.0f64..1.0,
    ) {
        let frame = bytes(LOAD_FRAME);
        let mut buf = Vec::new();
        for _ in 0..frames {
            buf.extend_from_slice(&frame);
        }
        let cut = 1 + ((buf.len() - 1) as f64 * cut_frac) as usize;
        buf.truncate(cut);

        let out = session(1).decode(&TraceSegment::raw(&buf)).unwrap();
        prop_assert!(out.diags.truncated_packets <= 1);
        prop_assert!(out.diags.truncated_records <= 1);
        prop_assert_eq!(out.diags.bad_headers, 0);

        // Complete frames each produce exactly one record; the cut tail adds
        // at most one truncated record.
        let complete = cut / frame.len();
        let total = out.tables.load_store.len();
        prop_assert!(total >= complete, "lost a complete record: {} < {}", total, complete);
        prop_assert!(total <= complete + 1);
        let truncated = out.tables.load_store.iter().filter(|r| r.truncated).count() as u64;
        prop_assert_eq!(truncated, out.diags.truncated_records);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_partition_count_does_not_change_output(
        frames in 1usize..40,
        concurrency in 2usize..9,
    ) {
        let load = bytes(LOAD_FRAME);
        let branch = bytes(BRANCH_FRAME);
        let mut buf = Vec::new();
        for i in 0..frames {
            buf.extend_from_slice(if i % 2 == 0 { &load } else { &branch });
        }
        let segment = TraceSegment::raw(&buf);

        let serial = session(1).decode(&segment).unwrap();
        let parallel = session(concurrency).decode(&segment).unwrap();

        prop_assert_eq!(&serial.tables, &parallel.tables);
        prop_assert_eq!(serial.diags.packets, parallel.diags.packets);
        prop_assert_eq!(serial.diags.truncated_records, parallel.diags.truncated_records);
    }
}
