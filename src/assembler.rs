//! Record assembly state machine
//!
//! Folds a run of decoded packets, from one terminator to the next, into one
//! [`Record`]. A record run is closed by an end-of-record packet, or by a
//! timestamp packet when timestamps are enabled (the timestamp then belongs
//! to the record it closes). Sticky context (exception level, context id,
//! previous branch target) survives across runs within one partition and is
//! seeded into every new record until overwritten.
//!
//! Same-field repeats within one run are last-write-wins: the hardware may
//! re-emit an address or counter register.

use crate::decode::{
    AddressPacket, CounterKind, DataSource, EventSet, OpType, Payload, EV_L1D_ACCESS,
    EV_L1D_REFILL, EV_LLC_ACCESS, EV_LLC_REFILL, EV_REMOTE_ACCESS, EV_TLB_ACCESS, EV_TLB_REFILL,
};
use crate::record::{BranchRecord, LoadStoreRecord, OtherRecord, Record};

/// Virtual addresses recorded at EL2 are missing the 0xff top byte.
const EL2_HIGH_BYTE: u64 = 0xff << 56;

/// Events that an erratum can leave set on non-memory samples; scrubbed
/// from Other records (Arm SDEN 885747 #1912195).
const EV_NOT_IN_OTHER: u64 = EV_L1D_ACCESS
    | EV_L1D_REFILL
    | EV_TLB_ACCESS
    | EV_TLB_REFILL
    | EV_LLC_ACCESS
    | EV_LLC_REFILL
    | EV_REMOTE_ACCESS;

fn fix_el2(addr: u64, level: u8) -> u64 {
    if level == 2 {
        addr | EL2_HIGH_BYTE
    } else {
        addr
    }
}

/// Sticky per-partition state threaded through consecutive record runs.
/// Never shared across partitions; each worker starts fresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub el: Option<u8>,
    pub context_id: Option<u64>,
    /// Most recent previous-branch-target address and its exception level.
    pub pbt: Option<(u64, u8)>,
}

/// Fields accumulated for the in-progress record.
#[derive(Debug, Clone, Default)]
struct RecordBuilder {
    op: Option<OpType>,
    pc: Option<u64>,
    el: Option<u8>,
    ts: Option<u64>,
    events: EventSet,
    br_tgt: Option<(u64, u8)>,
    pbt: Option<(u64, u8)>,
    vaddr: Option<u64>,
    paddr: Option<u64>,
    data_source: Option<DataSource>,
    context: Option<u64>,
    total_lat: u16,
    issue_lat: u16,
    xlat_lat: u16,
}

impl RecordBuilder {
    fn seeded(ctx: &Context) -> RecordBuilder {
        RecordBuilder {
            el: ctx.el,
            context: ctx.context_id,
            pbt: ctx.pbt,
            ..RecordBuilder::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating,
}

/// Folds decoded packets into records. One per partition worker.
#[derive(Debug)]
pub struct Assembler {
    state: State,
    ctx: Context,
    builder: RecordBuilder,
    cpu: i32,
}

impl Assembler {
    pub fn new(cpu: i32) -> Assembler {
        Assembler {
            state: State::Idle,
            ctx: Context::default(),
            builder: RecordBuilder::default(),
            cpu,
        }
    }

    /// Current sticky context, mainly for inspection in tests.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Fold one decoded packet. Returns a finalized record when the packet
    /// closed a run.
    pub fn feed(&mut self, payload: &Payload<'_>) -> Option<Record> {
        match payload {
            Payload::Pad => None,
            Payload::End => {
                if self.state == State::Accumulating {
                    Some(self.finalize(false))
                } else {
                    None
                }
            }
            Payload::Timestamp(ts) => {
                if self.state == State::Accumulating {
                    self.builder.ts = Some(*ts);
                    Some(self.finalize(false))
                } else {
                    // A terminator with no run in progress closes nothing.
                    None
                }
            }
            other => {
                if self.state == State::Idle {
                    self.builder = RecordBuilder::seeded(&self.ctx);
                    self.state = State::Accumulating;
                }
                self.fold(other);
                None
            }
        }
    }

    /// Finalize the in-progress record at end of buffer, marked truncated.
    pub fn flush_truncated(&mut self) -> Option<Record> {
        if self.state == State::Accumulating {
            Some(self.finalize(true))
        } else {
            None
        }
    }

    fn fold(&mut self, payload: &Payload<'_>) {
        let b = &mut self.builder;
        match payload {
            Payload::Events(ev) => b.events = *ev,
            Payload::DataSource(src) => b.data_source = Some(*src),
            Payload::ContextId { id, .. } => {
                b.context = Some(*id);
                self.ctx.context_id = Some(*id);
            }
            Payload::OpType(op) => b.op = Some(*op),
            Payload::Address(addr) => match *addr {
                AddressPacket::Instruction { addr, el, .. } => {
                    b.pc = Some(addr);
                    b.el = Some(el);
                    self.ctx.el = Some(el);
                }
                AddressPacket::BranchTarget { addr, el, .. } => b.br_tgt = Some((addr, el)),
                AddressPacket::PrevBranchTarget { addr, el, .. } => {
                    b.pbt = Some((addr, el));
                    self.ctx.pbt = Some((addr, el));
                }
                AddressPacket::DataVirtual { addr } => b.vaddr = Some(addr),
                AddressPacket::DataPhysical { addr, .. } => b.paddr = Some(addr),
                AddressPacket::Unknown { .. } => {}
            },
            Payload::Counter { kind, value } => match kind {
                CounterKind::TotalLatency => b.total_lat = *value,
                CounterKind::IssueLatency => b.issue_lat = *value,
                CounterKind::TranslationLatency => b.xlat_lat = *value,
                CounterKind::Unknown(_) => {}
            },
            Payload::Unknown { .. } => {}
            // Terminators and pads never reach fold().
            Payload::Pad | Payload::End | Payload::Timestamp(_) => {}
        }
    }

    fn finalize(&mut self, truncated: bool) -> Record {
        let b = std::mem::take(&mut self.builder);
        self.state = State::Idle;

        let el = b.el.unwrap_or(0);
        let pc = b.pc.map(|a| fix_el2(a, el));

        let record = match b.op {
            Some(OpType::LoadStore {
                op,
                atomic,
                excl,
                ar,
                subclass,
                sve,
            }) => {
                let subclass_name = if atomic || excl || ar {
                    ""
                } else if sve.is_some() {
                    "SVE"
                } else {
                    subclass.name()
                };
                let sve = sve.unwrap_or_default();
                Record::LoadStore(LoadStoreRecord {
                    cpu: self.cpu,
                    op,
                    pc,
                    el: b.el,
                    atomic,
                    excl,
                    ar,
                    subclass: subclass_name,
                    event: b.events,
                    issue_lat: b.issue_lat,
                    total_lat: b.total_lat,
                    xlat_lat: b.xlat_lat,
                    vaddr: b.vaddr.map(|a| fix_el2(a, el)),
                    paddr: b.paddr,
                    data_source: b.data_source,
                    context: b.context,
                    ts: b.ts,
                    sve_evl: sve.evl,
                    sve_pred: sve.pred,
                    sve_sg: sve.sg,
                    truncated,
                    symbol: None,
                })
            }
            Some(OpType::Branch { cond, indirect }) => Record::Branch(BranchRecord {
                cpu: self.cpu,
                pc,
                el: b.el,
                condition: cond,
                indirect,
                event: b.events,
                issue_lat: b.issue_lat,
                total_lat: b.total_lat,
                br_tgt: b.br_tgt.map(|(a, lvl)| fix_el2(a, lvl)),
                br_tgt_lvl: b.br_tgt.map(|(_, lvl)| lvl),
                pbt: b.pbt.map(|(a, lvl)| fix_el2(a, lvl)),
                pbt_lvl: b.pbt.map(|(_, lvl)| lvl),
                context: b.context,
                ts: b.ts,
                truncated,
                symbol: None,
            }),
            op => {
                let (subclass, condition, sve) = match op {
                    Some(OpType::Other { cond_select }) => ("OTHER", cond_select, None),
                    Some(OpType::SveOther(flags)) => ("SVE", false, Some(flags)),
                    // No operation-type packet observed, or a class this
                    // decoder does not know: still an Other record.
                    _ => ("", false, None),
                };
                let sve = sve.unwrap_or_default();
                Record::Other(OtherRecord {
                    cpu: self.cpu,
                    subclass,
                    condition,
                    sve_evl: sve.evl,
                    sve_fp: sve.fp,
                    sve_pred: sve.pred,
                    pc,
                    el: b.el,
                    event: b.events.without(EV_NOT_IN_OTHER),
                    issue_lat: b.issue_lat,
                    total_lat: b.total_lat,
                    context: b.context,
                    ts: b.ts,
                    truncated,
                    symbol: None,
                })
            }
        };
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, MemOp};
    use crate::packet::PacketReader;
    use crate::record::Record;

    fn bytes(hex: &str) -> Vec<u8> {
        hex.split_whitespace()
            .map(|b| u8::from_str_radix(b, 16).unwrap())
            .collect()
    }

    fn run(hex: &str, cpu: i32) -> (Vec<Record>, Assembler) {
        let buf = bytes(hex);
        let mut asm = Assembler::new(cpu);
        let mut out = Vec::new();
        for pkt in PacketReader::new(&buf, 0) {
            let pkt = pkt.unwrap();
            if let Some(rec) = asm.feed(&decode(&pkt)) {
                out.push(rec);
            }
        }
        if let Some(rec) = asm.flush_truncated() {
            out.push(rec);
        }
        (out, asm)
    }

    // Golden frame from the architected format: a complete load sample with
    // a leading timestamp that terminates the previous (empty) run.
    const LOAD_FRAME: &str = "71 af f9 04 81 00 0c 00 00 \
         b0 00 b6 a9 e4 aa aa 00 80 \
         49 00 \
         52 16 00 \
         99 04 00 \
         98 08 00 \
         b2 43 da 5d e6 aa aa 00 00 \
         9a 01 00 \
         b3 43 5a 95 2c 03 08 00 80 \
         43 00";

    #[test]
    fn test_assemble_load_record_from_golden_frame() {
        let (records, _) = run(LOAD_FRAME, 7);
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::LoadStore(r) => {
                assert_eq!(r.cpu, 7);
                assert_eq!(r.op, MemOp::Load);
                assert_eq!(r.pc, Some(0xaaaa_e4a9_b600));
                assert_eq!(r.el, Some(0));
                assert_eq!(r.subclass, "GP-REG");
                assert_eq!(r.event.to_string(), "RETIRED:L1D-ACCESS:TLB-ACCESS");
                assert_eq!(r.issue_lat, 4);
                assert_eq!(r.total_lat, 8);
                assert_eq!(r.xlat_lat, 1);
                assert_eq!(r.vaddr, Some(0xaaaa_e65d_da43));
                assert_eq!(r.paddr, Some(0x803_2c95_5a43));
                assert_eq!(r.data_source, Some(DataSource::L1d));
                // No trailing terminator: the record is flushed as truncated.
                assert!(r.truncated);
                assert_eq!(r.ts, None);
            }
            other => panic!("expected load/store record, got {:?}", other),
        }
    }

    #[test]
    fn test_timestamp_terminates_and_stamps_record() {
        // PC + branch op closed by a timestamp packet.
        let (records, _) = run(
            "b0 00 b6 a9 e4 aa aa 00 80 4a 01 71 6c f8 a5 83 00 0c 00 00",
            0,
        );
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Branch(r) => {
                assert_eq!(r.ts, Some(13_196_348_225_644));
                assert!(r.condition);
                assert!(!r.truncated);
            }
            other => panic!("expected branch record, got {:?}", other),
        }
    }

    #[test]
    fn test_branch_record_with_target_and_el2_fix() {
        let (records, _) = run(
            "b0 5c 8b 8c 86 c2 c0 ff c0 \
             4a 00 \
             b1 e0 89 8c 86 c2 c0 ff c0 \
             01",
            0,
        );
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Branch(r) => {
                // EL2 samples gain the missing 0xff top byte.
                assert_eq!(r.pc, Some(0xffff_c0c2_868c_8b5c));
                assert_eq!(r.el, Some(2));
                assert_eq!(r.br_tgt, Some(0xffff_c0c2_868c_89e0));
                assert_eq!(r.br_tgt_lvl, Some(2));
                assert!(!r.condition);
                assert!(!r.indirect);
            }
            other => panic!("expected branch record, got {:?}", other),
        }
    }

    #[test]
    fn test_sticky_context_carries_across_records() {
        // First run sets a context id and a previous branch target; the
        // second run carries neither packet but inherits both.
        let (records, asm) = run(
            "64 80 44 85 86 \
             b4 e0 89 8c 86 c2 c0 ff c0 \
             4a 00 \
             01 \
             b0 00 b6 a9 e4 aa aa 00 80 \
             4a 01 \
             01",
            0,
        );
        assert_eq!(records.len(), 2);
        match &records[1] {
            Record::Branch(r) => {
                assert_eq!(r.context, Some(0x8685_4480));
                assert_eq!(r.pbt, Some(0xffff_c0c2_868c_89e0));
                assert_eq!(r.pbt_lvl, Some(2));
            }
            other => panic!("expected branch record, got {:?}", other),
        }
        assert_eq!(asm.context().context_id, Some(0x8685_4480));
    }

    #[test]
    fn test_last_write_wins_on_repeated_field() {
        // Two total-latency counters in one run: the second wins.
        let (records, _) = run("b0 00 b6 a9 e4 aa aa 00 80 49 00 98 05 00 98 09 00 01", 0);
        match &records[0] {
            Record::LoadStore(r) => assert_eq!(r.total_lat, 9),
            other => panic!("expected load/store record, got {:?}", other),
        }
    }

    #[test]
    fn test_run_without_op_type_is_other() {
        let (records, _) = run("b0 00 b6 a9 e4 aa aa 00 80 52 02 00 01", 0);
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Other(r) => {
                assert_eq!(r.subclass, "");
                assert_eq!(r.pc, Some(0xaaaa_e4a9_b600));
            }
            other => panic!("expected other record, got {:?}", other),
        }
    }

    #[test]
    fn test_other_record_scrubs_memory_events() {
        // RETIRED + L1D-ACCESS + TLB-ACCESS on an "other" op: memory events
        // are scrubbed per the erratum.
        let (records, _) = run("48 00 52 16 00 01", 0);
        match &records[0] {
            Record::Other(r) => {
                assert_eq!(r.subclass, "OTHER");
                assert_eq!(r.event.to_string(), "RETIRED");
            }
            other => panic!("expected other record, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_runs_emit_nothing() {
        // Terminators and pads with no packets in between produce no records.
        let (records, _) = run("01 00 00 01 71 6c f8 a5 83 00 0c 00 00 01", 0);
        assert!(records.is_empty());
    }

    #[test]
    fn test_folding_order_independent_for_disjoint_fields() {
        let a = run("b0 00 b6 a9 e4 aa aa 00 80 49 00 98 08 00 99 04 00 01", 0);
        let b = run("99 04 00 98 08 00 49 00 b0 00 b6 a9 e4 aa aa 00 80 01", 0);
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn test_atomic_clears_subclass_name() {
        let (records, _) = run("49 16 01", 0);
        match &records[0] {
            Record::LoadStore(r) => {
                assert!(r.atomic);
                assert!(r.ar);
                assert_eq!(r.subclass, "");
            }
            other => panic!("expected load/store record, got {:?}", other),
        }
    }

    #[test]
    fn test_sve_load_fields() {
        let (records, _) = run("49 98 01", 0);
        match &records[0] {
            Record::LoadStore(r) => {
                assert_eq!(r.subclass, "SVE");
                assert_eq!(r.sve_evl, 64);
                assert!(r.sve_sg);
                assert!(!r.sve_pred);
            }
            other => panic!("expected load/store record, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_packet_does_not_derail_run() {
        // A reserved-class packet inside a run is preserved opaquely and the
        // surrounding recognized packets still assemble.
        let (records, _) = run("b0 00 b6 a9 e4 aa aa 00 80 44 7f 49 00 01", 0);
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], Record::LoadStore(_)));
    }
}
