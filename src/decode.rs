//! Typed SPE packet decoding
//!
//! Interprets a framed [`RawPacket`] as one closed [`Payload`] variant. The
//! record assembler pattern-matches over this enum, so adding a packet class
//! is a compile-time-checked change. Reserved header encodings decode to
//! [`Payload::Unknown`] with their payload preserved: newer format revisions
//! (the SVE operation fields, the previous-branch-target address) were added
//! without disturbing older packets, and the decoder must extend the same
//! courtesy forward.

use crate::packet::{classify_header, HeaderClass, RawPacket, HDR_EXT_ALIGNMENT};
use serde::Serialize;
use std::fmt;

fn mask(high: u32, low: u32) -> u64 {
    let high_mask = if high >= 63 {
        u64::MAX
    } else {
        (1u64 << (high + 1)) - 1
    };
    high_mask & !((1u64 << low) - 1)
}

/// Sampled-event bitmap carried by an events packet.
///
/// Bit positions are architected; names render in ascending bit order,
/// colon-separated, e.g. `RETIRED:L1D-ACCESS:TLB-ACCESS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(pub u64);

pub const EV_EXCEPTION_GEN: u64 = 1 << 0;
pub const EV_RETIRED: u64 = 1 << 1;
pub const EV_L1D_ACCESS: u64 = 1 << 2;
pub const EV_L1D_REFILL: u64 = 1 << 3;
pub const EV_TLB_ACCESS: u64 = 1 << 4;
pub const EV_TLB_REFILL: u64 = 1 << 5;
pub const EV_NOT_TAKEN: u64 = 1 << 6;
pub const EV_MISPRED: u64 = 1 << 7;
pub const EV_LLC_ACCESS: u64 = 1 << 8;
pub const EV_LLC_REFILL: u64 = 1 << 9;
pub const EV_REMOTE_ACCESS: u64 = 1 << 10;
pub const EV_ALIGNMENT: u64 = 1 << 11;
pub const EV_LATE_PREFETCH: u64 = 1 << 12;
pub const EV_SVE_PARTIAL_PRED: u64 = 1 << 17;
pub const EV_SVE_EMPTY_PRED: u64 = 1 << 18;

const EVENT_NAMES: &[(u64, &str)] = &[
    (EV_EXCEPTION_GEN, "EXCEPTION-GEN"),
    (EV_RETIRED, "RETIRED"),
    (EV_L1D_ACCESS, "L1D-ACCESS"),
    (EV_L1D_REFILL, "L1D-REFILL"),
    (EV_TLB_ACCESS, "TLB-ACCESS"),
    (EV_TLB_REFILL, "TLB-REFILL"),
    (EV_NOT_TAKEN, "NOT-TAKEN"),
    (EV_MISPRED, "MISPRED"),
    (EV_LLC_ACCESS, "LLC-ACCESS"),
    (EV_LLC_REFILL, "LLC-REFILL"),
    (EV_REMOTE_ACCESS, "REMOTE-ACCESS"),
    (EV_ALIGNMENT, "ALIGNMENT"),
    (EV_LATE_PREFETCH, "LATE-PREFETCH"),
    (EV_SVE_PARTIAL_PRED, "SVE-PARTIAL-PRED"),
    (EV_SVE_EMPTY_PRED, "SVE-EMPTY-PRED"),
];

impl EventSet {
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    /// Remove the given bits, returning the reduced set.
    pub fn without(&self, bits: u64) -> EventSet {
        EventSet(self.0 & !bits)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        EVENT_NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in self.names() {
            if !first {
                f.write_str(":")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for EventSet {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Memory hierarchy level that satisfied a load, from the data-source packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    L1d,
    L2d,
    PeerCpu,
    LocalCluster,
    LlCache,
    PeerCluster,
    Remote,
    Dram,
    /// Implementation-defined or later-revision encoding.
    Other(u64),
}

impl DataSource {
    pub fn from_raw(v: u64) -> DataSource {
        match v {
            0 => DataSource::L1d,
            8 => DataSource::L2d,
            9 => DataSource::PeerCpu,
            10 => DataSource::LocalCluster,
            11 => DataSource::LlCache,
            12 => DataSource::PeerCluster,
            13 => DataSource::Remote,
            14 => DataSource::Dram,
            other => DataSource::Other(other),
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::L1d => f.write_str("L1D"),
            DataSource::L2d => f.write_str("L2D"),
            DataSource::PeerCpu => f.write_str("PEER-CPU"),
            DataSource::LocalCluster => f.write_str("LOCAL-CLUSTER"),
            DataSource::LlCache => f.write_str("LL-CACHE"),
            DataSource::PeerCluster => f.write_str("PEER-CLUSTER"),
            DataSource::Remote => f.write_str("REMOTE"),
            DataSource::Dram => f.write_str("DRAM"),
            DataSource::Other(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for DataSource {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Which address register an address packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPacket {
    /// Sampled instruction virtual address.
    Instruction { addr: u64, el: u8, ns: bool },
    /// Branch target virtual address.
    BranchTarget { addr: u64, el: u8, ns: bool },
    /// Target of the most recently taken branch in program order (SPEv1.2).
    PrevBranchTarget { addr: u64, el: u8, ns: bool },
    /// Data access virtual address, full 64-bit value.
    DataVirtual { addr: u64 },
    /// Data access physical address.
    DataPhysical { addr: u64, ns: bool, ch: bool, pat: u8 },
    /// Later-revision address index, preserved raw.
    Unknown { index: u8, value: u64 },
}

/// Counter sub-selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    TotalLatency,
    IssueLatency,
    TranslationLatency,
    Unknown(u8),
}

/// Load/store subclass from the operation-type payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdStSubclass {
    GpReg,
    SimdFp,
    UnspecReg,
    NvSysreg,
    MteTag,
    Memcpy,
    Memset,
}

impl LdStSubclass {
    pub fn name(&self) -> &'static str {
        match self {
            LdStSubclass::GpReg => "GP-REG",
            LdStSubclass::SimdFp => "SIMD-FP",
            LdStSubclass::UnspecReg => "UNSPEC-REG",
            LdStSubclass::NvSysreg => "NV-SYSREG",
            LdStSubclass::MteTag => "MTE-TAG",
            LdStSubclass::Memcpy => "MEMCPY",
            LdStSubclass::Memset => "MEMSET",
        }
    }
}

/// Load or store direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemOp {
    #[serde(rename = "LD")]
    Load,
    #[serde(rename = "ST")]
    Store,
}

impl fmt::Display for MemOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemOp::Load => f.write_str("LD"),
            MemOp::Store => f.write_str("ST"),
        }
    }
}

/// SVE qualifiers shared by SVE load/store and SVE "other" operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SveFlags {
    /// Effective vector length in bits.
    pub evl: u16,
    /// Predicated with at least one inactive element.
    pub pred: bool,
    /// Gather/scatter access (load/store only).
    pub sg: bool,
    /// Floating-point operation ("other" class only).
    pub fp: bool,
}

/// Decoded operation-type packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Non-memory, non-branch operation.
    Other { cond_select: bool },
    /// SVE non-memory operation.
    SveOther(SveFlags),
    /// Load, store or atomic.
    LoadStore {
        op: MemOp,
        atomic: bool,
        excl: bool,
        ar: bool,
        subclass: LdStSubclass,
        sve: Option<SveFlags>,
    },
    /// Branch or exception return.
    Branch { cond: bool, indirect: bool },
    /// Later-revision operation class, preserved raw.
    Unknown { index: u8, value: u8 },
}

/// Fully decoded packet payload: one tag per architected class, plus an
/// opaque fallback for reserved encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    Pad,
    End,
    Timestamp(u64),
    Events(EventSet),
    DataSource(DataSource),
    /// Context id; `el` is 1 or 2 depending on the header index.
    ContextId { id: u64, el: u8 },
    OpType(OpType),
    Address(AddressPacket),
    Counter { kind: CounterKind, value: u16 },
    /// Reserved header encoding, payload preserved.
    Unknown { header: u8, payload: &'a [u8] },
}

/// Address/counter index: 3 bits of the short header, widened by the two
/// low bits of an extended-header prefix.
fn packet_index(pkt: &RawPacket<'_>) -> u8 {
    let short = pkt.header & 0b111;
    match pkt.ext_header {
        Some(ext) => (ext & 0b11) << 3 | short,
        None => short,
    }
}

fn decode_address(pkt: &RawPacket<'_>) -> AddressPacket {
    let v = pkt.payload_u64();
    let addr = v & mask(55, 0);
    let ns = v & (1 << 63) != 0;
    let el = ((v & mask(62, 61)) >> 61) as u8;
    let ch = v & (1 << 62) != 0;
    let pat = ((v & mask(59, 56)) >> 56) as u8;

    match packet_index(pkt) {
        0 => AddressPacket::Instruction { addr, el, ns },
        1 => AddressPacket::BranchTarget { addr, el, ns },
        2 => AddressPacket::DataVirtual { addr: v },
        3 => AddressPacket::DataPhysical { addr, ns, ch, pat },
        4 => AddressPacket::PrevBranchTarget { addr, el, ns },
        index => AddressPacket::Unknown { index, value: v },
    }
}

fn decode_counter(pkt: &RawPacket<'_>) -> Payload<'static> {
    let kind = match packet_index(pkt) {
        0 => CounterKind::TotalLatency,
        1 => CounterKind::IssueLatency,
        2 => CounterKind::TranslationLatency,
        index => CounterKind::Unknown(index),
    };
    Payload::Counter {
        kind,
        value: pkt.payload_u64() as u16,
    }
}

fn decode_op_type(pkt: &RawPacket<'_>) -> OpType {
    let index = pkt.header & 0b11;
    let v = pkt.payload_u64() as u8;
    match index {
        0 => {
            // 0b0xxx1xx0 selects the SVE encoding within the "other" class.
            if v & 0b1000_1001 == 0b1000 {
                OpType::SveOther(SveFlags {
                    evl: 32 << ((v >> 4) & 0b111),
                    fp: v & 0b10 != 0,
                    pred: v & 0b100 != 0,
                    sg: false,
                })
            } else {
                OpType::Other {
                    cond_select: v & 1 != 0,
                }
            }
        }
        1 => {
            let op = if v & 1 != 0 { MemOp::Store } else { MemOp::Load };
            let atomic = v & 0b1110_0010 == 0b10;
            let (at, excl, ar) = if atomic {
                (v & 0b100 != 0, v & 0b1000 != 0, v & 0b1_0000 != 0)
            } else {
                (false, false, false)
            };
            let subclass = match v & 0b1111_1110 {
                0x00 => LdStSubclass::GpReg,
                0x04 => LdStSubclass::SimdFp,
                0x10 => LdStSubclass::UnspecReg,
                0x30 => LdStSubclass::NvSysreg,
                0x14 => LdStSubclass::MteTag,
                0x20 => LdStSubclass::Memcpy,
                0x24 => LdStSubclass::Memset,
                _ => LdStSubclass::GpReg,
            };
            let sve = if v & 0b1010 == 0b1000 {
                Some(SveFlags {
                    evl: 32 << ((v >> 4) & 0b111),
                    pred: v & 0b100 != 0,
                    sg: v & 0b1000_0000 != 0,
                    fp: false,
                })
            } else {
                None
            };
            OpType::LoadStore {
                op,
                atomic: at,
                excl,
                ar,
                subclass,
                sve,
            }
        }
        2 => OpType::Branch {
            cond: v & 1 != 0,
            indirect: v & 0b1111_1110 == 2,
        },
        index => OpType::Unknown { index, value: v },
    }
}

/// Decode a framed packet into its typed payload.
///
/// Never fails: headers the reader could frame always decode, with reserved
/// encodings landing in [`Payload::Unknown`].
pub fn decode<'a>(pkt: &RawPacket<'a>) -> Payload<'a> {
    // An extended prefix only architecturally combines with address and
    // counter headers; anything else behind it is a reserved encoding.
    if pkt.ext_header.is_some() {
        if pkt.header == HDR_EXT_ALIGNMENT {
            return Payload::Pad;
        }
        return match classify_header(pkt.header) {
            HeaderClass::Address => Payload::Address(decode_address(pkt)),
            HeaderClass::Counter => decode_counter(pkt),
            _ => Payload::Unknown {
                header: pkt.header,
                payload: pkt.payload,
            },
        };
    }

    match classify_header(pkt.header) {
        HeaderClass::Pad => Payload::Pad,
        HeaderClass::End => Payload::End,
        HeaderClass::Timestamp => Payload::Timestamp(pkt.payload_u64()),
        HeaderClass::Events => Payload::Events(EventSet(pkt.payload_u64())),
        HeaderClass::DataSource => Payload::DataSource(DataSource::from_raw(pkt.payload_u64())),
        HeaderClass::Context => Payload::ContextId {
            id: pkt.payload_u64(),
            el: (pkt.header & 0b11) + 1,
        },
        HeaderClass::OpType => Payload::OpType(decode_op_type(pkt)),
        HeaderClass::Address => Payload::Address(decode_address(pkt)),
        HeaderClass::Counter => decode_counter(pkt),
        // Extended handled above; Bad never reaches decode.
        HeaderClass::Extended | HeaderClass::Reserved | HeaderClass::Bad => Payload::Unknown {
            header: pkt.header,
            payload: pkt.payload,
        },
    }
}
