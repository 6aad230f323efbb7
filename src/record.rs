//! Assembled sample records
//!
//! One record per terminator-delimited packet run, immutable once built
//! (the symbol annotator fills `symbol` afterwards, nothing else changes).
//! The three kinds carry the flat column sets of the output schemas in
//! [`crate::schema`].

use crate::decode::{DataSource, EventSet, MemOp};
use serde::{Serialize, Serializer};

fn ser_opt_hex<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(v) => s.serialize_str(&format!("{:#x}", v)),
        None => s.serialize_none(),
    }
}

/// Which output table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    LoadStore,
    Branch,
    Other,
}

/// A sampled load, store or atomic operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadStoreRecord {
    pub cpu: i32,
    pub op: MemOp,
    #[serde(serialize_with = "ser_opt_hex")]
    pub pc: Option<u64>,
    pub el: Option<u8>,
    pub atomic: bool,
    pub excl: bool,
    pub ar: bool,
    pub subclass: &'static str,
    pub event: EventSet,
    pub issue_lat: u16,
    pub total_lat: u16,
    pub xlat_lat: u16,
    #[serde(serialize_with = "ser_opt_hex")]
    pub vaddr: Option<u64>,
    #[serde(serialize_with = "ser_opt_hex")]
    pub paddr: Option<u64>,
    pub data_source: Option<DataSource>,
    #[serde(serialize_with = "ser_opt_hex")]
    pub context: Option<u64>,
    pub ts: Option<u64>,
    pub sve_evl: u16,
    pub sve_pred: bool,
    pub sve_sg: bool,
    pub truncated: bool,
    pub symbol: Option<String>,
}

/// A sampled branch or exception return.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchRecord {
    pub cpu: i32,
    #[serde(serialize_with = "ser_opt_hex")]
    pub pc: Option<u64>,
    pub el: Option<u8>,
    pub condition: bool,
    pub indirect: bool,
    pub event: EventSet,
    pub issue_lat: u16,
    pub total_lat: u16,
    #[serde(serialize_with = "ser_opt_hex")]
    pub br_tgt: Option<u64>,
    pub br_tgt_lvl: Option<u8>,
    #[serde(serialize_with = "ser_opt_hex")]
    pub pbt: Option<u64>,
    pub pbt_lvl: Option<u8>,
    #[serde(serialize_with = "ser_opt_hex")]
    pub context: Option<u64>,
    pub ts: Option<u64>,
    pub truncated: bool,
    pub symbol: Option<String>,
}

/// Any other sampled operation, including runs where no operation-type
/// packet was observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtherRecord {
    pub cpu: i32,
    /// `OTHER` or `SVE`; empty when the run carried no operation-type packet.
    pub subclass: &'static str,
    pub condition: bool,
    pub sve_evl: u16,
    pub sve_fp: bool,
    pub sve_pred: bool,
    #[serde(serialize_with = "ser_opt_hex")]
    pub pc: Option<u64>,
    pub el: Option<u8>,
    pub event: EventSet,
    pub issue_lat: u16,
    pub total_lat: u16,
    #[serde(serialize_with = "ser_opt_hex")]
    pub context: Option<u64>,
    pub ts: Option<u64>,
    pub truncated: bool,
    pub symbol: Option<String>,
}

/// A finalized record of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    LoadStore(LoadStoreRecord),
    Branch(BranchRecord),
    Other(OtherRecord),
}

impl Record {
    /// Classify a record into its output table.
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::LoadStore(_) => RecordKind::LoadStore,
            Record::Branch(_) => RecordKind::Branch,
            Record::Other(_) => RecordKind::Other,
        }
    }

    pub fn is_truncated(&self) -> bool {
        match self {
            Record::LoadStore(r) => r.truncated,
            Record::Branch(r) => r.truncated,
            Record::Other(r) => r.truncated,
        }
    }

    /// Sampled instruction address, when one was observed.
    pub fn pc(&self) -> Option<u64> {
        match self {
            Record::LoadStore(r) => r.pc,
            Record::Branch(r) => r.pc,
            Record::Other(r) => r.pc,
        }
    }
}
