//! Versioned output table schemas
//!
//! Downstream consumers detect optional columns added across format
//! revisions (the SVE fields, the previous-branch-target fields) by the
//! schema version that travels with every output table.

use crate::record::RecordKind;
use serde::Serialize;

/// Current schema revision.
///
/// v1: base columns. v2: adds `sve_evl`/`sve_pred`/`sve_sg` to load/store,
/// `pbt`/`pbt_lvl` and `context` to branch, and the `truncated` marker to
/// all kinds.
pub const SCHEMA_VERSION: u32 = 2;

pub const LDST_COLS: &[&str] = &[
    "cpu",
    "op",
    "pc",
    "el",
    "atomic",
    "excl",
    "ar",
    "subclass",
    "event",
    "issue_lat",
    "total_lat",
    "vaddr",
    "xlat_lat",
    "paddr",
    "data_source",
    "context",
    "ts",
    "sve_evl",
    "sve_pred",
    "sve_sg",
    "truncated",
];

pub const BRANCH_COLS: &[&str] = &[
    "cpu",
    "op",
    "pc",
    "el",
    "condition",
    "indirect",
    "event",
    "issue_lat",
    "total_lat",
    "br_tgt",
    "br_tgt_lvl",
    "pbt",
    "pbt_lvl",
    "context",
    "ts",
    "truncated",
];

pub const OTHER_COLS: &[&str] = &[
    "cpu",
    "op",
    "pc",
    "el",
    "condition",
    "subclass",
    "sve_evl",
    "sve_fp",
    "sve_pred",
    "event",
    "issue_lat",
    "total_lat",
    "context",
    "ts",
    "truncated",
];

/// Schema tag attached to an output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub version: u32,
    #[serde(skip)]
    pub kind: RecordKind,
    pub columns: &'static [&'static str],
    /// Whether the optional trailing `symbol` column is populated.
    pub symbols: bool,
}

impl TableSchema {
    pub fn for_kind(kind: RecordKind, symbols: bool) -> TableSchema {
        let columns = match kind {
            RecordKind::LoadStore => LDST_COLS,
            RecordKind::Branch => BRANCH_COLS,
            RecordKind::Other => OTHER_COLS,
        };
        TableSchema {
            version: SCHEMA_VERSION,
            kind,
            columns,
            symbols,
        }
    }

    /// Column names including the optional symbol column.
    pub fn header(&self) -> Vec<&'static str> {
        let mut cols = self.columns.to_vec();
        if self.symbols {
            cols.push("symbol");
        }
        cols
    }
}
