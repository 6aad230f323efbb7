//! Table writers for decoded record tables
//!
//! The decode core hands over three ordered record tables; this module
//! serializes them as CSV (header row from the versioned schema, minimal
//! quoting) or JSONL (one record per line, preceded by a schema tag line).

use crate::record::{BranchRecord, LoadStoreRecord, OtherRecord, RecordKind};
use crate::schema::TableSchema;
use crate::session::{KindFilter, Tables};
use anyhow::{Context as _, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Jsonl,
}

impl TableFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::Jsonl => "jsonl",
        }
    }
}

/// Escape a CSV field: quote when it contains a comma, quote or newline.
fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn hex_or_empty(v: Option<u64>) -> String {
    v.map(|v| format!("{:#x}", v)).unwrap_or_default()
}

fn num_or_empty<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// One row of a CSV table; each record kind renders its schema's columns in
/// order.
trait CsvRow: Serialize {
    fn kind() -> RecordKind;
    fn fields(&self) -> Vec<String>;
    fn symbol(&self) -> Option<&str>;
}

impl CsvRow for LoadStoreRecord {
    fn kind() -> RecordKind {
        RecordKind::LoadStore
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cpu.to_string(),
            self.op.to_string(),
            hex_or_empty(self.pc),
            num_or_empty(self.el),
            self.atomic.to_string(),
            self.excl.to_string(),
            self.ar.to_string(),
            self.subclass.to_string(),
            self.event.to_string(),
            self.issue_lat.to_string(),
            self.total_lat.to_string(),
            hex_or_empty(self.vaddr),
            self.xlat_lat.to_string(),
            hex_or_empty(self.paddr),
            num_or_empty(self.data_source),
            hex_or_empty(self.context),
            num_or_empty(self.ts),
            self.sve_evl.to_string(),
            self.sve_pred.to_string(),
            self.sve_sg.to_string(),
            self.truncated.to_string(),
        ]
    }

    fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }
}

impl CsvRow for BranchRecord {
    fn kind() -> RecordKind {
        RecordKind::Branch
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.cpu.to_string(),
            "B".to_string(),
            hex_or_empty(self.pc),
            num_or_empty(self.el),
            self.condition.to_string(),
            self.indirect.to_string(),
            self.event.to_string(),
            self.issue_lat.to_string(),
            self.total_lat.to_string(),
            hex_or_empty(self.br_tgt),
            num_or_empty(self.br_tgt_lvl),
            hex_or_empty(self.pbt),
            num_or_empty(self.pbt_lvl),
            hex_or_empty(self.context),
            num_or_empty(self.ts),
            self.truncated.to_string(),
        ]
    }

    fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }
}

impl CsvRow for OtherRecord {
    fn kind() -> RecordKind {
        RecordKind::Other
    }

    fn fields(&self) -> Vec<String> {
        let op = if self.subclass.is_empty() { "" } else { "OTHER" };
        vec![
            self.cpu.to_string(),
            op.to_string(),
            hex_or_empty(self.pc),
            num_or_empty(self.el),
            self.condition.to_string(),
            self.subclass.to_string(),
            self.sve_evl.to_string(),
            self.sve_fp.to_string(),
            self.sve_pred.to_string(),
            self.event.to_string(),
            self.issue_lat.to_string(),
            self.total_lat.to_string(),
            hex_or_empty(self.context),
            num_or_empty(self.ts),
            self.truncated.to_string(),
        ]
    }

    fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }
}

fn csv_line<R: CsvRow>(record: &R, with_symbols: bool) -> String {
    let mut fields: Vec<String> = record.fields().iter().map(|f| escape_field(f)).collect();
    if with_symbols {
        fields.push(escape_field(record.symbol().unwrap_or_default()));
    }
    fields.join(",")
}

/// Writes the per-kind tables next to each other under one file prefix,
/// e.g. `spe-ldst.csv`, `spe-br.csv`, `spe-other.csv`.
#[derive(Debug, Clone)]
pub struct TableWriter {
    pub prefix: String,
    pub format: TableFormat,
    pub symbols: bool,
}

impl TableWriter {
    pub fn new(prefix: &str, format: TableFormat, symbols: bool) -> TableWriter {
        TableWriter {
            prefix: prefix.to_string(),
            format,
            symbols,
        }
    }

    fn path_for(&self, kind: RecordKind) -> PathBuf {
        let tag = match kind {
            RecordKind::LoadStore => "ldst",
            RecordKind::Branch => "br",
            RecordKind::Other => "other",
        };
        PathBuf::from(format!("{}-{}.{}", self.prefix, tag, self.format.extension()))
    }

    fn write_table<R: CsvRow>(&self, records: &[R], written: &mut Vec<PathBuf>) -> Result<()> {
        if records.is_empty() {
            info!(kind = ?R::kind(), "no records found, skipping table");
            return Ok(());
        }
        let path = self.path_for(R::kind());
        let file = File::create(&path)
            .with_context(|| format!("failed to create output file: {}", path.display()))?;
        let mut w = BufWriter::new(file);
        let schema = TableSchema::for_kind(R::kind(), self.symbols);

        match self.format {
            TableFormat::Csv => {
                writeln!(w, "{}", schema.header().join(","))?;
                for rec in records {
                    writeln!(w, "{}", csv_line(rec, self.symbols))?;
                }
            }
            TableFormat::Jsonl => {
                // Schema tag line first, so consumers can detect optional
                // columns added across format revisions.
                serde_json::to_writer(&mut w, &schema)?;
                writeln!(w)?;
                for rec in records {
                    serde_json::to_writer(&mut w, rec)?;
                    writeln!(w)?;
                }
            }
        }
        w.flush()?;
        info!(path = %path.display(), records = records.len(), "table written");
        written.push(path);
        Ok(())
    }

    /// Serialize all enabled, non-empty tables. Returns the paths written.
    pub fn write(&self, tables: &Tables, kinds: &KindFilter) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        if kinds.load_store {
            self.write_table(&tables.load_store, &mut written)?;
        }
        if kinds.branch {
            self.write_table(&tables.branch, &mut written)?;
        }
        if kinds.other {
            self.write_table(&tables.other, &mut written)?;
        }
        Ok(written)
    }
}
