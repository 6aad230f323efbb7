//! CLI argument parsing for spedec

use crate::output::TableFormat;
use crate::session::KindFilter;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for decoded record tables
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// CSV with a header row (default)
    Csv,
    /// JSON Lines, one record per line after a schema tag line
    Jsonl,
}

impl From<OutputFormat> for TableFormat {
    fn from(f: OutputFormat) -> TableFormat {
        match f {
            OutputFormat::Csv => TableFormat::Csv,
            OutputFormat::Jsonl => TableFormat::Jsonl,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "spedec")]
#[command(version)]
#[command(about = "Arm SPE trace decoder producing per-kind record tables", long_about = None)]
pub struct Cli {
    /// Raw SPE trace buffer to decode
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Prefix for output files ({prefix}-ldst, {prefix}-br, {prefix}-other)
    #[arg(short = 'p', long = "prefix", default_value = "spe")]
    pub prefix: String,

    /// Output format
    #[arg(short = 't', long = "type", value_enum, default_value = "csv")]
    pub format: OutputFormat,

    /// Enable debug logging to stderr
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Skip the load/store table
    #[arg(long = "no-ldst")]
    pub no_ldst: bool,

    /// Skip the branch table
    #[arg(long = "no-br")]
    pub no_br: bool,

    /// Skip the other-operation table
    #[arg(long = "no-other")]
    pub no_other: bool,

    /// Number of decode workers (defaults to the host CPU count)
    #[arg(short = 'c', long = "concurrency", value_name = "N")]
    pub concurrency: Option<usize>,

    /// Annotate records with kernel symbol names from /proc/kallsyms
    #[arg(short = 's', long = "symbols")]
    pub symbols: bool,

    /// CPU id to attribute records to (raw buffers carry no CPU metadata)
    #[arg(long = "cpu", value_name = "CPU", default_value_t = -1)]
    pub cpu: i32,
}

impl Cli {
    pub fn kinds(&self) -> KindFilter {
        KindFilter {
            load_store: !self.no_ldst,
            branch: !self.no_br,
            other: !self.no_other,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
