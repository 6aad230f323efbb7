//! Address-to-symbol annotation
//!
//! Resolves sampled instruction addresses to function names after decoding,
//! batched per merged table so symbolization never sits inside the packet
//! pipeline. Providers cover ELF symbol tables (`.symtab`, falling back to
//! `.dynsym` for stripped libraries) and the kernel's `/proc/kallsyms`.
//! A miss is a normal, silent outcome.

use crate::record::Record;
use crate::session::Tables;
use anyhow::{bail, Context as _, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// A resolved symbol: name plus the address's offset into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRef {
    pub name: String,
    pub offset: u64,
}

/// Source of symbol resolutions, keyed by address.
pub trait SymbolProvider: Sync {
    fn resolve(&self, addr: u64) -> Option<SymbolRef>;
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    start: u64,
    end: u64,
    name: String,
}

/// Sorted address-range symbol table with binary-search lookup.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    entries: Vec<SymbolEntry>,
}

impl SymbolMap {
    /// Build from `(start, end, name)` ranges; `end` is inclusive.
    pub fn from_entries(mut ranges: Vec<(u64, u64, String)>) -> SymbolMap {
        ranges.sort_by_key(|(start, _, _)| *start);
        // Aliases share a start address; keep the last one, as the original
        // table order intended.
        ranges.dedup_by_key(|(start, _, _)| *start);
        SymbolMap {
            entries: ranges
                .into_iter()
                .map(|(start, end, name)| SymbolEntry { start, end, name })
                .collect(),
        }
    }

    /// Function symbols from an ELF binary, relocated by `base`.
    pub fn from_elf(path: &Path, base: u64) -> Result<SymbolMap> {
        let file = File::open(path)
            .with_context(|| format!("failed to open binary: {}", path.display()))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.context("failed to memory-map binary")?;
        let obj = object::File::parse(&*mmap).context("failed to parse ELF binary")?;

        let object_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut ranges = collect_function_symbols(obj.symbols(), base, &object_name);
        if ranges.is_empty() {
            // Stripped binaries may still carry a dynamic symbol table.
            ranges = collect_function_symbols(obj.dynamic_symbols(), base, &object_name);
        }
        if ranges.is_empty() {
            debug!(path = %path.display(), "no function symbols found");
        }
        Ok(SymbolMap::from_entries(ranges))
    }

    /// Kernel symbols from `/proc/kallsyms` text. Symbols are contiguous:
    /// each range ends one byte before the next symbol starts.
    pub fn from_kallsyms(text: &str) -> Result<SymbolMap> {
        let mut syms: Vec<(u64, char, &str)> = Vec::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(typ), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(addr) = u64::from_str_radix(addr, 16) else {
                continue;
            };
            let Some(typ) = typ.chars().next() else {
                continue;
            };
            syms.push((addr, typ, name));
        }
        // Without privilege every address reads as zero; that table is
        // useless and the caller should know.
        if syms.is_empty() || syms.iter().all(|(addr, _, _)| *addr == 0) {
            bail!("kallsyms unreadable (run as root or check kernel config)");
        }

        syms.sort_by_key(|(addr, _, _)| *addr);
        let mut ranges = Vec::new();
        for i in 0..syms.len() - 1 {
            let (start, typ, name) = syms[i];
            if !matches!(typ, 't' | 'T' | 'w' | 'W') {
                continue;
            }
            let end = syms[i + 1].0.saturating_sub(1);
            ranges.push((start, end, format!("[kernel.kallsyms] {}", name)));
        }
        Ok(SymbolMap::from_entries(ranges))
    }

    /// Load the running kernel's symbol table.
    pub fn from_proc_kallsyms() -> Result<SymbolMap> {
        let text =
            std::fs::read_to_string("/proc/kallsyms").context("failed to read /proc/kallsyms")?;
        SymbolMap::from_kallsyms(&text)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SymbolProvider for SymbolMap {
    fn resolve(&self, addr: u64) -> Option<SymbolRef> {
        // Rightmost entry starting at or before addr.
        let idx = self.entries.partition_point(|e| e.start <= addr);
        if idx == 0 {
            return None;
        }
        let entry = &self.entries[idx - 1];
        if addr <= entry.end {
            Some(SymbolRef {
                name: entry.name.clone(),
                offset: addr - entry.start,
            })
        } else {
            None
        }
    }
}

fn collect_function_symbols<'data>(
    symbols: impl Iterator<Item = impl ObjectSymbol<'data>>,
    base: u64,
    object_name: &str,
) -> Vec<(u64, u64, String)> {
    let mut ranges = Vec::new();
    for sym in symbols {
        // Skip non-function and zero-size symbols.
        if sym.kind() != SymbolKind::Text || sym.size() == 0 {
            continue;
        }
        if let Ok(name) = sym.name() {
            let start = base + sym.address();
            ranges.push((
                start,
                start + sym.size() - 1,
                format!("[{}] {}", object_name, name),
            ));
        }
    }
    ranges
}

fn annotate(pc: Option<u64>, provider: &dyn SymbolProvider) -> Option<String> {
    pc.and_then(|addr| provider.resolve(addr)).map(|s| s.name)
}

/// Fill the `symbol` field of every record from its instruction address.
/// Records whose address resolves to nothing stay unannotated.
pub fn annotate_tables(tables: &mut Tables, provider: &dyn SymbolProvider) {
    for rec in &mut tables.load_store {
        rec.symbol = annotate(rec.pc, provider);
    }
    for rec in &mut tables.branch {
        rec.symbol = annotate(rec.pc, provider);
    }
    for rec in &mut tables.other {
        rec.symbol = annotate(rec.pc, provider);
    }
}

/// Annotate a single record in place.
pub fn annotate_record(record: &mut Record, provider: &dyn SymbolProvider) {
    let symbol = annotate(record.pc(), provider);
    match record {
        Record::LoadStore(r) => r.symbol = symbol,
        Record::Branch(r) => r.symbol = symbol,
        Record::Other(r) => r.symbol = symbol,
    }
}
