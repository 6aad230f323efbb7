use anyhow::{Context, Result};
use clap::Parser;
use spedec::cli::Cli;
use spedec::output::TableWriter;
use spedec::symbols::SymbolMap;
use spedec::{SegmentMeta, Session, SessionConfig, TraceSegment};
use std::fs::File;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    let default_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let file = File::open(&cli.file)
        .with_context(|| format!("failed to open trace file: {}", cli.file.display()))?;
    // Safety: the mapping is read-only and the file is not expected to be
    // modified while we decode it.
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .with_context(|| format!("failed to mmap trace file: {}", cli.file.display()))?;

    let segment = if cli.cpu >= 0 {
        TraceSegment::with_meta(
            &mmap,
            SegmentMeta {
                pid: 0,
                tid: 0,
                cpu: cli.cpu,
                base_timestamp: 0,
                exec_mode: None,
            },
        )
    } else {
        TraceSegment::raw(&mmap)
    };

    let session = Session::new(SessionConfig {
        concurrency: cli.concurrency(),
        kinds: cli.kinds(),
        abort: None,
    });

    let out = if cli.symbols {
        match SymbolMap::from_proc_kallsyms() {
            Ok(map) => session.decode_symbolized(&segment, &map)?,
            Err(e) => {
                warn!(error = %e, "kernel symbols unavailable, decoding without");
                session.decode(&segment)?
            }
        }
    } else {
        session.decode(&segment)?
    };

    let diags = &out.diags;
    info!(
        packets = diags.packets,
        records = out.tables.load_store.len() + out.tables.branch.len() + out.tables.other.len(),
        partitions = diags.partitions,
        "decode complete"
    );
    if diags.bad_headers > 0 || diags.truncated_packets > 0 || diags.abandoned_partitions > 0 {
        warn!(
            bad_headers = diags.bad_headers,
            truncated_packets = diags.truncated_packets,
            truncated_records = diags.truncated_records,
            resync_bytes = diags.resync_bytes,
            abandoned_partitions = diags.abandoned_partitions,
            "trace contained damage, see diagnostics"
        );
    }

    let writer = TableWriter::new(&cli.prefix, cli.format.into(), cli.symbols);
    let written = writer.write(&out.tables, &cli.kinds())?;
    for path in &written {
        println!("{}", path.display());
    }
    Ok(())
}
