//! Diagnostic dumper for trace files (§4.2, §6): prints one line per decoded
//! `TraceEntry`, optionally resolving image ids to names via a prefix file's
//! image table.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use leakpipe::format::{BranchKind, ImageTable, TraceEntry, TraceReader};

#[derive(Parser, Debug)]
#[command(name = "trace-dump")]
#[command(about = "Dump a preprocessed trace file as text")]
struct Args {
    /// Trace file to dump (a prefix file or a per-testcase file).
    trace: PathBuf,

    /// Optional prefix file to resolve image ids to names. Only needed when
    /// dumping a per-testcase file, whose own image table lives in the
    /// prefix file instead.
    #[arg(long, value_name = "PATH")]
    prefix: Option<PathBuf>,

    /// Treat `trace` itself as a prefix file: read its leading image-table
    /// header before decoding entries.
    #[arg(long)]
    is_prefix: bool,
}

fn image_name(images: &ImageTable, id: i32) -> String {
    match images.by_id(id) {
        Some(img) => img.name.clone(),
        None => format!("<image {id}>"),
    }
}

fn format_entry(entry: &TraceEntry, images: Option<&ImageTable>) -> String {
    let name = |id: i32| match images {
        Some(t) => image_name(t, id),
        None => id.to_string(),
    };
    match entry {
        TraceEntry::ImageMemoryAccess { is_write, instr_img, instr_off, mem_img, mem_off } => format!(
            "{} {}+{:#x} -> image {}+{:#x}",
            if *is_write { "write" } else { "read" },
            name(*instr_img),
            instr_off,
            name(*mem_img),
            mem_off,
        ),
        TraceEntry::HeapMemoryAccess { is_write, instr_img, instr_off, alloc_id, mem_off } => format!(
            "{} {}+{:#x} -> heap alloc {}+{:#x}",
            if *is_write { "write" } else { "read" },
            name(*instr_img),
            instr_off,
            alloc_id,
            mem_off,
        ),
        TraceEntry::StackMemoryAccess { is_write, instr_img, instr_off, mem_off } => format!(
            "{} {}+{:#x} -> stack+{:#x}",
            if *is_write { "write" } else { "read" },
            name(*instr_img),
            instr_off,
            mem_off,
        ),
        TraceEntry::HeapAllocation { id, size, address } => {
            format!("alloc {id} size={size} addr={address:#x}")
        }
        TraceEntry::HeapFree { id } => format!("free {id}"),
        TraceEntry::Branch { src_img, src_off, dst_img, dst_off, taken, kind } => {
            let kind = match kind {
                BranchKind::Jump => "jump",
                BranchKind::Call => "call",
                BranchKind::Return => "return",
            };
            format!(
                "{kind} {}+{:#x} -> {}+{:#x} taken={taken}",
                name(*src_img),
                src_off,
                name(*dst_img),
                dst_off,
            )
        }
        TraceEntry::StackAllocation { instr_img, instr_off, sp } => {
            format!("stack alloc at {}+{:#x} sp={sp:#x}", name(*instr_img), instr_off)
        }
    }
}

fn run(args: Args) -> Result<(), String> {
    let bytes = std::fs::read(&args.trace).map_err(|e| format!("reading {:?}: {e}", args.trace))?;

    let (embedded_table, entry_bytes) = if args.is_prefix {
        let (table, rest) =
            ImageTable::decode(&bytes).map_err(|e| format!("decoding image table: {e}"))?;
        (Some(table), rest)
    } else {
        (None, bytes.as_slice())
    };

    let external_table = match &args.prefix {
        Some(path) => {
            let prefix_bytes = std::fs::read(path).map_err(|e| format!("reading {path:?}: {e}"))?;
            let (table, _) =
                ImageTable::decode(&prefix_bytes).map_err(|e| format!("decoding image table: {e}"))?;
            Some(table)
        }
        None => None,
    };

    let images = embedded_table.as_ref().or(external_table.as_ref());

    let mut count = 0usize;
    for (i, entry) in TraceReader::new(entry_bytes).enumerate() {
        let entry = entry.map_err(|e| format!("entry {i}: {e}"))?;
        println!("{i:>6}  {}", format_entry(&entry, images));
        count += 1;
    }
    eprintln!("{count} entries");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("trace-dump: {e}");
            ExitCode::from(2)
        }
    }
}
