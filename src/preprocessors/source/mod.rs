//! The source-tracer preprocessor (§4.4): converts a line-oriented,
//! dictionary-compressed text trace into the canonical binary format,
//! synthesizing every address along the way.

mod address;
mod compression;
mod grammar;
mod map_output;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::cancel::CancellationToken;
use crate::entity::TraceEntity;
use crate::error::{ConfigError, ItemError, ModuleError, ResolveError};
use crate::format::{BranchKind, TraceEntry, TraceFile, TraceWriter};
use crate::pipeline::stage::{ModuleOptions, Preprocessor};

use address::{AddressSynthesizer, HeapTracker, ScriptTable, DEFAULT_COLUMN_BITS};
use compression::Dictionary;
use grammar::{parse_record, Site, SourceRecord};

struct SourcePrefixData {
    scripts: Arc<ScriptTable>,
    images: Arc<crate::format::ImageTable>,
    dictionary_snapshot: Arc<std::collections::HashMap<i32, String>>,
}

enum PrefixState {
    Pending,
    Ready(Arc<SourcePrefixData>),
    Failed,
}

struct PrefixGate {
    claimed: AtomicBool,
    state: Mutex<PrefixState>,
    ready: Condvar,
}

impl PrefixGate {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            state: Mutex::new(PrefixState::Pending),
            ready: Condvar::new(),
        }
    }
}

/// Walks decoded source records, reconstructing control flow and
/// synthesizing addresses (§4.4). One instance per test case (and one for
/// the prefix), owning its own dictionary, heap tracker, and pending-branch
/// state; the address synthesizer beneath it is shared.
struct RecordProcessor<'a> {
    scripts: &'a ScriptTable,
    synth: &'a AddressSynthesizer,
    column_bits: u32,
    heap: HeapTracker,
    pending_conditional: Option<Site>,
    last_return: Option<Site>,
}

impl<'a> RecordProcessor<'a> {
    fn new(scripts: &'a ScriptTable, synth: &'a AddressSynthesizer, column_bits: u32) -> Self {
        Self {
            scripts,
            synth,
            column_bits,
            heap: HeapTracker::new(),
            pending_conditional: None,
            last_return: None,
        }
    }

    fn resolve(&self, site: &Site, use_end: bool) -> Result<(i32, u32), ResolveError> {
        self.synth.resolve(site, self.scripts, self.column_bits, use_end)
    }

    /// Handle one decoded record, returning the trace entries it (and any
    /// settled pending conditional) produces.
    fn handle(&mut self, record: &SourceRecord) -> Result<Vec<TraceEntry>, ResolveError> {
        let mut out = Vec::new();

        if !matches!(record, SourceRecord::Conditional { .. }) {
            if let Some(pending) = self.pending_conditional.take() {
                let (src_img, src_off) = self.resolve(&pending, false)?;
                let (dst_img, dst_off) = self.resolve(record.settlement_site(), false)?;
                out.push(TraceEntry::Branch {
                    src_img,
                    src_off,
                    dst_img,
                    dst_off,
                    taken: true,
                    kind: BranchKind::Jump,
                });
            }
        }

        match record {
            SourceRecord::Call { caller, callee, .. } => {
                let (src_img, src_off) = self.resolve(caller, false)?;
                let (dst_img, dst_off) = self.resolve(callee, false)?;
                out.push(TraceEntry::Branch {
                    src_img,
                    src_off,
                    dst_img,
                    dst_off,
                    taken: true,
                    kind: BranchKind::Call,
                });
            }
            SourceRecord::PreReturn { site } => {
                self.last_return = Some(site.clone());
            }
            SourceRecord::Return { from, to } => {
                let (src_img, src_off) = match self.last_return.take() {
                    Some(site) => self.resolve(&site, false)?,
                    None => self.resolve(from, true)?,
                };
                let (dst_img, dst_off) = self.resolve(to, false)?;
                out.push(TraceEntry::Branch {
                    src_img,
                    src_off,
                    dst_img,
                    dst_off,
                    taken: true,
                    kind: BranchKind::Return,
                });
            }
            SourceRecord::Conditional { site } => {
                self.pending_conditional = Some(site.clone());
            }
            SourceRecord::EndExpression { .. } => {}
            SourceRecord::HeapGet { site, obj_id, property } => {
                out.extend(self.heap_access(site, *obj_id, property, false)?);
            }
            SourceRecord::HeapSet { site, obj_id, property } => {
                out.extend(self.heap_access(site, *obj_id, property, true)?);
            }
        }
        Ok(out)
    }

    fn heap_access(
        &mut self,
        site: &Site,
        obj_id: i64,
        property: &str,
        is_write: bool,
    ) -> Result<Vec<TraceEntry>, ResolveError> {
        let (instr_img, instr_off) = self.resolve(site, false)?;
        let (alloc_id, pending, mem_off) = self.heap.access(obj_id, property);
        let mut out = Vec::new();
        if let Some((address, size)) = pending {
            out.push(TraceEntry::HeapAllocation { id: alloc_id, size, address });
        }
        out.push(TraceEntry::HeapMemoryAccess {
            is_write,
            instr_img,
            instr_off,
            alloc_id,
            mem_off,
        });
        Ok(out)
    }
}

/// Decode every line of a raw source trace through `dictionary`, parse each
/// decompressed record, and run it through a fresh `RecordProcessor`.
fn walk_text(
    text: &str,
    dictionary: &mut Dictionary,
    processor: &mut RecordProcessor,
    mut on_entry: impl FnMut(TraceEntry),
) {
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let bodies = match dictionary.decode_line(line) {
            Ok(bodies) => bodies,
            Err(e) => {
                log::warn!("preprocess/source: line dropped: {e}");
                continue;
            }
        };
        for body in bodies {
            let record = match parse_record(&body) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("preprocess/source: record dropped: {e}");
                    continue;
                }
            };
            match processor.handle(&record) {
                Ok(entries) => entries.into_iter().for_each(&mut on_entry),
                Err(e) => log::warn!("preprocess/source: record dropped: {e}"),
            }
        }
    }
}

pub struct SourcePreprocessor {
    scripts_file: PathBuf,
    prefix_trace_file: PathBuf,
    output_directory: Option<PathBuf>,
    column_bits: u32,
    synth: AddressSynthesizer,
    gate: PrefixGate,
}

impl SourcePreprocessor {
    pub fn from_options(opts: &ModuleOptions) -> Result<Self, ConfigError> {
        let scripts_file = PathBuf::from(
            opts.get("scripts_file")
                .and_then(|v| v.as_str())
                .ok_or(ConfigError::MissingField {
                    stage: "preprocess",
                    module: "source".into(),
                    field: "scripts_file",
                })?,
        );
        let prefix_trace_file = PathBuf::from(
            opts.get("prefix_trace_file")
                .and_then(|v| v.as_str())
                .ok_or(ConfigError::MissingField {
                    stage: "preprocess",
                    module: "source".into(),
                    field: "prefix_trace_file",
                })?,
        );
        let output_directory = opts
            .get("output_directory")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);
        if let Some(dir) = &output_directory {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        let column_bits = address::validate_column_bits(
            opts.get("column_bits")
                .and_then(|v| v.as_integer())
                .map(|v| v as u32)
                .unwrap_or(DEFAULT_COLUMN_BITS),
        )?;
        Ok(Self {
            scripts_file,
            prefix_trace_file,
            output_directory,
            column_bits,
            synth: AddressSynthesizer::new(),
            gate: PrefixGate::new(),
        })
    }

    fn parse_prefix(&self) -> Result<SourcePrefixData, ItemError> {
        let scripts = ScriptTable::parse(&self.scripts_file)?;
        let images = crate::format::ImageTable::new(scripts.to_images());
        let text = std::fs::read_to_string(&self.prefix_trace_file)?;

        let mut dictionary = Dictionary::new();
        let mut processor = RecordProcessor::new(&scripts, &self.synth, self.column_bits);
        let mut entries = Vec::new();
        walk_text(&text, &mut dictionary, &mut processor, |e| entries.push(e));

        if let Some(dir) = &self.output_directory {
            let path = dir.join("prefix.trace.preprocessed");
            let mut writer = TraceWriter::create(&path)?;
            let mut header = Vec::new();
            images.encode(&mut header);
            writer.write_raw(&header)?;
            writer.write_entries(entries.iter())?;
            writer.close()?;
        }

        Ok(SourcePrefixData {
            scripts: Arc::new(scripts),
            images: Arc::new(images),
            dictionary_snapshot: Arc::new(dictionary.snapshot()),
        })
    }

    fn ensure_prefix_ready(&self) -> Result<Arc<SourcePrefixData>, ItemError> {
        if !self.gate.claimed.swap(true, Ordering::SeqCst) {
            let outcome = self.parse_prefix();
            let mut guard = self.gate.state.lock().unwrap();
            *guard = match outcome {
                Ok(data) => PrefixState::Ready(Arc::new(data)),
                Err(e) => {
                    log::error!("preprocess/source: prefix parsing failed: {e}");
                    PrefixState::Failed
                }
            };
            self.gate.ready.notify_all();
        }

        let mut guard = self.gate.state.lock().unwrap();
        loop {
            match &*guard {
                PrefixState::Ready(data) => return Ok(Arc::clone(data)),
                PrefixState::Failed => {
                    return Err(ModuleError::new("preprocess", "source", "prefix parsing failed").into());
                }
                PrefixState::Pending => {
                    guard = self.gate.ready.wait(guard).unwrap();
                }
            }
        }
    }
}

impl Preprocessor for SourcePreprocessor {
    fn name(&self) -> &'static str {
        "source"
    }

    fn supports_parallelism(&self) -> bool {
        true
    }

    fn preprocess(&self, entity: &mut TraceEntity, cancel: &CancellationToken) -> Result<(), ItemError> {
        let prefix = self.ensure_prefix_ready()?;
        let raw_path = entity
            .raw_trace_path
            .clone()
            .ok_or_else(|| ModuleError::new("preprocess", "source", "entity has no raw trace"))?;
        let text = std::fs::read_to_string(&raw_path)?;

        let mut dictionary = Dictionary::from_snapshot(&prefix.dictionary_snapshot);
        let mut processor = RecordProcessor::new(&prefix.scripts, &self.synth, self.column_bits);
        let mut entries = Vec::new();
        let mut cancelled = false;
        for line in text.lines() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let bodies = match dictionary.decode_line(line) {
                Ok(bodies) => bodies,
                Err(e) => {
                    log::warn!("preprocess/source: line dropped: {e}");
                    continue;
                }
            };
            for body in bodies {
                let record = match parse_record(&body) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("preprocess/source: record dropped: {e}");
                        continue;
                    }
                };
                match processor.handle(&record) {
                    Ok(new_entries) => entries.extend(new_entries),
                    Err(e) => log::warn!("preprocess/source: record dropped: {e}"),
                }
            }
        }
        if cancelled {
            return Err(ModuleError::new("preprocess", "source", "cancelled").into());
        }

        match &self.output_directory {
            Some(dir) => {
                let path = dir.join(format!("t{}.trace.preprocessed", entity.id));
                let mut writer = TraceWriter::create(&path)?;
                writer.write_entries(entries.iter())?;
                writer.close()?;
                entity.preprocessed_trace_path = Some(path);
            }
            None => {
                let mut bytes = Vec::new();
                for entry in &entries {
                    entry.encode(&mut bytes);
                }
                entity.preprocessed_trace = Some(TraceFile::new(
                    bytes,
                    Arc::clone(&prefix.images),
                    Arc::new(std::collections::HashMap::new()),
                ));
            }
        }
        Ok(())
    }

    fn uninit(&self) -> Result<(), ModuleError> {
        let Some(dir) = &self.output_directory else {
            return Ok(());
        };
        let guard = self.gate.state.lock().unwrap();
        let PrefixState::Ready(prefix) = &*guard else {
            return Ok(());
        };
        map_output::write_map_files(dir, &prefix.images, self.synth.map_entries())
            .map_err(|e| ModuleError::new("preprocess", "source", format!("writing MAP files: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_opts(scripts: &std::path::Path, prefix_trace: &std::path::Path) -> ModuleOptions {
        let mut opts = ModuleOptions::new();
        opts.insert(
            "scripts_file".into(),
            toml::Value::String(scripts.to_str().unwrap().into()),
        );
        opts.insert(
            "prefix_trace_file".into(),
            toml::Value::String(prefix_trace.to_str().unwrap().into()),
        );
        opts
    }

    #[test]
    fn dictionary_compression_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let scripts_file = dir.path().join("scripts.txt");
        std::fs::write(&scripts_file, "1\t/orig/a.js\ta.js\n").unwrap();
        let prefix_trace = dir.path().join("prefix.trace");
        std::fs::write(&prefix_trace, "").unwrap();

        let preprocessor = SourcePreprocessor::from_options(&write_opts(&scripts_file, &prefix_trace)).unwrap();

        let raw = "L|5|c;1:10:1:1:15:2;1:20:1:1:25:2;foo\n5\nk|;1:30:1:1:35:2;1:40:1:1:45:2;bar\n";
        let raw_path = dir.path().join("t0.trace");
        std::fs::write(&raw_path, raw).unwrap();

        let mut entity = TraceEntity::new(0, dir.path().join("0.testcase"));
        entity.raw_trace_path = Some(raw_path);
        preprocessor
            .preprocess(&mut entity, &CancellationToken::new())
            .unwrap();

        let trace = entity.preprocessed_trace.unwrap();
        let entries: Vec<_> = trace.iter().collect::<Result<_, _>>().unwrap();
        // Two calls: foo's call branch, then bar's call branch (no pending
        // conditional between them, so no synthesized jump).
        let calls: Vec<_> = entries
            .iter()
            .filter(|e| matches!(e, TraceEntry::Branch { kind: BranchKind::Call, .. }))
            .collect();
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn external_function_address_is_stable_across_testcases() {
        let dir = tempfile::tempdir().unwrap();
        let scripts_file = dir.path().join("scripts.txt");
        std::fs::write(&scripts_file, "1\t/orig/a.js\ta.js\n").unwrap();
        let prefix_trace = dir.path().join("prefix.trace");
        std::fs::write(&prefix_trace, "").unwrap();

        let preprocessor = SourcePreprocessor::from_options(&write_opts(&scripts_file, &prefix_trace)).unwrap();

        let raw = "L|1|c;1:1:1:1:1:1;E:crypto.randomBytes:c;call\n";
        for id in 0..2u64 {
            let raw_path = dir.path().join(format!("t{id}.trace"));
            std::fs::write(&raw_path, raw).unwrap();
            let mut entity = TraceEntity::new(id, dir.path().join(format!("{id}.testcase")));
            entity.raw_trace_path = Some(raw_path);
            preprocessor
                .preprocess(&mut entity, &CancellationToken::new())
                .unwrap();

            let trace = entity.preprocessed_trace.unwrap();
            let entries: Vec<_> = trace.iter().collect::<Result<_, _>>().unwrap();
            let branch = entries
                .iter()
                .find(|e| matches!(e, TraceEntry::Branch { kind: BranchKind::Call, .. }))
                .unwrap();
            if let TraceEntry::Branch { dst_off, .. } = branch {
                assert_eq!(*dst_off, 0);
            }
        }
    }

    #[test]
    fn heap_property_access_allocates_once() {
        let dir = tempfile::tempdir().unwrap();
        let scripts_file = dir.path().join("scripts.txt");
        std::fs::write(&scripts_file, "1\t/orig/a.js\ta.js\n").unwrap();
        let prefix_trace = dir.path().join("prefix.trace");
        std::fs::write(&prefix_trace, "").unwrap();

        let preprocessor = SourcePreprocessor::from_options(&write_opts(&scripts_file, &prefix_trace)).unwrap();

        let raw = "L|1|g;1:1:1:1:1:1;7;length\nL|2|p;1:2:1:1:2:1;7;value\n";
        let raw_path = dir.path().join("t0.trace");
        std::fs::write(&raw_path, raw).unwrap();

        let mut entity = TraceEntity::new(0, dir.path().join("0.testcase"));
        entity.raw_trace_path = Some(raw_path);
        preprocessor
            .preprocess(&mut entity, &CancellationToken::new())
            .unwrap();

        let trace = entity.preprocessed_trace.unwrap();
        let entries: Vec<_> = trace.iter().collect::<Result<_, _>>().unwrap();
        let allocations = entries
            .iter()
            .filter(|e| matches!(e, TraceEntry::HeapAllocation { .. }))
            .count();
        assert_eq!(allocations, 1);
        let accesses = entries
            .iter()
            .filter(|e| matches!(e, TraceEntry::HeapMemoryAccess { .. }))
            .count();
        assert_eq!(accesses, 2);
    }
}
