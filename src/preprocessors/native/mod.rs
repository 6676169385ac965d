//! The native-tracer preprocessor (§4.3): converts packed 32-byte raw
//! records plus a sidecar image list into the canonical binary format.

mod alloc;
mod images;
mod raw;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::cancel::CancellationToken;
use crate::entity::{Allocation, TraceEntity};
use crate::error::{ConfigError, ItemError, ModuleError, ResolveError};
use crate::format::prefix::ImageTable;
use crate::format::{TraceEntry, TraceFile, TraceWriter};
use crate::pipeline::stage::{ModuleOptions, Preprocessor};

use alloc::AllocState;
use raw::{decode_all, RawRecord, RawRecordType};

/// Shared, once-computed prefix state (§4.3, §5: "publication by release").
struct PrefixData {
    images: Arc<ImageTable>,
    allocations: Arc<HashMap<i32, Allocation>>,
    next_alloc_id: i32,
    stack_pointer_min: u64,
    stack_pointer_max: u64,
}

enum PrefixState {
    Pending,
    Ready(Arc<PrefixData>),
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

/// Walks raw records, maintaining the running stack-pointer bounds and the
/// per-call allocation/resolution state. Shared between prefix parsing and
/// per-testcase preprocessing (§4.3's per-operation algorithms).
struct RecordWalker<'a> {
    images: &'a ImageTable,
    alloc: AllocState,
    stack_pointer_min: u64,
    stack_pointer_max: u64,
    stack_bounds_set: bool,
    emit_stack_entries: bool,
}

impl<'a> RecordWalker<'a> {
    fn new(
        images: &'a ImageTable,
        prefix_allocations: &HashMap<i32, Allocation>,
        next_alloc_id: i32,
        stack_pointer_min: u64,
        stack_pointer_max: u64,
        emit_stack_entries: bool,
    ) -> Self {
        Self {
            images,
            alloc: AllocState::seeded_from(prefix_allocations, next_alloc_id),
            stack_pointer_min,
            stack_pointer_max,
            stack_bounds_set: stack_pointer_min != 0 || stack_pointer_max != 0,
            emit_stack_entries,
        }
    }

    /// Handle one record, returning an entry to emit (if any). Resolver
    /// misses are returned as `Err` so the caller can log-and-skip (§7).
    fn handle(&mut self, record: &RawRecord) -> Result<Option<TraceEntry>, ResolveError> {
        match record.kind {
            RawRecordType::AllocSize => {
                self.alloc.on_alloc_size(record.param1 as u32);
                Ok(None)
            }
            RawRecordType::AllocRet => Ok(Some(self.alloc.on_alloc_ret(record.param2)?)),
            RawRecordType::FreeParam => Ok(Some(self.alloc.on_free(record.param2)?)),
            RawRecordType::Branch => {
                let src = self.images.resolve(record.param1);
                let dst = self.images.resolve(record.param2);
                let src_interesting = src.map(|i| i.interesting).unwrap_or(false);
                let dst_interesting = dst.map(|i| i.interesting).unwrap_or(false);
                if !src_interesting && !dst_interesting {
                    return Ok(None);
                }
                let (src_img, src_off) = match src {
                    Some(img) => (img.id, (record.param1 - img.start) as u32),
                    None => return Err(ResolveError::UnresolvedImage { address: record.param1 }),
                };
                let (dst_img, dst_off) = match dst {
                    Some(img) => (img.id, (record.param2 - img.start) as u32),
                    None => return Err(ResolveError::UnresolvedImage { address: record.param2 }),
                };
                let kind = if record.is_call() {
                    crate::format::BranchKind::Call
                } else if record.is_return() {
                    crate::format::BranchKind::Return
                } else {
                    crate::format::BranchKind::Jump
                };
                Ok(Some(TraceEntry::Branch {
                    src_img,
                    src_off,
                    dst_img,
                    dst_off,
                    taken: record.taken(),
                    kind,
                }))
            }
            RawRecordType::MemRead | RawRecordType::MemWrite => {
                let is_write = matches!(record.kind, RawRecordType::MemWrite);
                let instr_img = match self.images.resolve(record.param1) {
                    Some(img) if img.interesting => img,
                    Some(_) => return Ok(None),
                    None => return Err(ResolveError::UnresolvedImage { address: record.param1 }),
                };
                let instr_off = (record.param1 - instr_img.start) as u32;
                let target = record.param2;
                if target >= self.stack_pointer_min && target <= self.stack_pointer_max {
                    return Ok(Some(TraceEntry::StackMemoryAccess {
                        is_write,
                        instr_img: instr_img.id,
                        instr_off,
                        mem_off: target as u32,
                    }));
                }
                if let Some(mem_img) = self.images.resolve(target) {
                    return Ok(Some(TraceEntry::ImageMemoryAccess {
                        is_write,
                        instr_img: instr_img.id,
                        instr_off,
                        mem_img: mem_img.id,
                        mem_off: (target - mem_img.start) as u32,
                    }));
                }
                match self.alloc.resolve(target) {
                    Some((alloc_id, mem_off)) => Ok(Some(TraceEntry::HeapMemoryAccess {
                        is_write,
                        instr_img: instr_img.id,
                        instr_off,
                        alloc_id,
                        mem_off,
                    })),
                    None => Err(ResolveError::MissingAllocation { address: target }),
                }
            }
            RawRecordType::StackPtr => {
                // The first StackPtr record carries the bounds themselves
                // (param1 = min, param2 = max); later ones are ordinary
                // stack-pointer-write events at some instruction (§4.3).
                if !self.stack_bounds_set {
                    self.stack_pointer_min = record.param1;
                    self.stack_pointer_max = record.param2;
                    self.stack_bounds_set = true;
                    return Ok(None);
                }
                if !self.emit_stack_entries {
                    return Ok(None);
                }
                match self.images.resolve(record.param1) {
                    Some(img) => Ok(Some(TraceEntry::StackAllocation {
                        instr_img: img.id,
                        instr_off: (record.param1 - img.start) as u32,
                        sp: record.param2,
                    })),
                    None => Err(ResolveError::UnresolvedImage { address: record.param1 }),
                }
            }
        }
    }
}

pub struct NativePreprocessor {
    images_file: PathBuf,
    prefix_trace_file: PathBuf,
    output_directory: Option<PathBuf>,
    track_stack: bool,
    gate: PrefixGate,
}

impl NativePreprocessor {
    pub fn from_options(opts: &ModuleOptions) -> Result<Self, ConfigError> {
        let images_file = PathBuf::from(
            opts.get("images_file")
                .and_then(|v| v.as_str())
                .ok_or(ConfigError::MissingField {
                    stage: "preprocess",
                    module: "native".into(),
                    field: "images_file",
                })?,
        );
        let prefix_trace_file = PathBuf::from(
            opts.get("prefix_trace_file")
                .and_then(|v| v.as_str())
                .ok_or(ConfigError::MissingField {
                    stage: "preprocess",
                    module: "native".into(),
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
        let track_stack = opts
            .get("track_stack")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Self {
            images_file,
            prefix_trace_file,
            output_directory,
            track_stack,
            gate: PrefixGate::new(),
        })
    }

    fn parse_prefix(&self) -> Result<(PrefixData, Vec<TraceEntry>), ItemError> {
        let images = images::parse_image_sidecar(&self.images_file)?;
        let table = ImageTable::new(images);
        let raw_bytes = std::fs::read(&self.prefix_trace_file)?;
        let records = decode_all(&raw_bytes).map_err(ItemError::from)?;

        let mut walker = RecordWalker::new(&table, &HashMap::new(), 0, 0, 0, false);
        let mut entries = Vec::new();
        for record in &records {
            match walker.handle(record) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => log::warn!("preprocess/native: prefix record dropped: {e}"),
            }
        }

        let allocations: HashMap<i32, Allocation> = entries
            .iter()
            .filter_map(|e| match e {
                TraceEntry::HeapAllocation { id, size, address } => Some((
                    *id,
                    Allocation {
                        id: *id,
                        address: *address,
                        size: *size,
                    },
                )),
                _ => None,
            })
            .collect();
        let next_alloc_id = allocations.keys().copied().max().map(|m| m + 1).unwrap_or(0);

        if let Some(dir) = &self.output_directory {
            let path = dir.join("prefix.trace.preprocessed");
            let mut writer = TraceWriter::create(&path)?;
            let mut header = Vec::new();
            table.encode(&mut header);
            writer.write_raw(&header)?;
            writer.write_entries(entries.iter())?;
            writer.close()?;
        }

        Ok((
            PrefixData {
                images: Arc::new(table),
                allocations: Arc::new(allocations),
                next_alloc_id,
                stack_pointer_min: walker.stack_pointer_min,
                stack_pointer_max: walker.stack_pointer_max,
            },
            entries,
        ))
    }

    /// First caller does the parse and publishes the result; everyone else
    /// waits on the condition (§4.3: "a fatal error during prefix parsing
    /// must still mark prefix-ready... so waiters do not deadlock").
    fn ensure_prefix_ready(&self) -> Result<Arc<PrefixData>, ItemError> {
        if !self.gate.claimed.swap(true, Ordering::SeqCst) {
            let outcome = self.parse_prefix();
            let mut guard = self.gate.state.lock().unwrap();
            *guard = match outcome {
                Ok((data, _entries)) => PrefixState::Ready(Arc::new(data)),
                Err(e) => {
                    log::error!("preprocess/native: prefix parsing failed: {e}");
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
                    return Err(ModuleError::new("preprocess", "native", "prefix parsing failed").into());
                }
                PrefixState::Pending => {
                    guard = self.gate.ready.wait(guard).unwrap();
                }
            }
        }
    }
}

impl Preprocessor for NativePreprocessor {
    fn name(&self) -> &'static str {
        "native"
    }

    fn supports_parallelism(&self) -> bool {
        true
    }

    fn preprocess(&self, entity: &mut TraceEntity, cancel: &CancellationToken) -> Result<(), ItemError> {
        let prefix = self.ensure_prefix_ready()?;
        let raw_path = entity
            .raw_trace_path
            .clone()
            .ok_or_else(|| ModuleError::new("preprocess", "native", "entity has no raw trace"))?;
        let raw_bytes = std::fs::read(&raw_path)?;
        let records = decode_all(&raw_bytes).map_err(ItemError::from)?;

        let mut walker = RecordWalker::new(
            &prefix.images,
            &prefix.allocations,
            prefix.next_alloc_id,
            prefix.stack_pointer_min,
            prefix.stack_pointer_max,
            self.track_stack,
        );
        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            if cancel.is_cancelled() {
                return Err(ModuleError::new("preprocess", "native", "cancelled").into());
            }
            match walker.handle(record) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => log::warn!("preprocess/native: record dropped: {e}"),
            }
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
                    Arc::clone(&prefix.allocations),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw::{FLAG_CALL, FLAG_TAKEN};

    fn write_sidecar(dir: &Path) -> PathBuf {
        let path = dir.join("images.txt");
        std::fs::write(&path, "1\t0x1000\t0x2000\tlib\n").unwrap();
        path
    }

    fn record_bytes(ty: u32, flag: u8, p1: u64, p2: u64) -> [u8; raw::RAW_RECORD_SIZE] {
        let mut buf = [0u8; raw::RAW_RECORD_SIZE];
        buf[0..4].copy_from_slice(&ty.to_le_bytes());
        buf[4] = flag;
        buf[8..16].copy_from_slice(&p1.to_le_bytes());
        buf[16..24].copy_from_slice(&p2.to_le_bytes());
        buf
    }

    #[test]
    fn single_testcase_one_call_one_read() {
        let dir = tempfile::tempdir().unwrap();
        let images_file = write_sidecar(dir.path());
        let prefix_trace_file = dir.path().join("prefix.trace");
        std::fs::write(&prefix_trace_file, Vec::<u8>::new()).unwrap();

        let mut opts = ModuleOptions::new();
        opts.insert(
            "images_file".into(),
            toml::Value::String(images_file.to_str().unwrap().into()),
        );
        opts.insert(
            "prefix_trace_file".into(),
            toml::Value::String(prefix_trace_file.to_str().unwrap().into()),
        );
        let preprocessor = NativePreprocessor::from_options(&opts).unwrap();

        let mut raw = Vec::new();
        raw.extend_from_slice(&record_bytes(6, FLAG_TAKEN | FLAG_CALL, 0x1010, 0x1020));
        raw.extend_from_slice(&record_bytes(3, 0, 64, 0)); // AllocSize
        raw.extend_from_slice(&record_bytes(4, 0, 0, 0x10000)); // AllocRet
        raw.extend_from_slice(&record_bytes(1, 0, 0x1030, 0x10000)); // MemRead

        let raw_path = dir.path().join("t0.trace");
        std::fs::write(&raw_path, &raw).unwrap();

        let mut entity = TraceEntity::new(0, dir.path().join("0.testcase"));
        entity.raw_trace_path = Some(raw_path);
        preprocessor
            .preprocess(&mut entity, &CancellationToken::new())
            .unwrap();

        let trace = entity.preprocessed_trace.unwrap();
        let entries: Vec<_> = trace.iter().collect::<Result<_, _>>().unwrap();
        assert!(matches!(
            entries[0],
            TraceEntry::Branch {
                kind: crate::format::BranchKind::Call,
                src_off: 0x10,
                dst_off: 0x20,
                ..
            }
        ));
        assert!(matches!(
            entries[1],
            TraceEntry::HeapAllocation {
                size: 64,
                address: 0x10000,
                ..
            }
        ));
        assert!(matches!(
            entries[2],
            TraceEntry::HeapMemoryAccess {
                mem_off: 0, ..
            }
        ));
    }

    #[test]
    fn double_free_warns_but_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let images_file = write_sidecar(dir.path());
        let prefix_trace_file = dir.path().join("prefix.trace");
        std::fs::write(&prefix_trace_file, Vec::<u8>::new()).unwrap();

        let mut opts = ModuleOptions::new();
        opts.insert(
            "images_file".into(),
            toml::Value::String(images_file.to_str().unwrap().into()),
        );
        opts.insert(
            "prefix_trace_file".into(),
            toml::Value::String(prefix_trace_file.to_str().unwrap().into()),
        );
        let preprocessor = NativePreprocessor::from_options(&opts).unwrap();

        let mut raw = Vec::new();
        raw.extend_from_slice(&record_bytes(3, 0, 16, 0));
        raw.extend_from_slice(&record_bytes(4, 0, 0, 0xA000));
        raw.extend_from_slice(&record_bytes(5, 0, 0, 0xA000));
        raw.extend_from_slice(&record_bytes(5, 0, 0, 0xA000));
        let raw_path = dir.path().join("t0.trace");
        std::fs::write(&raw_path, &raw).unwrap();

        let mut entity = TraceEntity::new(0, dir.path().join("0.testcase"));
        entity.raw_trace_path = Some(raw_path);
        preprocessor
            .preprocess(&mut entity, &CancellationToken::new())
            .unwrap();

        let trace = entity.preprocessed_trace.unwrap();
        let entries: Vec<_> = trace.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], TraceEntry::HeapAllocation { .. }));
        assert!(matches!(entries[1], TraceEntry::HeapFree { .. }));
    }
}
