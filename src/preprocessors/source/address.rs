//! Address synthesis for the source tracer (§4.4): there are no native
//! addresses, so images, instruction offsets, external-function ids, and
//! heap object addresses are all synthesized.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;

use crate::entity::Image;
use crate::error::{ConfigError, ResolveError};

use super::grammar::Site;

pub const DEFAULT_COLUMN_BITS: u32 = 13;
const MAX_COLUMN_BITS: u32 = 30;

pub fn validate_column_bits(bits: u32) -> Result<u32, ConfigError> {
    if bits > MAX_COLUMN_BITS {
        return Err(ConfigError::ColumnBitsOutOfRange { value: bits });
    }
    Ok(bits)
}

fn relative_address(line: u32, column: u32, column_bits: u32) -> Result<u32, ResolveError> {
    if column >= (1u32 << column_bits) {
        return Err(ResolveError::ColumnOverflow { line, column });
    }
    Ok((line << column_bits) | column)
}

/// One row of `scripts.txt`, plus the dense synthetic image id assigned to
/// it in file order.
pub struct ScriptEntry {
    pub image_id: i32,
    pub clean_path: String,
}

/// `script_id -> ScriptEntry`, plus the id of the synthetic `[extern]`
/// image appended after every real script.
pub struct ScriptTable {
    scripts: HashMap<i32, ScriptEntry>,
    pub extern_image_id: i32,
}

impl ScriptTable {
    pub fn parse(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut scripts = HashMap::new();
        let mut next_image_id = 0i32;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let mut fields = line.split('\t');
            let id: i32 = fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .ok_or_else(|| std::io::Error::other("malformed scripts.txt line"))?;
            let _original_path = fields.next().unwrap_or("");
            let clean_path = fields.next().unwrap_or("").trim().to_string();
            scripts.insert(
                id,
                ScriptEntry {
                    image_id: next_image_id,
                    clean_path,
                },
            );
            next_image_id += 1;
        }
        Ok(Self {
            scripts,
            extern_image_id: next_image_id,
        })
    }

    pub fn entry(&self, script_id: i32) -> Result<&ScriptEntry, ResolveError> {
        self.scripts.get(&script_id).ok_or(ResolveError::UnknownScript(script_id))
    }

    /// The image table to embed in the canonical prefix file: one
    /// full-u32-range pseudo-image per script, plus `[extern]`.
    pub fn to_images(&self) -> Vec<Image> {
        let mut images: Vec<Image> = self
            .scripts
            .values()
            .map(|entry| {
                let base = (entry.image_id as u64) << 32;
                Image {
                    id: entry.image_id,
                    start: base,
                    end: base | 0xFFFF_FFFF,
                    name: entry.clean_path.clone(),
                    interesting: true,
                }
            })
            .collect();
        let base = (self.extern_image_id as u64) << 32;
        images.push(Image {
            id: self.extern_image_id,
            start: base,
            end: base | 0xFFFF_FFFF,
            name: "[extern]".to_string(),
            interesting: true,
        });
        images.sort_by_key(|i| i.id);
        images
    }
}

/// State shared across every worker and every test case for the lifetime of
/// one `SourcePreprocessor`: external-function addresses and the per-image
/// MAP-entry request sets (§5: "concurrent maps supporting `get_or_insert`
/// with single-winner semantics").
pub struct AddressSynthesizer {
    external_functions: DashMap<String, u32>,
    next_external_id: AtomicU32,
    map_entries: DashMap<i32, DashMap<u32, String>>,
}

impl AddressSynthesizer {
    pub fn new() -> Self {
        Self {
            external_functions: DashMap::new(),
            next_external_id: AtomicU32::new(0),
            map_entries: DashMap::new(),
        }
    }

    fn external_address(&self, name: &str) -> u32 {
        if let Some(existing) = self.external_functions.get(name) {
            return *existing;
        }
        let candidate = self.next_external_id.fetch_add(1, Ordering::SeqCst);
        *self
            .external_functions
            .entry(name.to_string())
            .or_insert(candidate)
    }

    fn record_map_entry(&self, image_id: i32, addr: u32, display: impl FnOnce() -> String) {
        let image_map = self.map_entries.entry(image_id).or_insert_with(DashMap::new);
        image_map.entry(addr).or_insert_with(display);
    }

    pub fn map_entries(&self) -> &DashMap<i32, DashMap<u32, String>> {
        &self.map_entries
    }

    /// Resolve a site to `(image_id, offset)`, recording a MAP-entry request
    /// as a side effect. `use_end` selects the site's end coordinates
    /// (used for the `R` return-branch fallback, §4.4).
    pub fn resolve(
        &self,
        site: &Site,
        scripts: &ScriptTable,
        column_bits: u32,
        use_end: bool,
    ) -> Result<(i32, u32), ResolveError> {
        match site {
            Site::Source {
                script_id,
                start_line,
                start_col,
                end_line,
                end_col,
            } => {
                let entry = scripts.entry(*script_id)?;
                let (line, col) = if use_end { (*end_line, *end_col) } else { (*start_line, *start_col) };
                let off = relative_address(line, col, column_bits)?;
                self.record_map_entry(entry.image_id, off, || {
                    format!("{}:{}:{}", entry.clean_path, line, col)
                });
                Ok((entry.image_id, off))
            }
            Site::External { name, .. } => {
                let off = self.external_address(name);
                self.record_map_entry(scripts.extern_image_id, off, || name.clone());
                Ok((scripts.extern_image_id, off))
            }
        }
    }
}

impl Default for AddressSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-testcase heap object address/property tracker (§4.4: "on first
/// encounter of an object id, emit a synthetic `HeapAllocation` at the next
/// free address in a 2 MiB stride"). Owned by a single worker processing one
/// test case; never shared.
pub struct HeapTracker {
    live: HashMap<i64, LiveObject>,
    next_address: u64,
    next_alloc_id: i32,
}

struct LiveObject {
    alloc_id: i32,
    named_offsets: HashMap<String, u32>,
    next_named_offset: u32,
}

const OBJECT_STRIDE: u64 = 2 * 1024 * 1024;
const OBJECT_SIZE: u32 = OBJECT_STRIDE as u32;
const FIRST_NAMED_OFFSET: u32 = 0x100000;

impl HeapTracker {
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
            next_address: 0,
            next_alloc_id: 0,
        }
    }

    /// Returns `(alloc_id, address)` and `Some(size)` if this is the first
    /// time `obj_id` has been seen (caller must emit a `HeapAllocation`).
    pub fn get_or_alloc(&mut self, obj_id: i64) -> (i32, Option<(u64, u32)>) {
        if let Some(obj) = self.live.get(&obj_id) {
            return (obj.alloc_id, None);
        }
        let alloc_id = self.next_alloc_id;
        self.next_alloc_id += 1;
        let address = self.next_address;
        self.next_address += OBJECT_STRIDE;
        self.live.insert(
            obj_id,
            LiveObject {
                alloc_id,
                named_offsets: HashMap::new(),
                next_named_offset: FIRST_NAMED_OFFSET,
            },
        );
        (alloc_id, Some((address, OBJECT_SIZE)))
    }

    /// Ensures `obj_id` is allocated, then resolves `property` to an offset
    /// inside it. Numeric property names map directly to their integer
    /// value; named properties get synthetic offsets starting at
    /// `0x100000`, one per distinct name (§4.4). Returns `(alloc_id,
    /// pending allocation entry, offset)`.
    pub fn access(&mut self, obj_id: i64, property: &str) -> (i32, Option<(u64, u32)>, u32) {
        let (alloc_id, pending) = self.get_or_alloc(obj_id);
        if let Ok(numeric) = property.parse::<u32>() {
            return (alloc_id, pending, numeric);
        }
        let obj = self
            .live
            .get_mut(&obj_id)
            .expect("heap object was just allocated above");
        let offset = if let Some(offset) = obj.named_offsets.get(property) {
            *offset
        } else {
            let offset = obj.next_named_offset;
            obj.next_named_offset += 1;
            obj.named_offsets.insert(property.to_string(), offset);
            offset
        };
        (alloc_id, pending, offset)
    }
}

impl Default for HeapTracker {
    fn default() -> Self {
        Self::new()
    }
}
