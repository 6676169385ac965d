//! The binary trace format and zero-copy I/O over it (§4.2, §6).

pub mod entry;
mod le;
pub mod prefix;
pub mod reader;
pub mod writer;

pub use entry::{AccessKind, BranchKind, TraceEntry};
pub use prefix::ImageTable;
pub use reader::TraceReader;
pub use writer::TraceWriter;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::entity::Allocation;
use crate::error::TraceFormatError;

/// A decoded trace file: an owned byte buffer plus a back-reference to its
/// prefix (image table and the prefix's own allocation ids). Entries are
/// iterated lazily; the allocation lookup is built the first time it's
/// requested and cached for the life of this `TraceFile`.
///
/// Cheap to clone (an `Arc` around the bytes and the prefix data), which
/// matches the lifecycle in §3: "destroyed when the last analyzer releases
/// it" — analyzers hold their own clone and the last drop frees the bytes.
#[derive(Clone)]
pub struct TraceFile {
    bytes: Arc<[u8]>,
    prefix_images: Arc<ImageTable>,
    prefix_allocations: Arc<HashMap<i32, Allocation>>,
    alloc_lookup: Arc<OnceCell<HashMap<i32, Allocation>>>,
}

impl TraceFile {
    pub fn new(
        bytes: Vec<u8>,
        prefix_images: Arc<ImageTable>,
        prefix_allocations: Arc<HashMap<i32, Allocation>>,
    ) -> Self {
        Self {
            bytes: Arc::from(bytes),
            prefix_images,
            prefix_allocations,
            alloc_lookup: Arc::new(OnceCell::new()),
        }
    }

    pub fn load(
        path: impl AsRef<Path>,
        prefix_images: Arc<ImageTable>,
        prefix_allocations: Arc<HashMap<i32, Allocation>>,
    ) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::new(bytes, prefix_images, prefix_allocations))
    }

    pub fn prefix_images(&self) -> &ImageTable {
        &self.prefix_images
    }

    pub fn iter(&self) -> TraceReader<'_> {
        TraceReader::new(&self.bytes)
    }

    /// `id -> Allocation`, merging the prefix's allocations with any this
    /// trace introduces itself (§3: "An allocation lookup built from
    /// `HeapAllocation` records seen while iterating").
    pub fn allocations(&self) -> Result<&HashMap<i32, Allocation>, TraceFormatError> {
        self.alloc_lookup.get_or_try_init(|| {
            let mut map = (*self.prefix_allocations).clone();
            for entry in self.iter() {
                if let TraceEntry::HeapAllocation { id, size, address } = entry? {
                    map.insert(id, Allocation { id, address, size });
                }
            }
            Ok(map)
        })
    }
}
