//! The data model shared across all stages (§3): trace entities, images,
//! and allocations.

use std::path::PathBuf;

use crate::format::TraceFile;

/// An image (shared library, executable, or pseudo-image for a source file).
/// `[start, end]` is an image-relative address interval; images are kept
/// sorted by `start` and disjoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: i32,
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub interesting: bool,
}

impl Image {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// A heap allocation block. Freed by a later `Free(id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub id: i32,
    pub address: u64,
    pub size: u32,
}

/// The handshake record passed between pipeline stages (§3). `id` is
/// assigned once by the test-case stage and never changes afterward.
#[derive(Debug, Clone)]
pub struct TraceEntity {
    pub id: u64,
    pub testcase_path: PathBuf,
    pub raw_trace_path: Option<PathBuf>,
    pub preprocessed_trace_path: Option<PathBuf>,
    pub preprocessed_trace: Option<TraceFile>,
}

impl TraceEntity {
    pub fn new(id: u64, testcase_path: PathBuf) -> Self {
        Self {
            id,
            testcase_path,
            raw_trace_path: None,
            preprocessed_trace_path: None,
            preprocessed_trace: None,
        }
    }

    /// Invariant check from §3: at the moment an entity enters the analysis
    /// stage, exactly one of `preprocessed_trace_path` / `preprocessed_trace`
    /// is populated, unless the analysis is `passthrough`.
    pub fn has_exactly_one_trace_source(&self) -> bool {
        self.preprocessed_trace_path.is_some() != self.preprocessed_trace.is_some()
    }
}
