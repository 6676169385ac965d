//! Error kinds for the pipeline, per the error handling design (config-time
//! vs. per-item vs. fatal).

use std::path::PathBuf;
use thiserror::Error;

/// Raised while building a [`crate::pipeline::Pipeline`] from configuration.
/// A `ConfigError` always aborts before any worker is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field `{field}` for {stage} module `{module}`")]
    MissingField {
        stage: &'static str,
        module: String,
        field: &'static str,
    },
    #[error("`store_traces = true` requires `output_directory` to be set")]
    MissingOutputDirectory,
    #[error("the testcase stage cannot declare parallelism (max-parallel-threads > 1)")]
    TestcaseStageParallelism,
    #[error("analysis module `{module}` has no such option: `{key}`")]
    UnknownModuleOption { module: String, key: String },
    #[error("unknown module `{module}` for {stage} stage")]
    UnknownModule { stage: &'static str, module: String },
    #[error("`{0}` must be >= 1")]
    InvalidBound(&'static str),
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("column-bits {value} exceeds the maximum of 30")]
    ColumnBitsOutOfRange { value: u32 },
}

/// A per-record resolution miss in a preprocessor. Logged at `warning` and
/// the offending record is dropped; never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no live allocation for address {address:#x}")]
    MissingAllocation { address: u64 },
    #[error("address {address:#x} does not resolve to any image")]
    UnresolvedImage { address: u64 },
    #[error("allocation at {address:#x} returned twice without an intervening size push")]
    DoubleAllocReturn { address: u64 },
    #[error("alloc-return with no pending size on the allocation stack")]
    EmptyAllocSizeStack,
    #[error("column {column} at line {line} exceeds the column-bits mask")]
    ColumnOverflow { line: u32, column: u32 },
    #[error("unknown script id {0}")]
    UnknownScript(i32),
}

/// Errors surfaced while decoding or encoding the canonical binary trace
/// format (§6 of the spec).
#[derive(Debug, Error)]
pub enum TraceFormatError {
    #[error("unknown trace entry tag {tag}")]
    UnknownTag { tag: u8 },
    #[error("truncated payload: needed {needed} bytes, had {have}")]
    Truncated { needed: usize, have: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("name length {len} exceeds remaining buffer")]
    BadNameLength { len: i32 },
}

/// A stage module's own internal failure (distinct from resolver misses and
/// format errors, which have their own kinds).
#[derive(Debug, Error)]
#[error("{stage}/{module}: {message}")]
pub struct ModuleError {
    pub stage: &'static str,
    pub module: String,
    pub message: String,
}

impl ModuleError {
    pub fn new(stage: &'static str, module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            module: module.into(),
            message: message.into(),
        }
    }
}

/// Per-item failure: the runtime logs it and drops the single trace entity;
/// the pipeline continues.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Format(#[from] TraceFormatError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("I/O error processing item: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal failure: triggers global cancellation. The runtime still calls
/// `finish` on every analyzer (possibly surfacing a degraded report).
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("I/O error writing output: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("pipeline was cancelled")]
    Cancelled,
}

/// Top-level error returned by [`crate::pipeline::Pipeline::run`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fatal error in {stage} stage (module `{module}`): {source}")]
    Fatal {
        stage: &'static str,
        module: String,
        #[source]
        source: FatalError,
    },
}
