//! Capability traits for each stage category (§9: "one capability set per
//! stage... implemented by concrete modules; a registry object maps module
//! names to constructors. Dispatch is through trait/interface objects, not
//! inheritance.") These replace the source's abstract-base-class-per-stage
//! hierarchy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cancel::CancellationToken;
use crate::entity::TraceEntity;
use crate::error::{FatalError, ItemError, ModuleError};

/// Free-form `module-options` for a stage, as parsed from TOML (§6).
pub type ModuleOptions = BTreeMap<String, toml::Value>;

/// The test-case stage module (always single-worker, §4.1: "forbidden" to
/// declare parallelism).
pub trait TestcaseProducer: Send {
    fn name(&self) -> &'static str;

    /// Whether the generator has no more test cases to offer.
    fn is_done(&mut self) -> bool;

    /// Produce the path to the next test case on disk. Only called when
    /// `is_done` just returned `false`.
    fn next_testcase(&mut self, cancel: &CancellationToken) -> Result<PathBuf, ModuleError>;
}

/// The trace stage module: runs the instrumented target on a test case and
/// records where its raw trace landed.
pub trait TraceProducer: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_parallelism(&self) -> bool {
        false
    }

    fn produce(&self, entity: &mut TraceEntity, cancel: &CancellationToken) -> Result<(), ItemError>;
}

/// The preprocessor stage module: converts a backend-specific raw trace
/// into the canonical binary format (§4.3, §4.4).
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_parallelism(&self) -> bool {
        false
    }

    fn preprocess(&self, entity: &mut TraceEntity, cancel: &CancellationToken) -> Result<(), ItemError>;

    /// Called exactly once, after the stage has drained, in reverse
    /// topological order with the other stages' `uninit` (§4.1).
    fn uninit(&self) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// One sink in the analysis stage's fan-out. Every configured analyzer
/// receives every preprocessed trace (§2, §4.5).
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether concurrent `add_trace` calls are safe on this instance. If
    /// not, the runtime serializes them with a mutex (§4.1).
    fn supports_parallel_add(&self) -> bool {
        false
    }

    fn add_trace(&self, entity: &TraceEntity) -> Result<(), ModuleError>;

    /// Produce the final report. Idempotent: calling twice returns the
    /// same report with no side effects (§8). Report I/O failures are
    /// fatal (§7: "IoError writing outputs | Writer | Fatal").
    fn finish(&self, output_dir: Option<&Path>) -> Result<(), FatalError>;
}
