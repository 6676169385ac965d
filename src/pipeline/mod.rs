//! Pipeline composition and the concurrency/buffering/cancellation
//! contract (§4.1). `build` parses the stage list and instantiates
//! modules through the registries; `run` drives the four stages to
//! completion or to the first fatal error.

pub mod analysis_stage;
pub mod preprocess_stage;
pub mod queue;
pub mod registry;
pub mod stage;
pub mod testcase_stage;
pub mod trace_stage;

use std::path::PathBuf;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::config::RawConfig;
use crate::error::{ConfigError, FatalError, PipelineError};
use crate::pipeline::analysis_stage::AnalysisStage;
use crate::pipeline::stage::{Preprocessor, TestcaseProducer, TraceProducer};

pub struct Pipeline {
    testcase_producer: Box<dyn TestcaseProducer>,
    testcase_buffer: usize,

    trace_producer: Arc<dyn TraceProducer>,
    trace_threads: usize,
    trace_buffer: usize,

    preprocessor: Arc<dyn Preprocessor>,
    preprocess_threads: usize,
    preprocess_buffer: usize,

    analysis: AnalysisStage,
    analysis_threads: usize,

    output_directory: Option<PathBuf>,
}

impl Pipeline {
    /// Parse a stage list per stage category and instantiate modules.
    /// Fails with [`ConfigError`] per §4.1's build-time contract.
    pub fn build(config: &RawConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let testcase_producer =
            registry::testcase_registry().build(&config.testcase.module, &config.testcase.module_options)?;
        let trace_producer: Arc<dyn TraceProducer> =
            Arc::from(registry::trace_registry().build(&config.trace.module, &config.trace.module_options)?);
        let preprocessor: Arc<dyn Preprocessor> = Arc::from(
            registry::preprocess_registry().build(&config.preprocess.module, &config.preprocess.module_options)?,
        );

        let mut analyzers = Vec::with_capacity(config.analysis.len());
        for stage in &config.analysis {
            analyzers.push(registry::analysis_registry().build(&stage.module, &stage.module_options)?);
        }

        Ok(Self {
            testcase_producer,
            testcase_buffer: config.testcase.options.input_buffer_size,
            trace_producer,
            trace_threads: config.trace.options.max_parallel_threads,
            trace_buffer: config.trace.options.input_buffer_size,
            preprocessor,
            preprocess_threads: config.preprocess.options.max_parallel_threads,
            preprocess_buffer: config.preprocess.options.input_buffer_size,
            analysis: AnalysisStage::new(analyzers),
            analysis_threads: config
                .analysis
                .first()
                .map(|s| s.options.max_parallel_threads)
                .unwrap_or(1),
            output_directory: config.general.output_directory.clone(),
        })
    }

    /// Run the whole pipeline to completion: either the test-case stage
    /// reports done and every downstream queue drains, or the first fatal
    /// stage error cancels everything. Returns that first fatal error;
    /// later ones are only logged (§4.1).
    pub fn run(self) -> Result<(), PipelineError> {
        let cancel = CancellationToken::new();

        let (tc_tx, tc_rx) = queue::bounded(self.testcase_buffer);
        let (tr_tx, tr_rx) = queue::bounded(self.trace_buffer);
        let (pp_tx, pp_rx) = queue::bounded(self.preprocess_buffer);

        let trace_thread_count =
            trace_stage::effective_thread_count(self.trace_threads, self.trace_producer.supports_parallelism());
        let preprocess_thread_count = trace_stage::effective_thread_count(
            self.preprocess_threads,
            self.preprocessor.supports_parallelism(),
        );

        let testcase_producer = self.testcase_producer;
        let testcase_handle = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                testcase_stage::run(testcase_producer, tc_tx, &cancel);
            })
        };

        let trace_handles = trace_stage::spawn(
            Arc::clone(&self.trace_producer),
            trace_thread_count,
            tc_rx,
            tr_tx,
            cancel.clone(),
        );

        let preprocess_handles = preprocess_stage::spawn(
            Arc::clone(&self.preprocessor),
            preprocess_thread_count,
            tr_rx,
            pp_tx,
            cancel.clone(),
        );

        let analysis_handles = self.analysis.spawn(self.analysis_threads.max(1), pp_rx, cancel.clone());

        testcase_handle.join().expect("testcase stage thread panicked");
        for h in trace_handles {
            h.join().expect("trace stage worker panicked");
        }
        for h in preprocess_handles {
            h.join().expect("preprocess stage worker panicked");
        }
        if let Err(e) = self.preprocessor.uninit() {
            log::error!("preprocess/{}: uninit failed: {e}", self.preprocessor.name());
        }
        for h in analysis_handles {
            h.join().expect("analysis worker panicked");
        }

        // The analysis stage waits for all testcases to drain before
        // invoking `finish` on any analyzer (§5) — that has just happened.
        self.analysis.finish_all(self.output_directory.as_ref(), &cancel);

        match cancel.origin() {
            Some((stage, module)) => Err(PipelineError::Fatal {
                stage,
                module,
                source: FatalError::Cancelled,
            }),
            None => Ok(()),
        }
    }
}
