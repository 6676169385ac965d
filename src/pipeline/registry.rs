//! Name → constructor registries for each stage category (§9). `build`
//! replaces the source's module-factory/abstract-base-class dispatch.

use std::collections::HashMap;

use crate::analysis::leakage::CallStackAnalyzer;
use crate::error::ConfigError;
use crate::pipeline::stage::{Analyzer, ModuleOptions, Preprocessor, TestcaseProducer, TraceProducer};
use crate::pipeline::testcase_stage::{CommandTestcaseGenerator, DirectoryTestcaseGenerator, RandomBytesGenerator};
use crate::pipeline::trace_stage::CommandTraceProducer;
use crate::preprocessors::native::NativePreprocessor;
use crate::preprocessors::source::SourcePreprocessor;

type Ctor<T> = Box<dyn Fn(&ModuleOptions) -> Result<Box<T>, ConfigError> + Send + Sync>;

pub struct Registry<T: ?Sized> {
    stage: &'static str,
    ctors: HashMap<&'static str, Ctor<T>>,
}

impl<T: ?Sized> Registry<T> {
    fn new(stage: &'static str) -> Self {
        Self {
            stage,
            ctors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &'static str,
        ctor: impl Fn(&ModuleOptions) -> Result<Box<T>, ConfigError> + Send + Sync + 'static,
    ) {
        self.ctors.insert(name, Box::new(ctor));
    }

    pub fn build(&self, name: &str, options: &ModuleOptions) -> Result<Box<T>, ConfigError> {
        match self.ctors.get(name) {
            Some(ctor) => ctor(options),
            None => Err(ConfigError::UnknownModule {
                stage: self.stage,
                module: name.to_string(),
            }),
        }
    }
}

pub fn testcase_registry() -> Registry<dyn TestcaseProducer> {
    let mut r = Registry::new("testcase");
    r.register("random-bytes", |opts| Ok(Box::new(RandomBytesGenerator::from_options(opts)?)));
    r.register("directory", |opts| Ok(Box::new(DirectoryTestcaseGenerator::from_options(opts)?)));
    r.register("command", |opts| Ok(Box::new(CommandTestcaseGenerator::from_options(opts)?)));
    r
}

pub fn trace_registry() -> Registry<dyn TraceProducer> {
    let mut r = Registry::new("trace");
    r.register("command", |opts| Ok(Box::new(CommandTraceProducer::from_options(opts)?)));
    r
}

pub fn preprocess_registry() -> Registry<dyn Preprocessor> {
    let mut r = Registry::new("preprocess");
    r.register("native", |opts| Ok(Box::new(NativePreprocessor::from_options(opts)?)));
    r.register("source", |opts| Ok(Box::new(SourcePreprocessor::from_options(opts)?)));
    r
}

pub fn analysis_registry() -> Registry<dyn Analyzer> {
    let mut r = Registry::new("analysis");
    r.register("call-stack", |opts| Ok(Box::new(CallStackAnalyzer::from_options(opts)?)));
    r
}
