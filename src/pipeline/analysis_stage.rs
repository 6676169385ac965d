//! The analysis stage (§2, §4.1): a sink fan-out. Every configured
//! analyzer sees every preprocessed entity; the entity is released only
//! after all of them have accepted it. An analyzer that doesn't declare
//! itself safe for concurrent `add_trace` calls gets its calls serialized
//! with a mutex by the runtime.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use crate::cancel::CancellationToken;
use crate::entity::TraceEntity;
use crate::error::ModuleError;
use crate::pipeline::queue::recv_cancellable;
use crate::pipeline::stage::Analyzer;

struct AnalyzerSlot {
    analyzer: Arc<dyn Analyzer>,
    serialize: Option<Mutex<()>>,
}

impl AnalyzerSlot {
    fn add_trace(&self, entity: &TraceEntity) -> Result<(), ModuleError> {
        match &self.serialize {
            Some(mutex) => {
                let _guard = mutex.lock().unwrap();
                self.analyzer.add_trace(entity)
            }
            None => self.analyzer.add_trace(entity),
        }
    }
}

pub struct AnalysisStage {
    slots: Arc<Vec<AnalyzerSlot>>,
}

impl AnalysisStage {
    pub fn new(analyzers: Vec<Box<dyn Analyzer>>) -> Self {
        let slots = analyzers
            .into_iter()
            .map(|analyzer| {
                let analyzer: Arc<dyn Analyzer> = Arc::from(analyzer);
                let serialize = if analyzer.supports_parallel_add() {
                    None
                } else {
                    Some(Mutex::new(()))
                };
                AnalyzerSlot { analyzer, serialize }
            })
            .collect();
        Self {
            slots: Arc::new(slots),
        }
    }

    pub fn spawn(
        &self,
        thread_count: usize,
        rx: Receiver<TraceEntity>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..thread_count.max(1))
            .map(|_| {
                let slots = Arc::clone(&self.slots);
                let rx = rx.clone();
                let cancel = cancel.clone();
                std::thread::spawn(move || {
                    while let Some(entity) = recv_cancellable(&rx, &cancel) {
                        for slot in slots.iter() {
                            if let Err(e) = slot.add_trace(&entity) {
                                log::error!("analysis/{}: {e}", slot.analyzer.name());
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Called once all testcases have drained, regardless of whether the
    /// run succeeded or was cancelled (§5: "waits for all testcases to
    /// drain before invoking `finish` on any analyzer").
    pub fn finish_all(&self, output_dir: Option<&PathBuf>, cancel: &CancellationToken) {
        for slot in self.slots.iter() {
            if let Err(e) = slot.analyzer.finish(output_dir.map(|p| p.as_path())) {
                log::error!("analysis/{}: finish failed: {e}", slot.analyzer.name());
                cancel.cancel_with_origin("analysis", slot.analyzer.name());
            }
        }
    }
}
