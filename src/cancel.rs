//! Shared cancellation token passed to every stage and every blocking call.
//!
//! Modeled on the teacher's `OfflineGuard` (a tiny `Clone` wrapper around
//! shared state that every worker consults) rather than a bespoke
//! task-cancellation framework: one `Arc<AtomicBool>`, checked at the
//! suspension points listed in §5 (blocking enqueue, blocking dequeue,
//! synchronous I/O, and between items). It additionally remembers which
//! stage/module first triggered cancellation, so `Pipeline::run` can
//! report the originating fatal error (§7) without threading a separate
//! error-reporting channel through every worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    origin: Arc<Mutex<Option<(&'static str, String)>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Cancel and record the first (stage, module) pair responsible, if
    /// none has been recorded yet. Later callers' origins are discarded —
    /// "the first observed fatal error" (§4.1) wins.
    pub fn cancel_with_origin(&self, stage: &'static str, module: impl Into<String>) {
        let mut origin = self.origin.lock().unwrap();
        if origin.is_none() {
            *origin = Some((stage, module.into()));
        }
        drop(origin);
        self.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn origin(&self) -> Option<(&'static str, String)> {
        self.origin.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("origin", &self.origin())
            .finish()
    }
}
