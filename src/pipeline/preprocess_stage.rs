//! The preprocessor stage (§4.1, §4.3, §4.4). Structurally identical
//! worker-pool shape to the trace stage; the interesting algorithmic work
//! lives inside the concrete `Preprocessor` implementations.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::cancel::CancellationToken;
use crate::entity::TraceEntity;
use crate::error::ItemError;
use crate::pipeline::queue::{recv_cancellable, send_cancellable};
use crate::pipeline::stage::Preprocessor;

pub fn spawn(
    preprocessor: Arc<dyn Preprocessor>,
    thread_count: usize,
    rx: Receiver<TraceEntity>,
    tx: Sender<TraceEntity>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..thread_count.max(1))
        .map(|_| {
            let preprocessor = Arc::clone(&preprocessor);
            let rx = rx.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                while let Some(mut entity) = recv_cancellable(&rx, &cancel) {
                    match preprocessor.preprocess(&mut entity, &cancel) {
                        Ok(()) => {
                            if send_cancellable(&tx, entity, &cancel).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::error!("preprocess/{}: {e}", preprocessor.name());
                            if matches!(e, ItemError::Io(_)) {
                                cancel.cancel_with_origin("preprocess", preprocessor.name());
                            }
                        }
                    }
                }
            })
        })
        .collect()
}
