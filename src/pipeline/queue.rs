//! Bounded inter-stage queues ("input buffers", §2/§5). A thin wrapper
//! around `crossbeam_channel::bounded` — a true multi-producer
//! multi-consumer channel, which `std::sync::mpsc` does not provide and
//! which a worker *pool* dequeuing from a single queue requires. Producers
//! block when the queue is full, which is the pipeline's only form of
//! backpressure.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::cancel::CancellationToken;

/// How often a blocked send/recv re-checks the cancellation token (§5:
/// "the cancellation check between items" / "at every long-running I/O
/// wait").
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    crossbeam_channel::bounded(capacity.max(1))
}

/// Blocking send that periodically checks `cancel`. Returns `Err(())` if
/// cancelled before the item could be delivered, or if every receiver was
/// dropped (downstream stage already shut down).
pub fn send_cancellable<T>(tx: &Sender<T>, mut item: T, cancel: &CancellationToken) -> Result<(), ()> {
    loop {
        if cancel.is_cancelled() {
            return Err(());
        }
        match tx.send_timeout(item, CANCEL_POLL_INTERVAL) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(returned)) => {
                item = returned;
                continue;
            }
            Err(SendTimeoutError::Disconnected(_)) => return Err(()),
        }
    }
}

/// Blocking receive that periodically checks `cancel`. Returns `None` if
/// cancelled, or once the channel is closed and drained (upstream done).
pub fn recv_cancellable<T>(rx: &Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn send_then_recv_roundtrips() {
        let (tx, rx) = bounded::<u32>(2);
        let cancel = CancellationToken::new();
        send_cancellable(&tx, 7, &cancel).unwrap();
        assert_eq!(recv_cancellable(&rx, &cancel), Some(7));
    }

    #[test]
    fn recv_returns_none_once_closed_and_drained() {
        let (tx, rx) = bounded::<u32>(1);
        let cancel = CancellationToken::new();
        send_cancellable(&tx, 1, &cancel).unwrap();
        drop(tx);
        assert_eq!(recv_cancellable(&rx, &cancel), Some(1));
        assert_eq!(recv_cancellable(&rx, &cancel), None);
    }

    #[test]
    fn cancellation_unblocks_a_waiting_receiver() {
        let (_tx, rx) = bounded::<u32>(1);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let handle = thread::spawn(move || recv_cancellable(&rx, &cancel2));
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert_eq!(handle.join().unwrap(), None);
    }
}
