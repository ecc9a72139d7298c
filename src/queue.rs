// src/queue.rs
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::parser::Fix;

/// Unbounded FIFO between the network workers and the single store writer.
///
/// Every clone is a producer; the writer calls `pop`. `interrupt` wakes a
/// writer parked on an empty queue; from then on `pop` hands out whatever is
/// still queued and returns `None` once it is empty.
#[derive(Clone)]
pub struct PersistQueue {
    tx: Sender<Fix>,
    rx: Receiver<Fix>,
    stop_rx: Receiver<()>,
    stop_tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl PersistQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(0);
        Self {
            tx,
            rx,
            stop_rx,
            stop_tx: Arc::new(Mutex::new(Some(stop_tx))),
        }
    }

    pub fn push(&self, fix: Fix) {
        // Cannot fail: `self` holds a receiver.
        let _ = self.tx.send(fix);
    }

    /// Blocks until a fix is available or the queue is interrupted and drained.
    pub fn pop(&self) -> Option<Fix> {
        select! {
            recv(self.rx) -> fix => fix.ok(),
            recv(self.stop_rx) -> _ => self.rx.try_recv().ok(),
        }
    }

    pub fn try_pop(&self) -> Option<Fix> {
        self.rx.try_recv().ok()
    }

    /// Dropping the only stop sender disconnects `stop_rx` for every clone.
    pub fn interrupt(&self) {
        self.stop_tx.lock().take();
    }

    pub fn is_interrupted(&self) -> bool {
        self.stop_tx.lock().is_none()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for PersistQueue {
    fn default() -> Self {
        Self::new()
    }
}
