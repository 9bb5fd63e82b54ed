//! Least-loaded routing over a fixed set of worker tasks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use impala_common::{ImpalaError, ImpalaResult};

struct WorkerSlot<M> {
    tx: mpsc::UnboundedSender<M>,
    load: Arc<AtomicUsize>,
}

/// Hands each message to the worker with the fewest requests in flight
///
/// A worker decrements its load counter after replying. Ties go to the
/// lowest slot.
pub(crate) struct WorkerRouter<M> {
    name: &'static str,
    slots: Vec<WorkerSlot<M>>,
}

impl<M> WorkerRouter<M> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Vec::new(),
        }
    }

    /// Register a worker; returns its inbox and load counter
    pub(crate) fn add_worker(&mut self) -> (mpsc::UnboundedReceiver<M>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let load = Arc::new(AtomicUsize::new(0));
        self.slots.push(WorkerSlot {
            tx,
            load: Arc::clone(&load),
        });
        (rx, load)
    }

    pub(crate) fn route(&self, message: M) -> ImpalaResult<usize> {
        let (index, slot) = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(index, slot)| (slot.load.load(Ordering::SeqCst), *index))
            .ok_or_else(|| ImpalaError::Shutdown(format!("no {} workers running", self.name)))?;

        slot.load.fetch_add(1, Ordering::SeqCst);
        if slot.tx.send(message).is_err() {
            slot.load.fetch_sub(1, Ordering::SeqCst);
            return Err(ImpalaError::Shutdown(format!(
                "{} worker {} is gone",
                self.name, index
            )));
        }
        Ok(index)
    }

    pub(crate) fn loads(&self) -> Vec<usize> {
        self.slots
            .iter()
            .map(|slot| slot.load.load(Ordering::SeqCst))
            .collect()
    }
}
