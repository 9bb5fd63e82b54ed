//! Request/reply plumbing shared by the client's tasks

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;

use impala_common::{ImpalaError, ImpalaResult};

/// Reply channel for a request
pub type Reply<T> = oneshot::Sender<ImpalaResult<T>>;

/// Wait for a reply for at most `wait`
///
/// An elapsed wait is a `Timeout`; a dropped reply sender means the task that
/// should answer is gone.
pub async fn ask<T>(
    reply: oneshot::Receiver<ImpalaResult<T>>,
    wait: Duration,
    what: &str,
) -> ImpalaResult<T> {
    match tokio::time::timeout(wait, reply).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ImpalaError::Shutdown(format!("{} was dropped", what))),
        Err(_) => Err(ImpalaError::Timeout(format!(
            "{} got no reply within {:?}",
            what, wait
        ))),
    }
}

/// Messages set aside until their owner can handle them
#[derive(Debug)]
pub struct Deferred<M> {
    queue: VecDeque<M>,
}

impl<M> Deferred<M> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn defer(&mut self, message: M) {
        self.queue.push_back(message);
    }

    /// Take every deferred message in arrival order
    pub fn drain(&mut self) -> VecDeque<M> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<M> Default for Deferred<M> {
    fn default() -> Self {
        Self::new()
    }
}
