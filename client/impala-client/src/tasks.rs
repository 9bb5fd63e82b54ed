//! Ownership of the client's background tasks

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Every task spawned for one client, aborted together on shutdown
#[derive(Clone, Default)]
pub struct TaskSet {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_all_stops_tasks() {
        let tasks = TaskSet::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(());
        });
        assert_eq!(tasks.len(), 1);

        tasks.abort_all();
        assert!(rx.recv().await.is_none());
        assert!(tasks.is_empty());
    }
}
