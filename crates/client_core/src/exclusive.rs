use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// FIFO mutual exclusion. Acquiring again while holding a ticket deadlocks.
#[derive(Debug, Default)]
pub struct ExclusiveTaskQueue {
    slot: Arc<Mutex<()>>,
    waiting: Arc<AtomicUsize>,
}

#[derive(Debug)]
#[must_use = "the exclusive region ends as soon as the ticket is dropped"]
pub struct ExclusiveTicket {
    _guard: OwnedMutexGuard<()>,
}

impl ExclusiveTicket {
    pub fn release(self) {}
}

struct WaitingGuard(Arc<AtomicUsize>);

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExclusiveTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> ExclusiveTicket {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(Arc::clone(&self.waiting));
        let guard = Arc::clone(&self.slot).lock_owned().await;
        ExclusiveTicket { _guard: guard }
    }

    /// Returns a ticket only if nobody holds or waits for the queue.
    pub fn try_acquire(&self) -> Option<ExclusiveTicket> {
        if self.waiting.load(Ordering::SeqCst) > 0 {
            return None;
        }
        Arc::clone(&self.slot)
            .try_lock_owned()
            .ok()
            .map(|guard| ExclusiveTicket { _guard: guard })
    }

    pub async fn run_exclusive<F, Fut, T>(&self, region: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = self.acquire().await;
        let output = region().await;
        ticket.release();
        output
    }

    pub fn is_held(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct KeyedTaskQueues<K> {
    queues: Mutex<HashMap<K, Arc<ExclusiveTaskQueue>>>,
}

impl<K> Default for KeyedTaskQueues<K> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedTaskQueues<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue_for(&self, key: &K) -> Arc<ExclusiveTaskQueue> {
        let mut queues = self.queues.lock().await;
        // Drop queues nobody references and nobody is inside.
        queues.retain(|_, queue| Arc::strong_count(queue) > 1 || queue.is_held());
        Arc::clone(
            queues
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ExclusiveTaskQueue::new())),
        )
    }

    pub async fn run_exclusive<F, Fut, T>(&self, key: &K, region: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let queue = self.queue_for(key).await;
        queue.run_exclusive(region).await
    }

    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queues.lock().await.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/exclusive_tests.rs"]
mod tests;
