/*!
 * Task Queue
 *
 * The pool consumes tasks through the `TaskQueue` trait only; any
 * concurrent blocking queue can stand behind it. `BlockingTaskQueue` is the
 * reference implementation, built on this crate's own mutex and condition
 * variables, with unbounded, bounded, and direct-handoff (capacity 0)
 * flavors.
 */

use super::task::Task;
use crate::core::ctx::CancelToken;
use crate::core::errors::SyncResult;
use crate::sync::primitives::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Blocking multi-producer/multi-consumer task queue contract
pub trait TaskQueue: Send + Sync {
    /// Non-blocking insert; hands the task back when the queue refuses it.
    fn offer(&self, task: Task) -> Result<(), Task>;

    /// Blocking remove with a timeout. `Ok(None)` = timed out.
    fn poll(&self, timeout: Duration, cancel: &CancelToken) -> SyncResult<Option<Task>>;

    /// Blocking remove; suspends until a task is available or cancelled.
    fn take(&self, cancel: &CancelToken) -> SyncResult<Task>;

    /// Non-blocking remove of the head, if any.
    fn try_poll(&self) -> Option<Task>;

    /// Remove a not-yet-started task by id.
    fn remove(&self, id: u64) -> Option<Task>;

    /// Remove and return every queued task.
    fn drain(&self) -> Vec<Task>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct QueueInner {
    items: VecDeque<Task>,
    /// Consumers currently blocked in `poll`/`take`; drives direct handoff.
    polling: usize,
}

/// Reference `TaskQueue` built on the crate's own lock and conditions
pub struct BlockingTaskQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    capacity: Option<usize>,
}

impl BlockingTaskQueue {
    pub fn unbounded() -> Self {
        Self::build(None)
    }

    /// `capacity` 0 creates a direct-handoff queue: an offer succeeds only
    /// when a consumer is already waiting.
    pub fn bounded(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<usize>) -> Self {
        let inner = Mutex::new(QueueInner {
            items: VecDeque::new(),
            polling: 0,
        });
        let not_empty = Condvar::new(&inner);
        Self {
            inner,
            not_empty,
            capacity,
        }
    }
}

impl TaskQueue for BlockingTaskQueue {
    fn offer(&self, task: Task) -> Result<(), Task> {
        let mut guard = self.inner.lock();
        let accept = match self.capacity {
            None => true,
            // Direct handoff: only pair with an already-waiting consumer.
            Some(0) => guard.polling > guard.items.len(),
            Some(cap) => guard.items.len() < cap,
        };
        if !accept {
            return Err(task);
        }
        guard.items.push_back(task);
        let _ = self.not_empty.notify_one();
        Ok(())
    }

    fn poll(&self, timeout: Duration, cancel: &CancelToken) -> SyncResult<Option<Task>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock_interruptibly(cancel)?;
        guard.polling += 1;
        let outcome = loop {
            if let Some(task) = guard.items.pop_front() {
                break Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(None);
            }
            match self
                .not_empty
                .wait_interruptibly_for(&mut guard, deadline - now, cancel)
            {
                Ok(_) => {}
                Err(e) => break Err(e),
            }
        };
        guard.polling -= 1;
        outcome
    }

    fn take(&self, cancel: &CancelToken) -> SyncResult<Task> {
        let mut guard = self.inner.lock_interruptibly(cancel)?;
        guard.polling += 1;
        let outcome = loop {
            if let Some(task) = guard.items.pop_front() {
                break Ok(task);
            }
            match self.not_empty.wait_interruptibly(&mut guard, cancel) {
                Ok(()) => {}
                Err(e) => break Err(e),
            }
        };
        guard.polling -= 1;
        outcome
    }

    fn try_poll(&self) -> Option<Task> {
        self.inner.lock().items.pop_front()
    }

    fn remove(&self, id: u64) -> Option<Task> {
        let mut guard = self.inner.lock();
        let index = guard.items.iter().position(|t| t.id() == id)?;
        guard.items.remove(index)
    }

    fn drain(&self) -> Vec<Task> {
        self.inner.lock().items.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().items.len()
    }
}

impl std::fmt::Debug for BlockingTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingTaskQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
