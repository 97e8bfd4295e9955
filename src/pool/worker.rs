/*!
 * Worker
 *
 * One pooled execution context. Each worker carries a private non-reentrant
 * mutex over the engine: holding it while running a task keeps the pool's
 * idle-worker wakeups from landing mid-task, and probing it with `try_lock`
 * is how the pool distinguishes idle workers from busy ones.
 */

use super::task::Task;
use crate::core::ctx::CancelToken;
use crate::core::errors::SyncResult;
use crate::sync::engine::{SyncEngine, SyncOps};
use crate::sync::primitives::Mutex;
use std::sync::atomic::AtomicU64;

struct WorkerLockOps;

impl SyncOps for WorkerLockOps {
    fn try_acquire(&self, engine: &SyncEngine, _arg: i64) -> SyncResult<bool> {
        Ok(engine.cas_state(0, 1))
    }

    fn try_release(&self, engine: &SyncEngine, _arg: i64) -> SyncResult<bool> {
        engine.set_state(0);
        Ok(true)
    }

    fn is_held_exclusively(&self, engine: &SyncEngine) -> SyncResult<bool> {
        Ok(engine.state() == 1)
    }
}

/// Non-reentrant task-bracketing mutex, created inhibited (state -1) so the
/// pool cannot cancel a worker whose run loop has not started yet.
pub(crate) struct WorkerLock {
    engine: SyncEngine,
    ops: WorkerLockOps,
}

impl WorkerLock {
    pub fn new() -> Self {
        let engine = SyncEngine::new();
        engine.set_state(-1);
        Self {
            engine,
            ops: WorkerLockOps,
        }
    }

    /// Leave the inhibited state; cancellation is deliverable from here on.
    pub fn enable(&self) {
        self.engine.set_state(0);
    }

    pub fn lock(&self) {
        self.engine
            .acquire(&self.ops, 1)
            .expect("exclusive hooks are implemented");
    }

    pub fn unlock(&self) {
        let _ = self.engine.release(&self.ops, 1);
    }

    pub fn try_lock(&self) -> bool {
        matches!(self.ops.try_acquire(&self.engine, 1), Ok(true))
    }

    pub fn is_locked(&self) -> bool {
        self.engine.state() == 1
    }

    /// Whether the worker's run loop has begun (lock left the inhibited state)
    pub fn started(&self) -> bool {
        self.engine.state() >= 0
    }
}

pub(crate) struct Worker {
    pub id: u64,
    pub lock: WorkerLock,
    pub cancel: CancelToken,
    /// Task to run before consulting the queue; bypasses the queue entirely.
    pub first_task: Mutex<Option<Task>>,
    pub completed: AtomicU64,
}

impl Worker {
    pub fn new(id: u64, first_task: Option<Task>) -> Self {
        Self {
            id,
            lock: WorkerLock::new(),
            cancel: CancelToken::new(),
            first_task: Mutex::new(first_task),
            completed: AtomicU64::new(0),
        }
    }

    /// Cancel unless the run loop has not started yet.
    pub fn cancel_if_started(&self) {
        if self.lock.started() {
            self.cancel.cancel();
        }
    }
}
