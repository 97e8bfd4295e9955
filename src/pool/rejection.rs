/*!
 * Rejection Policies
 * Strategies invoked when the pool cannot accept new work
 */

use super::executor::WorkerPool;
use super::task::Task;
use crate::core::errors::{PoolError, PoolResult};
use log::{debug, warn};

/// Strategy for tasks the pool cannot accept
pub trait RejectionPolicy: Send + Sync {
    fn reject(&self, task: Task, pool: &WorkerPool) -> PoolResult<()>;
}

/// Default: surface the rejection as an error carrying the task back
#[derive(Debug, Default)]
pub struct AbortPolicy;

impl RejectionPolicy for AbortPolicy {
    fn reject(&self, task: Task, _pool: &WorkerPool) -> PoolResult<()> {
        warn!("task {} rejected", task.id());
        Err(PoolError::Rejected(task))
    }
}

/// Run the task inline on the submitting context, unless already shut down
#[derive(Debug, Default)]
pub struct CallerRunsPolicy;

impl RejectionPolicy for CallerRunsPolicy {
    fn reject(&self, task: Task, pool: &WorkerPool) -> PoolResult<()> {
        if pool.is_shutdown() {
            return Ok(());
        }
        let mut task = task;
        task.run();
        Ok(())
    }
}

/// Drop the task silently
#[derive(Debug, Default)]
pub struct DiscardPolicy;

impl RejectionPolicy for DiscardPolicy {
    fn reject(&self, task: Task, _pool: &WorkerPool) -> PoolResult<()> {
        debug!("task {} discarded", task.id());
        Ok(())
    }
}

/// Evict the queue's current head, then retry the submission once
#[derive(Debug, Default)]
pub struct DiscardOldestPolicy;

impl RejectionPolicy for DiscardOldestPolicy {
    fn reject(&self, task: Task, pool: &WorkerPool) -> PoolResult<()> {
        if pool.is_shutdown() {
            return Ok(());
        }
        if let Some(evicted) = pool.queue().try_poll() {
            debug!("task {} evicted to make room", evicted.id());
        }
        pool.execute_task(task)
    }
}
