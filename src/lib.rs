/*!
 * Synq
 *
 * A CLH-queue based blocking-synchronization engine and the worker pool
 * built directly on it. Higher-level primitives (mutexes, semaphores,
 * latches, condition variables, task-execution pools) share one
 * implementation of "wait until a condition on shared integer state becomes
 * true, then proceed; otherwise queue and suspend."
 */

pub mod core;
pub mod pool;
pub mod sync;

// Re-exports
pub use self::core::{current_context, CancelToken, PoolError, PoolResult, SyncError, SyncResult};
pub use pool::{
    AbortPolicy, BlockingTaskQueue, CallerRunsPolicy, ContextFactory, DiscardOldestPolicy,
    DiscardPolicy, PoolBuilder, PoolConfig, PoolHooks, RejectionPolicy, RunState, Task, TaskQueue,
    ThreadFactory, WorkerPool,
};
pub use sync::{Condvar, ConditionQueue, Latch, Mutex, MutexGuard, Semaphore, SyncEngine, SyncOps};
