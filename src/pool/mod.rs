/*!
 * Worker Pool
 *
 * Task-execution pool built directly on the synchronization engine: a packed
 * run-state/worker-count control word, per-worker probe mutexes, and a
 * pool-level mutex + condition for the termination protocol.
 */

pub mod config;
pub mod ctl;
pub mod executor;
pub mod queue;
pub mod rejection;
pub mod task;
mod worker;

pub use config::PoolConfig;
pub use ctl::RunState;
pub use executor::{ContextFactory, NoopHooks, PoolBuilder, PoolHooks, ThreadFactory, WorkerPool};
pub use queue::{BlockingTaskQueue, TaskQueue};
pub use rejection::{
    AbortPolicy, CallerRunsPolicy, DiscardOldestPolicy, DiscardPolicy, RejectionPolicy,
};
pub use task::Task;
