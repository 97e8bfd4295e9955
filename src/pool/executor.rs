/*!
 * Worker Pool
 *
 * A bounded/unbounded pool of execution contexts pulling tasks from a
 * `TaskQueue`. Lifecycle is a monotonic state machine packed with the live
 * worker count into one atomic control word; the worker set and termination
 * signalling sit behind one coarse pool-level mutex built on the same
 * synchronization engine the workers' private mutexes use.
 *
 * Lock discipline: the pool mutex is non-reentrant and nests only one level
 * deep (pool mutex -> a worker's probe lock). Termination checks and idle
 * wakeups therefore run after the pool mutex is dropped, never under a
 * re-entered one.
 */

use super::config::PoolConfig;
use super::ctl::{PoolCtl, RunState};
use super::queue::{BlockingTaskQueue, TaskQueue};
use super::rejection::{AbortPolicy, RejectionPolicy};
use super::task::Task;
use super::worker::Worker;
use crate::core::errors::{PoolError, PoolResult};
use crate::sync::primitives::{Condvar, Mutex};
use log::{debug, error, info, warn};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Overridable lifecycle hooks, all no-ops by default
pub trait PoolHooks: Send + Sync {
    /// Invoked on the worker context immediately before a task runs.
    fn before_execute(&self, worker_id: u64, task: &Task) {
        let _ = (worker_id, task);
    }

    /// Invoked after a task runs, with the panic payload on failure. Invoked
    /// even when the task failed.
    fn after_execute(&self, task: &Task, panic: Option<&(dyn Any + Send)>) {
        let _ = (task, panic);
    }

    /// Invoked once when the pool begins a graceful shutdown.
    fn on_shutdown(&self) {}

    /// Invoked once, between TIDYING and TERMINATED.
    fn terminated(&self) {}
}

/// Default no-op hooks
#[derive(Debug, Default)]
pub struct NoopHooks;

impl PoolHooks for NoopHooks {}

/// Factory for schedulable execution contexts
pub trait ContextFactory: Send + Sync {
    fn spawn(&self, name: String, body: Box<dyn FnOnce() + Send + 'static>) -> PoolResult<()>;
}

/// Default factory: one named OS thread per worker
#[derive(Debug, Default)]
pub struct ThreadFactory;

impl ContextFactory for ThreadFactory {
    fn spawn(&self, name: String, body: Box<dyn FnOnce() + Send + 'static>) -> PoolResult<()> {
        std::thread::Builder::new()
            .name(name)
            .spawn(body)
            .map(|_| ())
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))
    }
}

struct PoolInner {
    workers: HashMap<u64, Arc<Worker>, ahash::RandomState>,
    largest_pool_size: usize,
    /// Completed counts folded in from exited workers
    completed_tasks: u64,
}

struct PoolShared {
    ctl: PoolCtl,
    queue: Arc<dyn TaskQueue>,
    inner: Mutex<PoolInner>,
    termination: Condvar,
    core: usize,
    max: usize,
    keep_alive: Duration,
    allow_core_timeout: AtomicBool,
    name: String,
    factory: Box<dyn ContextFactory>,
    rejection: Box<dyn RejectionPolicy>,
    hooks: Box<dyn PoolHooks>,
    next_worker_id: AtomicU64,
}

/// Handle to a worker pool; clones share the same pool
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.shared.ctl.load();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("run_state", &PoolCtl::run_state(c))
            .field("workers", &PoolCtl::worker_count(c))
            .finish()
    }
}

/// Builder for [`WorkerPool`]
pub struct PoolBuilder {
    config: PoolConfig,
    queue: Option<Arc<dyn TaskQueue>>,
    factory: Option<Box<dyn ContextFactory>>,
    rejection: Option<Box<dyn RejectionPolicy>>,
    hooks: Option<Box<dyn PoolHooks>>,
}

impl PoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn core_workers(mut self, n: usize) -> Self {
        self.config.core_workers = n;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn allow_core_timeout(mut self, allow: bool) -> Self {
        self.config.allow_core_timeout = allow;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn factory(mut self, factory: impl ContextFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn rejection(mut self, policy: impl RejectionPolicy + 'static) -> Self {
        self.rejection = Some(Box::new(policy));
        self
    }

    pub fn hooks(mut self, hooks: impl PoolHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    pub fn build(self) -> PoolResult<WorkerPool> {
        self.config.validate()?;
        let inner = Mutex::new(PoolInner {
            workers: HashMap::with_hasher(ahash::RandomState::new()),
            largest_pool_size: 0,
            completed_tasks: 0,
        });
        let termination = Condvar::new(&inner);
        let shared = Arc::new(PoolShared {
            ctl: PoolCtl::new(),
            queue: self
                .queue
                .unwrap_or_else(|| Arc::new(BlockingTaskQueue::unbounded())),
            inner,
            termination,
            core: self.config.core_workers,
            max: self.config.max_workers,
            keep_alive: self.config.keep_alive,
            allow_core_timeout: AtomicBool::new(self.config.allow_core_timeout),
            name: self.config.name,
            factory: self.factory.unwrap_or_else(|| Box::new(ThreadFactory)),
            rejection: self.rejection.unwrap_or_else(|| Box::new(AbortPolicy)),
            hooks: self.hooks.unwrap_or_else(|| Box::new(NoopHooks)),
            next_worker_id: AtomicU64::new(1),
        });
        info!(
            "pool '{}' created (core={}, max={})",
            shared.name, shared.core, shared.max
        );
        Ok(WorkerPool { shared })
    }
}

impl WorkerPool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            config: PoolConfig::default(),
            queue: None,
            factory: None,
            rejection: None,
            hooks: None,
        }
    }

    /// Fixed-size pool over an unbounded queue
    pub fn fixed(workers: usize) -> PoolResult<Self> {
        Self::builder().config(PoolConfig::fixed(workers)).build()
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submit a closure for execution.
    pub fn execute(&self, body: impl FnOnce() + Send + 'static) -> PoolResult<()> {
        self.execute_task(Task::new(body))
    }

    /// Submit a prepared task: spawn a core worker with it, else enqueue,
    /// else spawn up to max, else invoke the rejection policy.
    pub fn execute_task(&self, task: Task) -> PoolResult<()> {
        let shared = &self.shared;
        let mut task = task;

        let c = shared.ctl.load();
        if PoolCtl::worker_count(c) < shared.core as u64 {
            match self.add_worker(Some(task), true) {
                Ok(()) => return Ok(()),
                Err(returned) => match returned {
                    Some(t) => task = t,
                    None => return Ok(()),
                },
            }
        }

        let c = shared.ctl.load();
        if PoolCtl::is_running(c) {
            let id = task.id();
            match shared.queue.offer(task) {
                Ok(()) => {
                    // Re-check: the pool may have shut down around the offer.
                    let recheck = shared.ctl.load();
                    if !PoolCtl::is_running(recheck) {
                        if let Some(backed_out) = shared.queue.remove(id) {
                            return self.reject(backed_out);
                        }
                    }
                    if PoolCtl::worker_count(recheck) == 0 {
                        // Queued work needs at least one consumer.
                        let _ = self.add_worker(None, false);
                    }
                    return Ok(());
                }
                Err(refused) => task = refused,
            }
        }

        match self.add_worker(Some(task), false) {
            Ok(()) => Ok(()),
            Err(Some(returned)) => self.reject(returned),
            Err(None) => Ok(()),
        }
    }

    fn reject(&self, task: Task) -> PoolResult<()> {
        self.shared.rejection.reject(task, self)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop accepting tasks; queued tasks still run. Idempotent.
    pub fn shutdown(&self) {
        {
            let _guard = self.shared.inner.lock();
            self.shared.ctl.advance_run_state(RunState::Shutdown);
        }
        self.interrupt_idle_workers(false);
        self.shared.hooks.on_shutdown();
        self.try_terminate();
        info!("pool '{}' shutting down", self.shared.name);
    }

    /// Stop accepting and running tasks; cancel every started worker.
    /// Returns the tasks that never started.
    pub fn shutdown_now(&self) -> Vec<Task> {
        {
            let _guard = self.shared.inner.lock();
            self.shared.ctl.advance_run_state(RunState::Stop);
        }
        {
            let guard = self.shared.inner.lock();
            for worker in guard.workers.values() {
                worker.cancel_if_started();
            }
        }
        let unstarted = self.shared.queue.drain();
        self.try_terminate();
        info!(
            "pool '{}' stopped; {} queued tasks returned",
            self.shared.name,
            unstarted.len()
        );
        unstarted
    }

    /// Block until the pool reaches TERMINATED or the timeout elapses.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.inner.lock();
        loop {
            if PoolCtl::run_state(self.shared.ctl.load()) >= RunState::Terminated {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.shared.termination.wait_until(&mut guard, deadline);
        }
    }

    /// SHUTDOWN with an empty queue, or STOP, with no workers left: advance
    /// to TIDYING, run the hook, reach TERMINATED, and wake the waiters.
    /// While workers remain, nudge exactly one idle worker so the shutdown
    /// signal propagates without a wake storm.
    fn try_terminate(&self) {
        let shared = &self.shared;
        loop {
            let c = shared.ctl.load();
            let rs = PoolCtl::run_state(c);
            if rs == RunState::Running
                || rs >= RunState::Tidying
                || (rs == RunState::Shutdown && !shared.queue.is_empty())
            {
                return;
            }
            if PoolCtl::worker_count(c) != 0 {
                self.interrupt_idle_workers(true);
                return;
            }

            let guard = shared.inner.lock();
            if shared.ctl.cas(c, PoolCtl::pack(RunState::Tidying, 0)) {
                if panic::catch_unwind(AssertUnwindSafe(|| shared.hooks.terminated())).is_err() {
                    error!("terminated() hook panicked in pool '{}'", shared.name);
                }
                shared.ctl.store(PoolCtl::pack(RunState::Terminated, 0));
                let _ = shared.termination.notify_all();
                info!("pool '{}' terminated", shared.name);
                return;
            }
            drop(guard);
        }
    }

    /// Cancel idle workers (those whose probe lock is free); all of them or
    /// just one.
    fn interrupt_idle_workers(&self, only_one: bool) {
        let guard = self.shared.inner.lock();
        for worker in guard.workers.values() {
            if !worker.cancel.is_cancelled() && worker.lock.try_lock() {
                worker.cancel.cancel();
                worker.lock.unlock();
            }
            if only_one {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker management
    // ------------------------------------------------------------------

    /// Reserve a slot in the control word, register a worker, and start its
    /// context. On any failure the count is rolled back and the first task
    /// (if any) handed back.
    fn add_worker(
        &self,
        mut first: Option<Task>,
        core_bound: bool,
    ) -> Result<(), Option<Task>> {
        let shared = &self.shared;
        let had_first = first.is_some();

        let mut c = shared.ctl.load();
        'retry: loop {
            let rs = PoolCtl::run_state(c);
            // Past SHUTDOWN, only queue-draining replacements may start.
            if rs >= RunState::Shutdown
                && (rs >= RunState::Stop || had_first || shared.queue.is_empty())
            {
                return Err(first);
            }
            loop {
                let bound = if core_bound { shared.core } else { shared.max } as u64;
                if PoolCtl::worker_count(c) >= bound {
                    return Err(first);
                }
                if shared.ctl.try_inc_count(c) {
                    break 'retry;
                }
                c = shared.ctl.load();
                if PoolCtl::run_state(c) >= RunState::Shutdown {
                    continue 'retry;
                }
            }
        }

        let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(Worker::new(id, first.take()));

        let mut registered = false;
        {
            let mut inner = shared.inner.lock();
            let rs = PoolCtl::run_state(shared.ctl.load());
            if rs < RunState::Shutdown || (rs == RunState::Shutdown && !had_first) {
                inner.workers.insert(id, worker.clone());
                let size = inner.workers.len();
                if size > inner.largest_pool_size {
                    inner.largest_pool_size = size;
                }
                registered = true;
            }
        }

        let started = registered && {
            let name = format!("{}-{}", shared.name, id);
            let pool = self.clone();
            let w = worker.clone();
            match shared.factory.spawn(name, Box::new(move || run_worker(pool, w))) {
                Ok(()) => true,
                Err(e) => {
                    warn!("pool '{}' failed to start worker {}: {}", shared.name, id, e);
                    false
                }
            }
        };

        if !started {
            let returned = worker.first_task.lock().take();
            {
                let mut inner = shared.inner.lock();
                inner.workers.remove(&id);
            }
            shared.ctl.dec_count();
            self.try_terminate();
            return Err(returned);
        }

        debug!(
            "pool '{}' started worker {} ({})",
            shared.name,
            id,
            if core_bound { "core" } else { "max" }
        );
        Ok(())
    }

    /// Pull the next task for a worker, or decide that the worker must exit:
    /// at SHUTDOWN with an empty queue, past STOP, or after an idle timeout
    /// while excess workers exist.
    fn get_task(&self, worker: &Worker) -> Option<Task> {
        let shared = &self.shared;
        let mut timed_out = false;
        loop {
            let c = shared.ctl.load();
            let rs = PoolCtl::run_state(c);
            if rs >= RunState::Shutdown && (rs >= RunState::Stop || shared.queue.is_empty()) {
                shared.ctl.dec_count();
                return None;
            }

            let wc = PoolCtl::worker_count(c);
            let timed =
                shared.allow_core_timeout.load(Ordering::Acquire) || wc > shared.core as u64;

            if (wc > shared.max as u64 || (timed && timed_out))
                && (wc > 1 || shared.queue.is_empty())
            {
                if shared.ctl.try_dec_count(c) {
                    return None;
                }
                continue;
            }

            let pulled = if timed {
                shared.queue.poll(shared.keep_alive, &worker.cancel)
            } else {
                shared.queue.take(&worker.cancel).map(Some)
            };
            match pulled {
                Ok(Some(task)) => return Some(task),
                Ok(None) => timed_out = true,
                // Cancellation here is a state-change nudge, not an exit
                // order; the loop re-reads the control word.
                Err(_) => timed_out = false,
            }
        }
    }

    /// Unregister an exiting worker, fold its counts into the pool total,
    /// re-check termination, and spawn a replacement when the live count
    /// would drop below the required minimum.
    fn process_worker_exit(&self, worker: &Arc<Worker>, abrupt: bool) {
        let shared = &self.shared;
        if abrupt {
            shared.ctl.dec_count();
        }
        {
            let mut inner = shared.inner.lock();
            inner.completed_tasks += worker.completed.load(Ordering::Relaxed);
            inner.workers.remove(&worker.id);
        }
        self.try_terminate();

        let c = shared.ctl.load();
        if PoolCtl::run_state(c) < RunState::Stop {
            if !abrupt {
                let mut min = if shared.allow_core_timeout.load(Ordering::Acquire) {
                    0
                } else {
                    shared.core as u64
                };
                if min == 0 && !shared.queue.is_empty() {
                    min = 1;
                }
                if PoolCtl::worker_count(c) >= min {
                    return;
                }
            }
            let _ = self.add_worker(None, false);
        }
    }

    // ------------------------------------------------------------------
    // Introspection and tuning
    // ------------------------------------------------------------------

    pub fn run_state(&self) -> RunState {
        PoolCtl::run_state(self.shared.ctl.load())
    }

    pub fn is_shutdown(&self) -> bool {
        self.run_state() >= RunState::Shutdown
    }

    pub fn is_terminating(&self) -> bool {
        let rs = self.run_state();
        rs > RunState::Running && rs < RunState::Terminated
    }

    pub fn is_terminated(&self) -> bool {
        self.run_state() >= RunState::Terminated
    }

    /// Current live worker count
    pub fn pool_size(&self) -> usize {
        PoolCtl::worker_count(self.shared.ctl.load()) as usize
    }

    /// Workers currently running a task
    pub fn active_count(&self) -> usize {
        let guard = self.shared.inner.lock();
        guard
            .workers
            .values()
            .filter(|w| w.lock.is_locked())
            .count()
    }

    pub fn largest_pool_size(&self) -> usize {
        self.shared.inner.lock().largest_pool_size
    }

    /// Tasks completed across the pool's lifetime (settled after
    /// `await_termination`)
    pub fn completed_task_count(&self) -> u64 {
        let guard = self.shared.inner.lock();
        let live: u64 = guard
            .workers
            .values()
            .map(|w| w.completed.load(Ordering::Relaxed))
            .sum();
        guard.completed_tasks + live
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.shared.queue
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn core_workers(&self) -> usize {
        self.shared.core
    }

    pub fn max_workers(&self) -> usize {
        self.shared.max
    }

    /// Remove a not-yet-started task from the queue.
    pub fn remove(&self, task_id: u64) -> bool {
        let removed = self.shared.queue.remove(task_id).is_some();
        self.try_terminate();
        removed
    }

    /// Start core workers ahead of demand; returns how many were started.
    pub fn prestart_core_workers(&self) -> usize {
        let mut started = 0;
        while PoolCtl::worker_count(self.shared.ctl.load()) < self.shared.core as u64 {
            match self.add_worker(None, true) {
                Ok(()) => started += 1,
                Err(_) => break,
            }
        }
        started
    }

    /// Let idle core workers exit after the keep-alive. Enabling wakes idle
    /// workers so they re-evaluate.
    pub fn set_allow_core_timeout(&self, allow: bool) {
        let before = self
            .shared
            .allow_core_timeout
            .swap(allow, Ordering::AcqRel);
        if allow && !before {
            self.interrupt_idle_workers(false);
        }
    }
}

/// Worker run loop: first task without dequeuing, then `get_task` until it
/// reports exit. Each task runs under the worker's probe lock, bracketed by
/// the hooks; a panic propagates after bookkeeping and marks the exit abrupt.
fn run_worker(pool: WorkerPool, worker: Arc<Worker>) {
    let shared = &pool.shared;
    let mut task = worker.first_task.lock().take();
    worker.lock.enable();

    let mut panic_payload: Option<Box<dyn Any + Send>> = None;
    loop {
        let current = match task.take() {
            Some(t) => Some(t),
            None => pool.get_task(&worker),
        };
        let Some(mut current) = current else { break };

        worker.lock.lock();
        if PoolCtl::run_state(shared.ctl.load()) >= RunState::Stop {
            // Ensure stopping is observable to the task about to run.
            worker.cancel.cancel();
        } else {
            // Absorb a stale idle-wakeup so it cannot land mid-task.
            worker.cancel.take();
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            shared.hooks.before_execute(worker.id, &current);
            match panic::catch_unwind(AssertUnwindSafe(|| current.run())) {
                Ok(()) => {
                    shared.hooks.after_execute(&current, None);
                    Ok(())
                }
                Err(payload) => {
                    shared.hooks.after_execute(&current, Some(payload.as_ref()));
                    Err(payload)
                }
            }
        }));
        worker.completed.fetch_add(1, Ordering::Relaxed);
        worker.lock.unlock();

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(payload)) | Err(payload) => {
                panic_payload = Some(payload);
                break;
            }
        }
    }

    let abrupt = panic_payload.is_some();
    debug!(
        "pool '{}' worker {} exiting ({})",
        shared.name,
        worker.id,
        if abrupt { "abrupt" } else { "normal" }
    );
    pool.process_worker_exit(&worker, abrupt);
    if let Some(payload) = panic_payload {
        error!("pool '{}' worker {} died to a task panic", shared.name, worker.id);
        panic::resume_unwind(payload);
    }
}
