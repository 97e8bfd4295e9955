/*!
 * Worker Pool Integration Tests
 * Lifecycle, sizing, rejection, and replacement behavior end to end
 */

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use synq::{
    BlockingTaskQueue, CallerRunsPolicy, ContextFactory, DiscardOldestPolicy, DiscardPolicy,
    PoolError, PoolHooks, PoolResult, RunState, Task, ThreadFactory, WorkerPool,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spin until `predicate` holds, failing the test after `secs` seconds.
fn wait_until(secs: u64, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::yield_now();
    }
}

#[test]
fn test_core_pool_runs_everything_without_growing() {
    // core=2, max=4, unbounded queue, 10 short tasks: exactly two workers
    // are ever created and all ten tasks complete.
    init_logging();
    let pool = WorkerPool::builder()
        .core_workers(2)
        .max_workers(4)
        .name("t-core")
        .build()
        .unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    for _ in 0..10 {
        let ran = ran.clone();
        pool.execute(move || {
            thread::sleep(Duration::from_millis(5));
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert_eq!(ran.load(Ordering::SeqCst), 10);
    assert_eq!(pool.completed_task_count(), 10);
    assert_eq!(pool.largest_pool_size(), 2);
}

#[test]
fn test_direct_handoff_saturation_rejects() {
    // core=0, max=1, capacity-0 handoff queue, abort policy: a second task
    // submitted while the only worker is busy is rejected.
    let pool = WorkerPool::builder()
        .core_workers(0)
        .max_workers(1)
        .queue(Arc::new(BlockingTaskQueue::bounded(0)))
        .name("t-handoff")
        .build()
        .unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    {
        let release = release.clone();
        let started = started.clone();
        pool.execute(move || {
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        })
        .unwrap();
    }
    wait_until(5, || started.load(Ordering::SeqCst));

    let outcome = pool.execute(|| {});
    assert!(matches!(outcome, Err(PoolError::Rejected(_))));

    release.store(true, Ordering::SeqCst);
    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert_eq!(pool.completed_task_count(), 1);
}

/// Counts spawned contexts, delegating to the real thread factory.
struct CountingFactory {
    spawned: Arc<AtomicUsize>,
    inner: ThreadFactory,
}

impl ContextFactory for CountingFactory {
    fn spawn(&self, name: String, body: Box<dyn FnOnce() + Send + 'static>) -> PoolResult<()> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.inner.spawn(name, body)
    }
}

/// Records whether after_execute ever observed a panic payload.
struct PanicObserver {
    saw_panic: Arc<AtomicBool>,
}

impl PoolHooks for PanicObserver {
    fn after_execute(&self, _task: &Task, panic: Option<&(dyn Any + Send)>) {
        if panic.is_some() {
            self.saw_panic.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_panicking_task_triggers_replacement() {
    init_logging();
    let spawned = Arc::new(AtomicUsize::new(0));
    let saw_panic = Arc::new(AtomicBool::new(false));
    let pool = WorkerPool::builder()
        .core_workers(1)
        .max_workers(1)
        .name("t-replace")
        .factory(CountingFactory {
            spawned: spawned.clone(),
            inner: ThreadFactory,
        })
        .hooks(PanicObserver {
            saw_panic: saw_panic.clone(),
        })
        .build()
        .unwrap();

    pool.execute(|| panic!("boom")).unwrap();

    // The panicking worker exits abruptly and a replacement is spawned to
    // keep the pool at its core size; the follow-up task runs on it.
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        pool.execute(move || ran.store(true, Ordering::SeqCst)).unwrap();
    }
    wait_until(10, || ran.load(Ordering::SeqCst));

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert!(saw_panic.load(Ordering::SeqCst));
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
    assert_eq!(pool.completed_task_count(), 2);
}

#[test]
fn test_shutdown_is_idempotent() {
    let pool = WorkerPool::fixed(2).unwrap();
    pool.execute(|| {}).unwrap();

    pool.shutdown();
    pool.shutdown();
    assert!(pool.is_shutdown());
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert_eq!(pool.run_state(), RunState::Terminated);

    // Shutting down a terminated pool stays terminated.
    pool.shutdown();
    assert!(pool.is_terminated());
}

#[test]
fn test_shutdown_now_returns_unstarted_tasks() {
    let pool = WorkerPool::fixed(1).unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    {
        let release = release.clone();
        let started = started.clone();
        pool.execute(move || {
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        })
        .unwrap();
    }
    wait_until(5, || started.load(Ordering::SeqCst));

    let queued_ran = Arc::new(AtomicU32::new(0));
    for _ in 0..3 {
        let queued_ran = queued_ran.clone();
        pool.execute(move || {
            queued_ran.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    let unstarted = pool.shutdown_now();
    assert_eq!(unstarted.len(), 3);

    release.store(true, Ordering::SeqCst);
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert_eq!(queued_ran.load(Ordering::SeqCst), 0);
    assert_eq!(pool.completed_task_count(), 1);
}

#[test]
fn test_caller_runs_policy_executes_inline() {
    let pool = WorkerPool::builder()
        .core_workers(0)
        .max_workers(1)
        .queue(Arc::new(BlockingTaskQueue::bounded(0)))
        .rejection(CallerRunsPolicy)
        .name("t-caller")
        .build()
        .unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    {
        let release = release.clone();
        let started = started.clone();
        pool.execute(move || {
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        })
        .unwrap();
    }
    wait_until(5, || started.load(Ordering::SeqCst));

    let caller = thread::current().id();
    let ran_on = Arc::new(std::sync::Mutex::new(None));
    {
        let ran_on = ran_on.clone();
        pool.execute(move || {
            *ran_on.lock().unwrap() = Some(thread::current().id());
        })
        .unwrap();
    }
    assert_eq!(*ran_on.lock().unwrap(), Some(caller));

    release.store(true, Ordering::SeqCst);
    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
}

#[test]
fn test_discard_oldest_policy_evicts_head() {
    let pool = WorkerPool::builder()
        .core_workers(1)
        .max_workers(1)
        .queue(Arc::new(BlockingTaskQueue::bounded(1)))
        .rejection(DiscardOldestPolicy)
        .name("t-oldest")
        .build()
        .unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    {
        let release = release.clone();
        let started = started.clone();
        pool.execute(move || {
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        })
        .unwrap();
    }
    wait_until(5, || started.load(Ordering::SeqCst));

    let old_ran = Arc::new(AtomicBool::new(false));
    let new_ran = Arc::new(AtomicBool::new(false));
    {
        let old_ran = old_ran.clone();
        pool.execute(move || old_ran.store(true, Ordering::SeqCst)).unwrap();
    }
    {
        let new_ran = new_ran.clone();
        pool.execute(move || new_ran.store(true, Ordering::SeqCst)).unwrap();
    }

    release.store(true, Ordering::SeqCst);
    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert!(!old_ran.load(Ordering::SeqCst), "evicted task must not run");
    assert!(new_ran.load(Ordering::SeqCst));
}

#[test]
fn test_discard_policy_drops_silently() {
    let pool = WorkerPool::builder()
        .core_workers(0)
        .max_workers(1)
        .queue(Arc::new(BlockingTaskQueue::bounded(0)))
        .rejection(DiscardPolicy)
        .name("t-discard")
        .build()
        .unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    {
        let release = release.clone();
        let started = started.clone();
        pool.execute(move || {
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        })
        .unwrap();
    }
    wait_until(5, || started.load(Ordering::SeqCst));

    let dropped = Arc::new(AtomicBool::new(false));
    {
        let dropped = dropped.clone();
        // Refused by the busy handoff queue, then silently discarded.
        pool.execute(move || dropped.store(true, Ordering::SeqCst)).unwrap();
    }

    release.store(true, Ordering::SeqCst);
    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert!(!dropped.load(Ordering::SeqCst));
}

#[test]
fn test_excess_workers_shrink_after_keep_alive() {
    let pool = WorkerPool::builder()
        .core_workers(1)
        .max_workers(3)
        .keep_alive(Duration::from_millis(100))
        .queue(Arc::new(BlockingTaskQueue::bounded(1)))
        .name("t-shrink")
        .build()
        .unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicU32::new(0));
    // Three blocking tasks plus one queued force the pool to its max.
    for _ in 0..4 {
        let release = release.clone();
        let running = running.clone();
        pool.execute(move || {
            running.fetch_add(1, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            running.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    wait_until(5, || running.load(Ordering::SeqCst) == 3);
    assert_eq!(pool.pool_size(), 3);

    release.store(true, Ordering::SeqCst);
    // Workers above the core size exit once their idle poll times out.
    wait_until(10, || pool.pool_size() == 1);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert_eq!(pool.completed_task_count(), 4);
}

#[test]
fn test_queued_work_spawns_consumer_when_pool_empty() {
    // core=0 with an unbounded queue: enqueued work must still get one
    // consumer spawned for it.
    let pool = WorkerPool::builder()
        .core_workers(0)
        .max_workers(1)
        .keep_alive(Duration::from_millis(100))
        .name("t-zero-core")
        .build()
        .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        pool.execute(move || ran.store(true, Ordering::SeqCst)).unwrap();
    }
    wait_until(10, || ran.load(Ordering::SeqCst));

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
}

#[test]
fn test_active_count_tracks_busy_workers() {
    let pool = WorkerPool::fixed(2).unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicU32::new(0));
    for _ in 0..2 {
        let release = release.clone();
        let running = running.clone();
        pool.execute(move || {
            running.fetch_add(1, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        })
        .unwrap();
    }
    wait_until(5, || running.load(Ordering::SeqCst) == 2);
    assert_eq!(pool.active_count(), 2);

    release.store(true, Ordering::SeqCst);
    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert_eq!(pool.active_count(), 0);
}
