/*!
 * Synchronization Engine
 *
 * One atomic state word plus a wait queue, driven by four subclass-supplied
 * primitives (`SyncOps`). Higher-level locks, semaphores, latches and the
 * worker pool's private mutexes are all thin state-machines over this engine.
 *
 * # Design
 *
 * Acquire is a fast-path attempt, a CAS enqueue on failure, then a loop of
 * first-node retries and parks. Release signals the successor of head.
 * FIFO order is not strictly enforced: a newly arriving acquirer may barge
 * ahead of a queued-but-not-yet-retried waiter; primitives that want strict
 * fairness consult `has_queued_predecessor` in their `try_acquire` hook.
 */

use super::node::{NodeKind, WaitNode, WAITING};
use super::queue::WaitQueue;
use crate::core::ctx::{current_context, CancelToken};
use crate::core::errors::{SyncError, SyncResult};
use crate::core::limits;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Acquire/release primitives supplied by a concrete synchronizer.
///
/// Implement only the modes the primitive needs; every unimplemented hook
/// fails with [`SyncError::Unsupported`]. Hooks receive the engine for
/// `state`/`cas_state` access and must not block.
pub trait SyncOps: Send + Sync {
    fn try_acquire(&self, engine: &SyncEngine, arg: i64) -> SyncResult<bool> {
        let _ = (engine, arg);
        Err(SyncError::Unsupported)
    }

    fn try_release(&self, engine: &SyncEngine, arg: i64) -> SyncResult<bool> {
        let _ = (engine, arg);
        Err(SyncError::Unsupported)
    }

    /// Negative = failed; 0 = succeeded, no further shared acquires should be
    /// attempted; positive = succeeded and further shared acquires may also
    /// succeed.
    fn try_acquire_shared(&self, engine: &SyncEngine, arg: i64) -> SyncResult<i64> {
        let _ = (engine, arg);
        Err(SyncError::Unsupported)
    }

    fn try_release_shared(&self, engine: &SyncEngine, arg: i64) -> SyncResult<bool> {
        let _ = (engine, arg);
        Err(SyncError::Unsupported)
    }

    fn is_held_exclusively(&self, engine: &SyncEngine) -> SyncResult<bool> {
        let _ = engine;
        Err(SyncError::Unsupported)
    }
}

/// Outcome of a queued acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireOutcome {
    Acquired,
    TimedOut,
    Cancelled,
}

/// CLH-queue blocking synchronizer core
#[derive(Debug)]
pub struct SyncEngine {
    state: AtomicI64,
    queue: WaitQueue,
    /// Enqueued-node ceiling; at the ceiling waiters degrade to polling.
    node_budget: usize,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::with_node_budget(limits::MAX_QUEUED_NODES)
    }

    pub fn with_node_budget(node_budget: usize) -> Self {
        Self {
            state: AtomicI64::new(0),
            queue: WaitQueue::new(),
            node_budget,
        }
    }

    // ------------------------------------------------------------------
    // State word
    // ------------------------------------------------------------------

    // The state word pairs with node status in a store-then-read-the-other
    // protocol between release and acquire; both sides are sequentially
    // consistent so one of them always observes the other's write.

    #[inline]
    pub fn state(&self) -> i64 {
        self.state.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_state(&self, value: i64) {
        self.state.store(value, Ordering::SeqCst);
    }

    #[inline]
    pub fn cas_state(&self, expect: i64, new: i64) -> bool {
        self.state
            .compare_exchange(expect, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // ------------------------------------------------------------------
    // Queue introspection
    // ------------------------------------------------------------------

    /// Whether any context is queued waiting
    pub fn has_queued_waiters(&self) -> bool {
        self.queue.has_waiters()
    }

    /// Approximate number of queued waiters; converges after cleanup
    pub fn queued_waiters(&self) -> usize {
        self.queue.len_estimate()
    }

    /// Whether a context other than the caller is queued ahead of it.
    /// Fairness-minded `try_acquire` hooks consult this to disable barging.
    pub fn has_queued_predecessor(&self) -> bool {
        self.queue.has_queued_predecessor()
    }

    // ------------------------------------------------------------------
    // Exclusive mode
    // ------------------------------------------------------------------

    /// Acquire in exclusive mode, suspending as needed. Uninterruptible.
    pub fn acquire<O: SyncOps + ?Sized>(&self, ops: &O, arg: i64) -> SyncResult<()> {
        if ops.try_acquire(self, arg)? {
            return Ok(());
        }
        self.do_acquire(ops, arg, false, None, false, None, None)
            .map(|_| ())
    }

    /// Acquire in exclusive mode, absorbing cancellation: a cancel wakes the
    /// waiter spuriously, the acquire still completes, and the token is
    /// re-asserted for the caller to observe afterwards.
    pub fn acquire_uninterruptibly<O: SyncOps + ?Sized>(
        &self,
        ops: &O,
        arg: i64,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        if ops.try_acquire(self, arg)? {
            return Ok(());
        }
        self.do_acquire(ops, arg, false, None, false, None, Some(cancel))
            .map(|_| ())
    }

    /// Acquire in exclusive mode, surfacing cancellation as `Err(Cancelled)`.
    pub fn acquire_interruptibly<O: SyncOps + ?Sized>(
        &self,
        ops: &O,
        arg: i64,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        if cancel.take() {
            return Err(SyncError::Cancelled);
        }
        if ops.try_acquire(self, arg)? {
            return Ok(());
        }
        match self.do_acquire(ops, arg, false, None, true, None, Some(cancel))? {
            AcquireOutcome::Cancelled => Err(SyncError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Timed exclusive acquire: `Ok(false)` when the deadline elapses,
    /// `Err(Cancelled)` when a token is supplied and cancellation observed.
    pub fn acquire_timed<O: SyncOps + ?Sized>(
        &self,
        ops: &O,
        arg: i64,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> SyncResult<bool> {
        if let Some(token) = cancel {
            if token.take() {
                return Err(SyncError::Cancelled);
            }
        }
        if ops.try_acquire(self, arg)? {
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        match self.do_acquire(ops, arg, false, None, cancel.is_some(), Some(deadline), cancel)? {
            AcquireOutcome::Acquired => Ok(true),
            AcquireOutcome::TimedOut => Ok(false),
            AcquireOutcome::Cancelled => Err(SyncError::Cancelled),
        }
    }

    /// Release in exclusive mode; on full release, signal head's successor.
    pub fn release<O: SyncOps + ?Sized>(&self, ops: &O, arg: i64) -> SyncResult<bool> {
        if ops.try_release(self, arg)? {
            self.queue.signal_first();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ------------------------------------------------------------------
    // Shared mode
    // ------------------------------------------------------------------

    pub fn acquire_shared<O: SyncOps + ?Sized>(&self, ops: &O, arg: i64) -> SyncResult<()> {
        if ops.try_acquire_shared(self, arg)? >= 0 {
            return Ok(());
        }
        self.do_acquire(ops, arg, true, None, false, None, None)
            .map(|_| ())
    }

    pub fn acquire_shared_interruptibly<O: SyncOps + ?Sized>(
        &self,
        ops: &O,
        arg: i64,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        if cancel.take() {
            return Err(SyncError::Cancelled);
        }
        if ops.try_acquire_shared(self, arg)? >= 0 {
            return Ok(());
        }
        match self.do_acquire(ops, arg, true, None, true, None, Some(cancel))? {
            AcquireOutcome::Cancelled => Err(SyncError::Cancelled),
            _ => Ok(()),
        }
    }

    pub fn acquire_shared_timed<O: SyncOps + ?Sized>(
        &self,
        ops: &O,
        arg: i64,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> SyncResult<bool> {
        if let Some(token) = cancel {
            if token.take() {
                return Err(SyncError::Cancelled);
            }
        }
        if ops.try_acquire_shared(self, arg)? >= 0 {
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        match self.do_acquire(ops, arg, true, None, cancel.is_some(), Some(deadline), cancel)? {
            AcquireOutcome::Acquired => Ok(true),
            AcquireOutcome::TimedOut => Ok(false),
            AcquireOutcome::Cancelled => Err(SyncError::Cancelled),
        }
    }

    pub fn release_shared<O: SyncOps + ?Sized>(&self, ops: &O, arg: i64) -> SyncResult<bool> {
        if ops.try_release_shared(self, arg)? {
            self.queue.signal_first();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ------------------------------------------------------------------
    // Condition support (crate-internal)
    // ------------------------------------------------------------------

    /// Transfer a signalled condition node onto the main queue.
    pub(crate) fn enqueue_transferred(&self, node: Arc<WaitNode>) {
        self.queue.enqueue(node);
    }

    /// Re-acquire with the state saved before a condition wait, reusing the
    /// caller's node (which may or may not already be on the queue).
    pub(crate) fn reacquire<O: SyncOps + ?Sized>(
        &self,
        ops: &O,
        node: Arc<WaitNode>,
        saved_state: i64,
    ) -> SyncResult<()> {
        self.do_acquire(ops, saved_state, false, Some(node), false, None, None)
            .map(|_| ())
    }

    /// Whether a condition node has truly landed on the main queue. The
    /// `prev` link alone is not proof: a mid-retry transfer writes it before
    /// its tail CAS, so membership means reachability from `tail`.
    pub(crate) fn node_is_enqueued(&self, node: &Arc<WaitNode>) -> bool {
        node.prev.load().is_some() && self.queue.is_enqueued(node)
    }

    // ------------------------------------------------------------------
    // Core acquire loop
    // ------------------------------------------------------------------

    /// Queued acquire. `node` is reused when the caller already owns one
    /// (condition re-acquire); otherwise a node is created lazily after the
    /// first failed retry. Suspension happens only here.
    fn do_acquire<O: SyncOps + ?Sized>(
        &self,
        ops: &O,
        arg: i64,
        shared: bool,
        mut node: Option<Arc<WaitNode>>,
        interruptible: bool,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> SyncResult<AcquireOutcome> {
        let mut spins: u32 = 0;
        let mut post_spins: u32 = 0;
        let mut interrupted = false;
        let mut first = false;
        let mut enqueued = node.as_ref().map_or(false, |n| self.node_is_enqueued(n));
        // Predecessor of our node once queued; retained after we become first.
        let mut pred: Option<Arc<WaitNode>> = None;

        loop {
            // Establish whether our node is now first in line, helping to
            // clean cancelled predecessors on the way.
            if !first {
                pred = node.as_ref().and_then(|n| n.prev.load_full());
                if let Some(p) = &pred {
                    let head = self.queue.head.load_full();
                    if head.as_ref().map_or(false, |h| Arc::ptr_eq(h, p)) {
                        first = true;
                    } else if p.is_cancelled() {
                        self.queue.clean_queue();
                        continue;
                    } else if p.prev.load().is_none() {
                        std::hint::spin_loop(); // predecessor mid-promotion
                        continue;
                    }
                }
            }

            if first || pred.is_none() {
                let mut propagate = 0i64;
                let attempt = if shared {
                    ops.try_acquire_shared(self, arg).map(|v| {
                        propagate = v;
                        v >= 0
                    })
                } else {
                    ops.try_acquire(self, arg)
                };
                let acquired = match attempt {
                    Ok(b) => b,
                    Err(e) => {
                        self.cancel_acquire(node.take(), enqueued, interrupted, interruptible, cancel);
                        return Err(e);
                    }
                };
                if acquired {
                    if first {
                        if let (Some(n), Some(p)) = (node.take(), pred.as_ref()) {
                            self.queue.set_head(&n, p);
                            if shared && propagate > 0 {
                                self.queue.signal_next_shared(&n);
                            }
                        }
                    }
                    if interrupted {
                        if let Some(token) = cancel {
                            token.cancel(); // re-assert for the caller
                        }
                    }
                    return Ok(AcquireOutcome::Acquired);
                }
            }

            let tail = self.queue.tail.load_full();
            if tail.is_none() {
                self.queue.try_initialize();
            } else if node.is_none() {
                if self.queue.len_estimate() >= self.node_budget {
                    // Queue is at its node budget: degrade to polling without
                    // ever touching queue structure.
                    return self.acquire_polling(ops, arg, shared, interruptible, deadline, cancel);
                }
                let kind = if shared {
                    NodeKind::Shared
                } else {
                    NodeKind::Exclusive
                };
                node = Some(WaitNode::new(kind));
            } else if pred.is_none() {
                if let (Some(n), Some(t)) = (node.as_ref(), tail.as_ref()) {
                    n.waiter.store(current_context(), Ordering::Release);
                    if self.queue.try_enqueue(n, t) {
                        enqueued = true;
                    }
                }
            } else if first && spins != 0 {
                spins -= 1;
                std::hint::spin_loop();
            } else if let Some(n) = node.as_ref() {
                if n.status() == 0 {
                    n.status.store(WAITING, Ordering::SeqCst);
                } else {
                    // Double the pre-emptive retry budget on every park
                    // round-trip, saturating at the cap.
                    post_spins = ((post_spins << 1) | 1).min(limits::SPIN_RETRY_CAP);
                    spins = post_spins;
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            break;
                        }
                    }
                    n.park(WAITING, deadline, cancel);
                    n.clear_status();
                    if let Some(token) = cancel {
                        if token.take() {
                            interrupted = true;
                            if interruptible {
                                break;
                            }
                        }
                    }
                }
            }
        }

        Ok(self.cancel_acquire(node, enqueued, interrupted, interruptible, cancel))
    }

    /// Cancel a queued attempt: mark the node, trigger lazy cleanup, and
    /// surface or re-assert the cancellation per mode.
    fn cancel_acquire(
        &self,
        node: Option<Arc<WaitNode>>,
        enqueued: bool,
        interrupted: bool,
        interruptible: bool,
        cancel: Option<&CancelToken>,
    ) -> AcquireOutcome {
        if let Some(n) = node {
            n.waiter.store(0, Ordering::Release);
            n.set_status(super::node::CANCELLED);
            if enqueued {
                self.queue.note_dequeued();
            }
            if n.prev.load().is_some() {
                self.queue.clean_queue();
            }
        }
        if interrupted {
            if interruptible {
                return AcquireOutcome::Cancelled;
            }
            if let Some(token) = cancel {
                token.cancel();
            }
        }
        AcquireOutcome::TimedOut
    }

    /// Queue-free fallback: retry the fast path under exponential backoff.
    /// Preserves correctness at the cost of throughput; never corrupts queue
    /// invariants because it never creates or links nodes.
    fn acquire_polling<O: SyncOps + ?Sized>(
        &self,
        ops: &O,
        arg: i64,
        shared: bool,
        interruptible: bool,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> SyncResult<AcquireOutcome> {
        let mut backoff = PollBackoff::new();
        let mut interrupted = false;
        loop {
            let acquired = if shared {
                ops.try_acquire_shared(self, arg)? >= 0
            } else {
                ops.try_acquire(self, arg)?
            };
            if acquired {
                if interrupted {
                    if let Some(token) = cancel {
                        token.cancel();
                    }
                }
                return Ok(AcquireOutcome::Acquired);
            }
            if let Some(token) = cancel {
                if token.take() {
                    interrupted = true;
                    if interruptible {
                        return Ok(AcquireOutcome::Cancelled);
                    }
                }
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    if interrupted {
                        if let Some(token) = cancel {
                            token.cancel();
                        }
                    }
                    return Ok(AcquireOutcome::TimedOut);
                }
            }
            backoff.snooze();
        }
    }
}

/// Three-phase exponential backoff: tight spin, yield, then capped sleep.
struct PollBackoff {
    iterations: u32,
    sleep_nanos: u64,
}

impl PollBackoff {
    fn new() -> Self {
        Self {
            iterations: 0,
            sleep_nanos: 1,
        }
    }

    fn snooze(&mut self) {
        if self.iterations < limits::POLL_SPIN_PHASE {
            std::hint::spin_loop();
        } else if self.iterations < limits::POLL_YIELD_PHASE {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_nanos(self.sleep_nanos));
            self.sleep_nanos = (self.sleep_nanos * 2).min(limits::POLL_BACKOFF_CAP_NANOS);
        }
        self.iterations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Minimal binary lock over the engine, exclusive mode only.
    struct TestLock {
        fair: bool,
    }

    impl SyncOps for TestLock {
        fn try_acquire(&self, engine: &SyncEngine, _arg: i64) -> SyncResult<bool> {
            if self.fair && engine.has_queued_predecessor() {
                return Ok(false);
            }
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

    fn spawn_contenders(
        engine: Arc<SyncEngine>,
        ops: Arc<TestLock>,
        threads: usize,
        cycles: usize,
    ) -> Arc<AtomicUsize> {
        let in_critical = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let engine = engine.clone();
                let ops = ops.clone();
                let in_critical = in_critical.clone();
                thread::spawn(move || {
                    for _ in 0..cycles {
                        engine.acquire(&*ops, 1).unwrap();
                        let now = in_critical.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(now, 0, "mutual exclusion violated");
                        in_critical.fetch_sub(1, Ordering::SeqCst);
                        engine.release(&*ops, 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        in_critical
    }

    #[test]
    fn test_mutual_exclusion() {
        let engine = Arc::new(SyncEngine::new());
        let ops = Arc::new(TestLock { fair: false });
        spawn_contenders(engine.clone(), ops, 8, 200);
        assert_eq!(engine.state(), 0);
        assert_eq!(engine.queued_waiters(), 0);
    }

    #[test]
    fn test_polling_fallback_mutual_exclusion() {
        // Budget 0: every contended acquire degrades to backoff polling.
        let engine = Arc::new(SyncEngine::with_node_budget(0));
        let ops = Arc::new(TestLock { fair: false });
        spawn_contenders(engine.clone(), ops, 4, 100);
        assert_eq!(engine.state(), 0);
        assert_eq!(engine.queued_waiters(), 0);
    }

    #[test]
    fn test_timed_acquire_times_out() {
        let engine = Arc::new(SyncEngine::new());
        let ops = TestLock { fair: false };
        engine.acquire(&ops, 1).unwrap();

        let acquired = engine
            .acquire_timed(&ops, 1, Duration::from_millis(50), None)
            .unwrap();
        assert!(!acquired);

        engine.release(&ops, 1).unwrap();
        assert!(engine
            .acquire_timed(&ops, 1, Duration::from_millis(50), None)
            .unwrap());
    }

    #[test]
    fn test_interruptible_acquire_cancelled() {
        let engine = Arc::new(SyncEngine::new());
        let ops = Arc::new(TestLock { fair: false });
        engine.acquire(&*ops, 1).unwrap();

        let token = Arc::new(CancelToken::new());
        let e = engine.clone();
        let o = ops.clone();
        let t = token.clone();
        let handle = thread::spawn(move || e.acquire_interruptibly(&*o, 1, &t));

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert_eq!(handle.join().unwrap(), Err(SyncError::Cancelled));

        // The cancelled waiter must not have corrupted the queue.
        engine.release(&*ops, 1).unwrap();
        engine.acquire(&*ops, 1).unwrap();
        engine.release(&*ops, 1).unwrap();
    }

    #[test]
    fn test_cancelled_waiters_cleaned_up() {
        let engine = Arc::new(SyncEngine::new());
        let ops = Arc::new(TestLock { fair: false });
        engine.acquire(&*ops, 1).unwrap();

        let tokens: Vec<_> = (0..4).map(|_| Arc::new(CancelToken::new())).collect();
        let handles: Vec<_> = tokens
            .iter()
            .map(|token| {
                let e = engine.clone();
                let o = ops.clone();
                let t = token.clone();
                thread::spawn(move || {
                    let outcome = e.acquire_interruptibly(&*o, 1, &t);
                    if outcome.is_ok() {
                        e.release(&*o, 1).unwrap();
                    }
                    outcome
                })
            })
            .collect();

        // Wait for all four to enqueue, then cancel half.
        while engine.queued_waiters() < 4 {
            thread::yield_now();
        }
        tokens[0].cancel();
        tokens[2].cancel();
        let start = Instant::now();
        while engine.queued_waiters() > 2 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::yield_now();
        }

        engine.release(&*ops, 1).unwrap();
        let mut outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        outcomes.sort_by_key(|r| r.is_err());
        assert_eq!(outcomes[0], Ok(()));
        assert_eq!(outcomes[1], Ok(()));
        assert_eq!(outcomes[2], Err(SyncError::Cancelled));
        assert_eq!(outcomes[3], Err(SyncError::Cancelled));

        // The two survivors hold/release in turn; state must settle at free.
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.state() != 0 {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }
    }

    #[test]
    fn test_uninterruptible_acquire_absorbs_and_reasserts_cancel() {
        let engine = Arc::new(SyncEngine::new());
        let ops = Arc::new(TestLock { fair: false });
        engine.acquire(&*ops, 1).unwrap();

        let token = Arc::new(CancelToken::new());
        let e = engine.clone();
        let o = ops.clone();
        let t = token.clone();
        let handle = thread::spawn(move || {
            e.acquire_uninterruptibly(&*o, 1, &t).unwrap();
            // The absorbed cancellation must be re-asserted on the token.
            let reasserted = t.is_cancelled();
            e.release(&*o, 1).unwrap();
            reasserted
        });

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        // The cancel alone must not admit the waiter; only release does.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.state(), 1);

        engine.release(&*ops, 1).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_unsupported_hooks_error() {
        struct NoOps;
        impl SyncOps for NoOps {}

        let engine = SyncEngine::new();
        assert_eq!(engine.acquire(&NoOps, 1), Err(SyncError::Unsupported));
        assert_eq!(engine.release(&NoOps, 1), Err(SyncError::Unsupported));
        assert_eq!(engine.acquire_shared(&NoOps, 1), Err(SyncError::Unsupported));
        assert_eq!(
            engine.release_shared(&NoOps, 1),
            Err(SyncError::Unsupported)
        );
        assert_eq!(
            NoOps.is_held_exclusively(&engine),
            Err(SyncError::Unsupported)
        );
    }
}
