/*!
 * Condition Wait List
 *
 * A per-synchronizer wait list whose nodes are transferred onto the main
 * wait queue by `signal`. The list itself is only ever mutated while the
 * associated synchronizer is held exclusively, so its links need plain
 * stores, not CAS.
 */

use super::engine::{SyncEngine, SyncOps};
use super::node::{NodeKind, WaitNode, CANCELLED, COND};
use crate::core::ctx::{current_context, CancelToken};
use crate::core::errors::{SyncError, SyncResult};
use arc_swap::ArcSwapOption;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// FIFO list of condition waiters for one synchronizer
pub struct ConditionQueue {
    first: ArcSwapOption<WaitNode>,
    last: ArcSwapOption<WaitNode>,
}

impl Default for ConditionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionQueue {
    pub fn new() -> Self {
        Self {
            first: ArcSwapOption::new(None),
            last: ArcSwapOption::new(None),
        }
    }

    /// Block until signalled; absorbs cancellation and re-asserts it on the
    /// token (when one is supplied) after the wait completes.
    pub fn await_uninterruptibly<O: SyncOps + ?Sized>(
        &self,
        engine: &SyncEngine,
        ops: &O,
        cancel: Option<&CancelToken>,
    ) -> SyncResult<()> {
        self.do_await(engine, ops, false, None, cancel).map(|_| ())
    }

    /// Block until signalled or cancelled.
    pub fn await_interruptibly<O: SyncOps + ?Sized>(
        &self,
        engine: &SyncEngine,
        ops: &O,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        self.do_await(engine, ops, true, None, Some(cancel))
            .map(|_| ())
    }

    /// Block until signalled or the duration elapses. `Ok(false)` = timed out.
    pub fn await_timed<O: SyncOps + ?Sized>(
        &self,
        engine: &SyncEngine,
        ops: &O,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> SyncResult<bool> {
        self.do_await(
            engine,
            ops,
            cancel.is_some(),
            Some(Instant::now() + timeout),
            cancel,
        )
    }

    /// Block until signalled or the absolute deadline passes.
    pub fn await_until<O: SyncOps + ?Sized>(
        &self,
        engine: &SyncEngine,
        ops: &O,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> SyncResult<bool> {
        self.do_await(engine, ops, cancel.is_some(), Some(deadline), cancel)
    }

    /// Transfer the first still-pending waiter onto the main queue.
    pub fn signal<O: SyncOps + ?Sized>(&self, engine: &SyncEngine, ops: &O) -> SyncResult<()> {
        self.do_signal(engine, ops, false)
    }

    /// Transfer every still-pending waiter onto the main queue.
    pub fn signal_all<O: SyncOps + ?Sized>(&self, engine: &SyncEngine, ops: &O) -> SyncResult<()> {
        self.do_signal(engine, ops, true)
    }

    /// Whether any context is linked on this condition (approximate; only
    /// meaningful while the synchronizer is held).
    pub fn has_waiters(&self) -> bool {
        let mut w = self.first.load_full();
        while let Some(node) = w {
            if node.status() & COND != 0 {
                return true;
            }
            w = node.next_waiter.load_full();
        }
        false
    }

    // ------------------------------------------------------------------

    fn do_await<O: SyncOps + ?Sized>(
        &self,
        engine: &SyncEngine,
        ops: &O,
        interruptible: bool,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> SyncResult<bool> {
        if interruptible {
            if let Some(token) = cancel {
                if token.take() {
                    return Err(SyncError::Cancelled);
                }
            }
        }

        let node = WaitNode::new(NodeKind::Condition);
        let saved_state = self.enable_wait(engine, ops, &node)?;

        let mut interrupted = false;
        let mut wait_cancelled = false;
        while !engine.node_is_enqueued(&node) {
            if let Some(token) = cancel {
                if token.take() {
                    interrupted = true;
                }
            }
            let timed_out = deadline.map_or(false, |d| Instant::now() >= d);
            if (interrupted && interruptible) || timed_out {
                // Claim the node back from the condition; losing the claim
                // means a signal already owns it and the transfer will land.
                if node.get_and_unset_status(COND) & COND != 0 {
                    wait_cancelled = true;
                    break;
                }
                std::hint::spin_loop();
            } else if node.status() & COND != 0 {
                node.park(COND, deadline, cancel);
            } else {
                std::hint::spin_loop();
            }
        }

        node.clear_status();
        engine.reacquire(ops, node.clone(), saved_state)?;

        if wait_cancelled {
            self.unlink_cancelled(Some(&node));
            if interrupted && interruptible {
                return Err(SyncError::Cancelled);
            }
            if interrupted {
                if let Some(token) = cancel {
                    token.cancel();
                }
            }
            return Ok(false);
        }
        if interrupted {
            // Signal won the race; swallow and re-assert for the caller.
            if let Some(token) = cancel {
                token.cancel();
            }
        }
        Ok(true)
    }

    /// Link a fresh node, record the current state, and fully release the
    /// synchronizer. Fails with `IllegalState` when the caller does not hold
    /// it exclusively.
    fn enable_wait<O: SyncOps + ?Sized>(
        &self,
        engine: &SyncEngine,
        ops: &O,
        node: &Arc<WaitNode>,
    ) -> SyncResult<i64> {
        if !ops.is_held_exclusively(engine)? {
            node.set_status(CANCELLED);
            return Err(SyncError::IllegalState);
        }
        node.waiter.store(current_context(), Ordering::Release);
        node.set_status(COND | super::node::WAITING);

        match self.last.load_full() {
            Some(last) => last.next_waiter.store(Some(node.clone())),
            None => self.first.store(Some(node.clone())),
        }
        self.last.store(Some(node.clone()));

        let saved_state = engine.state();
        match engine.release(ops, saved_state) {
            Ok(true) => Ok(saved_state),
            Ok(false) => {
                node.set_status(CANCELLED);
                Err(SyncError::IllegalState)
            }
            Err(e) => {
                node.set_status(CANCELLED);
                Err(e)
            }
        }
    }

    fn do_signal<O: SyncOps + ?Sized>(
        &self,
        engine: &SyncEngine,
        ops: &O,
        all: bool,
    ) -> SyncResult<()> {
        if !ops.is_held_exclusively(engine)? {
            return Err(SyncError::IllegalState);
        }
        let mut first = self.first.load_full();
        while let Some(node) = first {
            let next = node.next_waiter.load_full();
            self.first.store(next.clone());
            if next.is_none() {
                self.last.store(None);
            }
            node.next_waiter.store(None);
            if node.get_and_unset_status(COND) & COND != 0 {
                engine.enqueue_transferred(node);
                if !all {
                    break;
                }
            }
            // Skipped: the waiter already cancelled its wait.
            first = next;
        }
        Ok(())
    }

    /// Purge dead entries, stopping early at `upto` when supplied (the node
    /// whose cancellation triggered the sweep).
    fn unlink_cancelled(&self, upto: Option<&Arc<WaitNode>>) {
        let mut w = self.first.load_full();
        let mut trail: Option<Arc<WaitNode>> = None;
        while let Some(node) = w {
            let next = node.next_waiter.load_full();
            if node.status() & COND == 0 {
                node.next_waiter.store(None);
                match &trail {
                    None => self.first.store(next.clone()),
                    Some(t) => t.next_waiter.store(next.clone()),
                }
                if next.is_none() {
                    self.last.store(trail.clone());
                }
            } else {
                trail = Some(node.clone());
            }
            let stop = upto.map_or(false, |u| Arc::ptr_eq(u, &node));
            w = if stop { None } else { next };
        }
    }
}

impl std::fmt::Debug for ConditionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionQueue").finish()
    }
}
