/*!
 * Wait Node
 *
 * Intrusive queue node with a bit-packed status word and address-keyed
 * parking. Links are `ArcSwapOption` so that CAS relinking never races with
 * reclamation: a node stays alive as long as any walker still holds it, which
 * also makes a stale unpark of its address harmless (the address cannot be
 * reused while the signaller's reference is live).
 *
 * Reference discipline: `prev`/`next` form a cycle while a node is enqueued,
 * so every removal path (acquire, cancellation splice, queue drop) clears the
 * links it owns before letting the node go.
 */

use crate::core::ctx::CancelToken;
use arc_swap::ArcSwapOption;
use parking_lot_core::{park, ParkResult, ParkToken, UnparkToken};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Status bit: a signal is required before this node's owner can proceed.
pub(crate) const WAITING: i32 = 1;

/// Status bit: the node is still linked on a condition list, not yet
/// transferred to the main queue.
pub(crate) const COND: i32 = 2;

/// Status sentinel: the wait was cancelled. Most-negative so that a plain
/// `status < 0` test distinguishes cancelled nodes during queue walks.
pub(crate) const CANCELLED: i32 = i32::MIN;

/// Waiting mode of a queued node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Exclusive,
    Shared,
    Condition,
}

/// One waiting execution context
pub(crate) struct WaitNode {
    pub prev: ArcSwapOption<WaitNode>,
    pub next: ArcSwapOption<WaitNode>,
    pub status: AtomicI32,
    /// Context id of the suspended owner (0 = empty)
    pub waiter: AtomicU64,
    pub kind: NodeKind,
    /// Condition-list link; owned by the condition while `COND` is set
    pub next_waiter: ArcSwapOption<WaitNode>,
}

impl WaitNode {
    pub fn new(kind: NodeKind) -> Arc<Self> {
        Arc::new(Self {
            prev: ArcSwapOption::new(None),
            next: ArcSwapOption::new(None),
            status: AtomicI32::new(0),
            waiter: AtomicU64::new(0),
            kind,
            next_waiter: ArcSwapOption::new(None),
        })
    }

    #[inline]
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.status() < 0
    }

    /// Status and the synchronizer's state word form a classic
    /// store-then-read-the-other pair between signaller and waiter, so both
    /// words use sequentially consistent accesses; anything weaker permits
    /// the lost-wakeup interleaving.
    #[inline]
    pub fn set_status(&self, bits: i32) {
        self.status.store(bits, Ordering::SeqCst);
    }

    #[inline]
    pub fn clear_status(&self) {
        self.status.store(0, Ordering::SeqCst);
    }

    /// Atomically clear `bits`, returning the prior status word.
    #[inline]
    pub fn get_and_unset_status(&self, bits: i32) -> i32 {
        self.status.fetch_and(!bits, Ordering::SeqCst)
    }

    /// Stable parking key for this node
    #[inline]
    fn park_addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Suspend the calling context until unparked, as long as one of `mask`'s
    /// status bits is still set and no cancellation is pending.
    ///
    /// Returns `false` only when a deadline elapsed before any wake.
    pub fn park(
        &self,
        mask: i32,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> bool {
        let addr = self.park_addr();
        if let Some(token) = cancel {
            token.register(addr);
        }
        let result = unsafe {
            park(
                addr,
                || {
                    // Do not go to sleep if the signal already landed or a
                    // cancellation is pending; the caller's loop re-checks.
                    self.status.load(Ordering::SeqCst) & mask != 0
                        && cancel.map_or(true, |t| !t.is_cancelled())
                },
                || {},
                |_, _| {},
                ParkToken(0),
                deadline,
            )
        };
        if let Some(token) = cancel {
            token.register(0);
        }
        !matches!(result, ParkResult::TimedOut)
    }

    /// Wake this node's owner if it is suspended.
    pub fn unpark(&self) {
        unsafe {
            parking_lot_core::unpark_one(self.park_addr(), |_| UnparkToken(0));
        }
    }
}

impl std::fmt::Debug for WaitNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitNode")
            .field("status", &self.status.load(Ordering::Relaxed))
            .field("waiter", &self.waiter.load(Ordering::Relaxed))
            .field("kind", &self.kind)
            .finish()
    }
}

/// Pointer identity over optional node references
#[inline]
pub(crate) fn same_node(a: Option<&Arc<WaitNode>>, b: Option<&Arc<WaitNode>>) -> bool {
    opt_ptr(a) == opt_ptr(b)
}

#[inline]
pub(crate) fn opt_ptr(node: Option<&Arc<WaitNode>>) -> *const WaitNode {
    node.map_or(std::ptr::null(), Arc::as_ptr)
}

/// CAS one link from `expect` to `new`, by pointer identity.
pub(crate) fn link_cas(
    link: &ArcSwapOption<WaitNode>,
    expect: Option<&Arc<WaitNode>>,
    new: Option<Arc<WaitNode>>,
) -> bool {
    let prev = link.compare_and_swap(opt_ptr(expect), new);
    opt_ptr((*prev).as_ref()) == opt_ptr(expect)
}
