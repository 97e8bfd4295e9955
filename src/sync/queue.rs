/*!
 * Wait Queue
 *
 * CLH-style intrusive FIFO of waiting contexts. Enqueue is a CAS on `tail`
 * followed by a plain store of the old tail's `next`; the `next` chain is
 * therefore only eventually consistent and the `prev` chain is authoritative
 * for membership. Cancelled nodes are unlinked lazily by `clean_queue`, a
 * tail-to-head walk that restarts whenever it observes a structural race.
 */

use super::node::{link_cas, same_node, NodeKind, WaitNode, WAITING};
use crate::core::ctx::current_context;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct WaitQueue {
    /// Dummy once initialized; the current holder's node thereafter
    pub head: ArcSwapOption<WaitNode>,
    pub tail: ArcSwapOption<WaitNode>,
    /// Approximate number of enqueued waiters; owners adjust it on enqueue
    /// and on their own dequeue/cancellation, so it converges after cleanup.
    len: AtomicUsize,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            head: ArcSwapOption::new(None),
            tail: ArcSwapOption::new(None),
            len: AtomicUsize::new(0),
        }
    }

    /// Install the dummy head on first contention. Returns the current tail.
    pub fn try_initialize(&self) -> Arc<WaitNode> {
        loop {
            if let Some(t) = self.tail.load_full() {
                return t;
            }
            if self.head.load().is_none() {
                let dummy = WaitNode::new(NodeKind::Exclusive);
                if link_cas(&self.head, None, Some(dummy.clone())) {
                    self.tail.store(Some(dummy.clone()));
                    return dummy;
                }
            } else {
                // Another context is mid-initialization; its tail store is
                // imminent.
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn cas_tail(&self, expect: &Arc<WaitNode>, new: Arc<WaitNode>) -> bool {
        link_cas(&self.tail, Some(expect), Some(new))
    }

    /// One enqueue attempt onto a known old tail. The caller retries from its
    /// outer loop on failure (the loop re-reads queue structure anyway).
    pub fn try_enqueue(&self, node: &Arc<WaitNode>, tail: &Arc<WaitNode>) -> bool {
        node.prev.store(Some(tail.clone()));
        if self.cas_tail(tail, node.clone()) {
            tail.next.store(Some(node.clone()));
            self.len.fetch_add(1, Ordering::Relaxed);
            if tail.is_cancelled() {
                // Wake the new waiter so it cleans the stale link promptly.
                node.unpark();
            }
            true
        } else {
            node.prev.store(None);
            false
        }
    }

    /// Enqueue until success; used for condition-to-queue transfer where the
    /// node must land on the main queue before the signaller proceeds.
    ///
    /// Unlike `try_enqueue`, a failed CAS does not retract `prev`: the
    /// waiting owner may already be reading it, and it treats membership as
    /// established only once the node is reachable from `tail`.
    pub fn enqueue(&self, node: Arc<WaitNode>) {
        loop {
            let tail = self.try_initialize();
            node.prev.store(Some(tail.clone()));
            if self.cas_tail(&tail, node.clone()) {
                tail.next.store(Some(node.clone()));
                self.len.fetch_add(1, Ordering::Relaxed);
                if tail.is_cancelled() {
                    // Wake the waiter so it cleans the stale link promptly.
                    node.unpark();
                }
                return;
            }
        }
    }

    /// Authoritative membership test: reachable from `tail` via `prev`.
    pub fn is_enqueued(&self, node: &Arc<WaitNode>) -> bool {
        let mut cursor = self.tail.load_full();
        while let Some(q) = cursor {
            if Arc::ptr_eq(&q, node) {
                return true;
            }
            cursor = q.prev.load_full();
        }
        false
    }

    /// Promote `node` to head after its owner won the acquire race.
    pub fn set_head(&self, node: &Arc<WaitNode>, pred: &Arc<WaitNode>) {
        node.prev.store(None);
        self.head.store(Some(node.clone()));
        pred.next.store(None);
        node.waiter.store(0, Ordering::Release);
        self.note_dequeued();
    }

    #[inline]
    pub fn note_dequeued(&self) {
        self.len.fetch_sub(1, Ordering::Relaxed);
    }

    /// Approximate number of queued waiters
    #[inline]
    pub fn len_estimate(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Wake the successor of `node` (typically head), clearing its WAITING
    /// bit. May wake a context that cannot yet proceed; that is benign.
    pub fn signal_next(&self, node: Option<&Arc<WaitNode>>) {
        if let Some(h) = node {
            if let Some(s) = h.next.load_full() {
                if s.status() != 0 {
                    s.get_and_unset_status(WAITING);
                    s.unpark();
                }
            }
        }
    }

    /// Shared-mode cascade: wake the successor only if it also waits in
    /// shared mode.
    pub fn signal_next_shared(&self, node: &Arc<WaitNode>) {
        if let Some(s) = node.next.load_full() {
            if s.kind == NodeKind::Shared && s.status() != 0 {
                s.get_and_unset_status(WAITING);
                s.unpark();
            }
        }
    }

    pub fn signal_first(&self) {
        self.signal_next(self.head.load_full().as_ref());
    }

    /// Lazily unlink cancelled nodes, walking (pred, node, succ) triples from
    /// the tail and restarting on any observed inconsistency. Convergence is
    /// guaranteed because a competing mutator has itself made queue progress.
    pub fn clean_queue(&self) {
        'restart: loop {
            let mut q = self.tail.load_full();
            let mut s: Option<Arc<WaitNode>> = None;
            loop {
                let Some(qn) = q.clone() else { return };
                let Some(p) = qn.prev.load_full() else {
                    return; // reached head
                };
                let consistent = match &s {
                    None => same_node(self.tail.load_full().as_ref(), Some(&qn)),
                    Some(sn) => {
                        same_node(sn.prev.load_full().as_ref(), Some(&qn)) && !sn.is_cancelled()
                    }
                };
                if !consistent {
                    continue 'restart;
                }
                if qn.is_cancelled() {
                    let spliced = match &s {
                        None => self.cas_tail(&qn, p.clone()),
                        Some(sn) => link_cas(&sn.prev, Some(&qn), Some(p.clone())),
                    };
                    if spliced && same_node(qn.prev.load_full().as_ref(), Some(&p)) {
                        link_cas(&p.next, Some(&qn), s.clone());
                        if p.prev.load().is_none() {
                            self.signal_next(Some(&p));
                        }
                    }
                    continue 'restart;
                }
                let n = p.next.load_full();
                if !same_node(n.as_ref(), Some(&qn)) {
                    // Help finish a lagging enqueue link.
                    if n.is_some() && same_node(qn.prev.load_full().as_ref(), Some(&p)) {
                        link_cas(&p.next, n.as_ref(), Some(qn.clone()));
                        if p.prev.load().is_none() {
                            self.signal_next(Some(&p));
                        }
                        return;
                    }
                }
                s = Some(qn);
                q = Some(p);
            }
        }
    }

    /// Whether some other context is queued ahead of the caller.
    ///
    /// Fast path inspects head's successor; falls back to the authoritative
    /// prev-walk when the next chain is lagging.
    pub fn has_queued_predecessor(&self) -> bool {
        let Some(h) = self.head.load_full() else {
            return false;
        };
        let mut first = 0u64;
        let retry = match h.next.load_full() {
            None => true,
            Some(s) => {
                first = s.waiter.load(Ordering::Acquire);
                first == 0 || s.prev.load().is_none()
            }
        };
        if retry {
            first = self.first_waiter();
        }
        first != 0 && first != current_context()
    }

    /// Context id of the first queued waiter (0 if none), via the prev chain.
    fn first_waiter(&self) -> u64 {
        let mut first = 0u64;
        let mut p = self.tail.load_full();
        while let Some(q) = p {
            let prev = q.prev.load_full();
            if prev.is_some() {
                let w = q.waiter.load(Ordering::Acquire);
                if w != 0 {
                    first = w;
                }
            }
            p = prev;
        }
        first
    }

    pub fn has_waiters(&self) -> bool {
        self.len_estimate() > 0
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // Break the prev/next cycles so every node is reclaimed.
        let mut cur = self.head.swap(None);
        self.tail.store(None);
        while let Some(n) = cur {
            n.prev.store(None);
            cur = n.next.swap(None);
        }
    }
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("len", &self.len_estimate())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::CANCELLED;
    use super::*;

    fn enqueue_new(queue: &WaitQueue, waiter: u64) -> Arc<WaitNode> {
        let node = WaitNode::new(NodeKind::Exclusive);
        node.waiter.store(waiter, Ordering::Release);
        queue.enqueue(node.clone());
        node
    }

    #[test]
    fn test_initialize_once() {
        let queue = WaitQueue::new();
        let t1 = queue.try_initialize();
        let t2 = queue.try_initialize();
        assert!(Arc::ptr_eq(&t1, &t2));
        assert!(same_node(
            queue.head.load_full().as_ref(),
            queue.tail.load_full().as_ref()
        ));
    }

    #[test]
    fn test_enqueue_links_and_estimate() {
        let queue = WaitQueue::new();
        let a = enqueue_new(&queue, 11);
        let b = enqueue_new(&queue, 12);

        assert_eq!(queue.len_estimate(), 2);
        assert!(same_node(queue.tail.load_full().as_ref(), Some(&b)));
        assert!(same_node(b.prev.load_full().as_ref(), Some(&a)));
        assert!(same_node(a.next.load_full().as_ref(), Some(&b)));

        let head = queue.head.load_full().unwrap();
        assert!(same_node(head.next.load_full().as_ref(), Some(&a)));
    }

    #[test]
    fn test_clean_queue_unlinks_cancelled_middle() {
        let queue = WaitQueue::new();
        let a = enqueue_new(&queue, 21);
        let b = enqueue_new(&queue, 22);
        let c = enqueue_new(&queue, 23);

        b.set_status(CANCELLED);
        queue.clean_queue();

        assert!(same_node(c.prev.load_full().as_ref(), Some(&a)));
        assert!(same_node(a.next.load_full().as_ref(), Some(&c)));
    }

    #[test]
    fn test_clean_queue_unlinks_cancelled_tail() {
        let queue = WaitQueue::new();
        let a = enqueue_new(&queue, 31);
        let b = enqueue_new(&queue, 32);

        b.set_status(CANCELLED);
        queue.clean_queue();

        assert!(same_node(queue.tail.load_full().as_ref(), Some(&a)));
        assert!(a.next.load_full().is_none());
    }

    #[test]
    fn test_has_queued_predecessor_sees_foreign_waiter() {
        let queue = WaitQueue::new();
        assert!(!queue.has_queued_predecessor());

        // A waiter from a "different" context (id that is not ours).
        enqueue_new(&queue, u64::MAX);
        assert!(queue.has_queued_predecessor());
    }

    #[test]
    fn test_has_queued_predecessor_ignores_self() {
        let queue = WaitQueue::new();
        enqueue_new(&queue, current_context());
        assert!(!queue.has_queued_predecessor());
    }
}
