/*!
 * Execution Context Identity
 *
 * Stable per-thread context ids and cooperative cancellation tokens.
 * The engine only needs (a) a CAS-capable identity for "who is queued here"
 * and (b) a cancellation signal deliverable to a specific suspended context;
 * both are provided here without any reflection over OS thread state.
 */

use parking_lot_core::{unpark_one, UnparkToken};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Global context-id counter; 0 is reserved for "no context".
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONTEXT_ID: u64 = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
}

/// Stable, nonzero id of the calling execution context
#[inline]
pub fn current_context() -> u64 {
    CONTEXT_ID.with(|id| *id)
}

/// Cooperative cancellation signal deliverable to one suspended context
///
/// A token is shared between the canceller and the (single) context that
/// honors it at its suspension points. `cancel()` is sticky until some
/// blocking operation observes it with [`CancelToken::take`]: interruptible
/// operations take-and-surface it, uninterruptible ones take-and-re-assert.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
    /// Park address of the context currently suspended under this token
    /// (0 = not suspended). Written only by the owning context.
    parked_at: AtomicUsize,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            parked_at: AtomicUsize::new(0),
        }
    }

    /// Request cancellation and wake the target if it is suspended.
    ///
    /// Waking a context that is no longer parked at the recorded address is
    /// benign: the stale unpark is absorbed as a spurious wake.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        let addr = self.parked_at.load(Ordering::Acquire);
        if addr != 0 {
            unsafe {
                unpark_one(addr, |_| UnparkToken(0));
            }
        }
    }

    /// Whether cancellation has been requested and not yet consumed
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Consume a pending cancellation, returning whether one was pending
    #[inline]
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    /// Record where the owning context is about to suspend (0 to clear)
    #[inline]
    pub(crate) fn register(&self, addr: usize) {
        self.parked_at.store(addr, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_context_ids_unique() {
        let ids: Vec<u64> = (0..8)
            .map(|_| thread::spawn(current_context))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|&id| id != 0));
    }

    #[test]
    fn test_context_id_stable_within_thread() {
        assert_eq!(current_context(), current_context());
    }

    #[test]
    fn test_cancel_is_sticky_until_taken() {
        let token = Arc::new(CancelToken::new());
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.is_cancelled());

        assert!(token.take());
        assert!(!token.is_cancelled());
        assert!(!token.take());
    }
}
