/*!
 * Mutex
 *
 * Non-reentrant binary lock over the synchronization engine: state 0 = free,
 * 1 = held, owner context tracked for condition-wait legality checks.
 * The default constructor barges; `fair()` consults the queue before the CAS
 * so waiters acquire in strict FIFO order.
 */

use crate::core::ctx::{current_context, CancelToken};
use crate::core::errors::SyncResult;
use crate::sync::engine::{SyncEngine, SyncOps};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine state machine shared by [`Mutex`] and its condition variables
pub(crate) struct LockCore {
    pub(crate) engine: SyncEngine,
    fair: bool,
    owner: AtomicU64,
}

impl LockCore {
    pub(crate) fn new(fair: bool) -> Self {
        Self {
            engine: SyncEngine::new(),
            fair,
            owner: AtomicU64::new(0),
        }
    }
}

impl SyncOps for LockCore {
    fn try_acquire(&self, engine: &SyncEngine, _arg: i64) -> SyncResult<bool> {
        if self.fair && engine.has_queued_predecessor() {
            return Ok(false);
        }
        if engine.cas_state(0, 1) {
            self.owner.store(current_context(), Ordering::Release);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn try_release(&self, engine: &SyncEngine, _arg: i64) -> SyncResult<bool> {
        self.owner.store(0, Ordering::Release);
        engine.set_state(0);
        Ok(true)
    }

    fn is_held_exclusively(&self, engine: &SyncEngine) -> SyncResult<bool> {
        Ok(engine.state() == 1 && self.owner.load(Ordering::Acquire) == current_context())
    }
}

/// Mutual exclusion lock built on the synchronization engine
///
/// Non-reentrant: re-locking from the holding context deadlocks.
pub struct Mutex<T> {
    pub(crate) core: Arc<LockCore>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Barging (throughput-favoring) lock
    pub fn new(value: T) -> Self {
        Self {
            core: Arc::new(LockCore::new(false)),
            data: UnsafeCell::new(value),
        }
    }

    /// Strict-FIFO lock: `try_acquire` defers to queued predecessors
    pub fn fair(value: T) -> Self {
        Self {
            core: Arc::new(LockCore::new(true)),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.core
            .engine
            .acquire(&*self.core, 1)
            .expect("exclusive hooks are implemented");
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.core.try_acquire(&self.core.engine, 1) {
            Ok(true) => Some(MutexGuard {
                lock: self,
                _not_send: PhantomData,
            }),
            _ => None,
        }
    }

    /// `None` when the timeout elapses before the lock is acquired.
    pub fn lock_timed(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        let acquired = self
            .core
            .engine
            .acquire_timed(&*self.core, 1, timeout, None)
            .expect("exclusive hooks are implemented");
        acquired.then(|| MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// `Err(Cancelled)` when the token fires before the lock is acquired.
    pub fn lock_interruptibly(&self, cancel: &CancelToken) -> SyncResult<MutexGuard<'_, T>> {
        self.core.engine.acquire_interruptibly(&*self.core, 1, cancel)?;
        Ok(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Whether the calling context holds this lock
    pub fn is_held(&self) -> bool {
        self.core
            .is_held_exclusively(&self.core.engine)
            .unwrap_or(false)
    }

    pub fn is_locked(&self) -> bool {
        self.core.engine.state() != 0
    }

    /// Approximate number of contexts queued for this lock
    pub fn queued_waiters(&self) -> usize {
        self.core.engine.queued_waiters()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard; releasing wakes the next queued waiter
pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
    /// Guards are pinned to the acquiring context.
    _not_send: PhantomData<*const ()>,
}

impl<T> MutexGuard<'_, T> {
    pub(crate) fn core(&self) -> &Arc<LockCore> {
        &self.lock.core
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.lock.core.engine.release(&*self.lock.core, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_lock_unlock() {
        let mutex = Mutex::new(0u32);
        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert!(mutex.is_held());
            assert!(mutex.is_locked());
        }
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn test_try_lock_contended() {
        let mutex = Arc::new(Mutex::new(()));
        let guard = mutex.lock();

        let m = mutex.clone();
        let handle = thread::spawn(move || m.try_lock().is_some());
        assert!(!handle.join().unwrap());
        drop(guard);

        let m = mutex.clone();
        let handle = thread::spawn(move || m.try_lock().is_some());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_lock_timed_times_out() {
        let mutex = Arc::new(Mutex::new(()));
        let guard = mutex.lock();

        let m = mutex.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let acquired = m.lock_timed(Duration::from_millis(50)).is_some();
            (acquired, start.elapsed())
        });
        let (acquired, elapsed) = handle.join().unwrap();
        assert!(!acquired);
        assert!(elapsed >= Duration::from_millis(50));
        drop(guard);
    }

    #[test]
    fn test_counter_stress() {
        let mutex = Arc::new(Mutex::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 8 * 500);
    }

    #[test]
    fn test_lock_interruptibly_cancelled() {
        let mutex = Arc::new(Mutex::new(()));
        let token = Arc::new(CancelToken::new());
        let guard = mutex.lock();

        let m = mutex.clone();
        let t = token.clone();
        let handle = thread::spawn(move || m.lock_interruptibly(&t).map(|_| ()));

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert!(handle.join().unwrap().is_err());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }
}
