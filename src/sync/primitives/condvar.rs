/*!
 * Condition Variable
 *
 * Bound to one mutex at construction (rather than paired dynamically): the
 * wait list transfers its nodes into that mutex's wait queue on notify, so
 * a woken waiter resumes holding exactly what it held before waiting.
 * Notification requires the lock to be held; calling without it is an
 * illegal-state error, not a silent no-op.
 */

use super::mutex::{LockCore, MutexGuard};
use crate::core::ctx::CancelToken;
use crate::core::errors::SyncResult;
use crate::sync::condition::ConditionQueue;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Condvar {
    core: Arc<LockCore>,
    waiters: ConditionQueue,
}

impl Condvar {
    /// Create a condition bound to `mutex`.
    pub fn new<T>(mutex: &super::mutex::Mutex<T>) -> Self {
        Self {
            core: mutex.core.clone(),
            waiters: ConditionQueue::new(),
        }
    }

    fn check_guard<T>(&self, guard: &MutexGuard<'_, T>) {
        assert!(
            Arc::ptr_eq(&self.core, guard.core()),
            "condvar used with a mutex it is not bound to"
        );
    }

    /// Wait until notified. Uninterruptible.
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.check_guard(guard);
        self.waiters
            .await_uninterruptibly(&self.core.engine, &*self.core, None)
            .expect("guard proves exclusive hold");
    }

    /// Wait until notified or `timeout` elapses. Returns `false` on timeout.
    pub fn wait_for<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        self.check_guard(guard);
        self.waiters
            .await_timed(&self.core.engine, &*self.core, timeout, None)
            .expect("guard proves exclusive hold")
    }

    /// Wait until notified or the absolute deadline passes.
    pub fn wait_until<T>(&self, guard: &mut MutexGuard<'_, T>, deadline: Instant) -> bool {
        self.check_guard(guard);
        self.waiters
            .await_until(&self.core.engine, &*self.core, deadline, None)
            .expect("guard proves exclusive hold")
    }

    /// Wait until notified or cancelled.
    pub fn wait_interruptibly<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        cancel: &CancelToken,
    ) -> SyncResult<()> {
        self.check_guard(guard);
        self.waiters
            .await_interruptibly(&self.core.engine, &*self.core, cancel)
    }

    /// Wait until notified, cancelled, or timed out (`Ok(false)`).
    pub fn wait_interruptibly_for<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> SyncResult<bool> {
        self.check_guard(guard);
        self.waiters
            .await_timed(&self.core.engine, &*self.core, timeout, Some(cancel))
    }

    /// Transfer one waiter to the lock queue. Requires the lock held.
    pub fn notify_one(&self) -> SyncResult<()> {
        self.waiters.signal(&self.core.engine, &*self.core)
    }

    /// Transfer every waiter to the lock queue. Requires the lock held.
    pub fn notify_all(&self) -> SyncResult<()> {
        self.waiters.signal_all(&self.core.engine, &*self.core)
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.has_waiters()
    }
}

impl std::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condvar").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::mutex::Mutex;
    use super::*;
    use crate::core::errors::SyncError;
    use std::thread;

    #[test]
    fn test_notify_without_lock_is_illegal() {
        let mutex = Mutex::new(());
        let cond = Condvar::new(&mutex);
        assert_eq!(cond.notify_one(), Err(SyncError::IllegalState));
        assert_eq!(cond.notify_all(), Err(SyncError::IllegalState));
    }

    #[test]
    fn test_wait_notify_transfers_value() {
        let mutex = Arc::new(Mutex::new(0u32));
        let cond = Arc::new(Condvar::new(&mutex));

        let m = mutex.clone();
        let c = cond.clone();
        let handle = thread::spawn(move || {
            let mut guard = m.lock();
            while *guard == 0 {
                c.wait(&mut guard);
            }
            *guard
        });

        thread::sleep(Duration::from_millis(50));
        {
            let mut guard = mutex.lock();
            *guard = 42;
            cond.notify_one().unwrap();
        }
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn test_wait_for_times_out() {
        let mutex = Mutex::new(());
        let cond = Condvar::new(&mutex);
        let mut guard = mutex.lock();
        let signalled = cond.wait_for(&mut guard, Duration::from_millis(50));
        assert!(!signalled);
        // Lock re-held after the timed-out wait.
        assert!(mutex.is_held());
    }

    #[test]
    fn test_notify_all_wakes_everyone() {
        let mutex = Arc::new(Mutex::new(false));
        let cond = Arc::new(Condvar::new(&mutex));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = mutex.clone();
                let c = cond.clone();
                thread::spawn(move || {
                    let mut guard = m.lock();
                    while !*guard {
                        c.wait(&mut guard);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        {
            let mut guard = mutex.lock();
            *guard = true;
            cond.notify_all().unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_wait_interruptibly_cancelled() {
        let mutex = Arc::new(Mutex::new(()));
        let cond = Arc::new(Condvar::new(&mutex));
        let token = Arc::new(CancelToken::new());

        let m = mutex.clone();
        let c = cond.clone();
        let t = token.clone();
        let handle = thread::spawn(move || {
            let mut guard = m.lock();
            let outcome = c.wait_interruptibly(&mut guard, &t);
            // The lock is re-held even on the cancelled path.
            (outcome, m.is_held())
        });

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let (outcome, held) = handle.join().unwrap();
        assert_eq!(outcome, Err(SyncError::Cancelled));
        assert!(held);
    }
}
