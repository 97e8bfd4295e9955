/*!
 * Semaphore
 *
 * Counting semaphore in the engine's shared mode: the state word holds the
 * remaining permits and `try_acquire_shared` reports them, so a positive
 * result cascades wakeups to further shared waiters.
 */

use crate::core::ctx::CancelToken;
use crate::core::errors::SyncResult;
use crate::sync::engine::{SyncEngine, SyncOps};
use std::time::Duration;

struct SemOps {
    fair: bool,
}

impl SyncOps for SemOps {
    fn try_acquire_shared(&self, engine: &SyncEngine, arg: i64) -> SyncResult<i64> {
        if self.fair && engine.has_queued_predecessor() {
            return Ok(-1);
        }
        loop {
            let available = engine.state();
            let remaining = available - arg;
            if remaining < 0 || engine.cas_state(available, remaining) {
                return Ok(remaining);
            }
        }
    }

    fn try_release_shared(&self, engine: &SyncEngine, arg: i64) -> SyncResult<bool> {
        loop {
            let current = engine.state();
            if engine.cas_state(current, current + arg) {
                return Ok(true);
            }
        }
    }
}

pub struct Semaphore {
    engine: SyncEngine,
    ops: SemOps,
}

impl Semaphore {
    /// Barging semaphore with `permits` initially available
    pub fn new(permits: u32) -> Self {
        Self::build(permits, false)
    }

    /// FIFO-fair semaphore
    pub fn fair(permits: u32) -> Self {
        Self::build(permits, true)
    }

    fn build(permits: u32, fair: bool) -> Self {
        let engine = SyncEngine::new();
        engine.set_state(i64::from(permits));
        Self {
            engine,
            ops: SemOps { fair },
        }
    }

    pub fn acquire(&self) {
        self.acquire_n(1);
    }

    pub fn acquire_n(&self, permits: u32) {
        self.engine
            .acquire_shared(&self.ops, i64::from(permits))
            .expect("shared hooks are implemented");
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    pub fn try_acquire_n(&self, permits: u32) -> bool {
        matches!(
            self.ops.try_acquire_shared(&self.engine, i64::from(permits)),
            Ok(r) if r >= 0
        )
    }

    /// `false` when the timeout elapses before the permits are granted.
    pub fn acquire_timed(&self, timeout: Duration) -> bool {
        self.engine
            .acquire_shared_timed(&self.ops, 1, timeout, None)
            .expect("shared hooks are implemented")
    }

    /// `Err(Cancelled)` when the token fires first.
    pub fn acquire_interruptibly(&self, cancel: &CancelToken) -> SyncResult<()> {
        self.engine.acquire_shared_interruptibly(&self.ops, 1, cancel)
    }

    pub fn release(&self) {
        self.release_n(1);
    }

    pub fn release_n(&self, permits: u32) {
        self.engine
            .release_shared(&self.ops, i64::from(permits))
            .expect("shared hooks are implemented");
    }

    /// Currently available permits
    pub fn permits(&self) -> i64 {
        self.engine.state()
    }

    pub fn queued_waiters(&self) -> usize {
        self.engine.queued_waiters()
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.permits())
            .finish()
    }
}
