/*!
 * Latch
 *
 * One-shot count-down latch: waiters acquire in shared mode and are all
 * released by the count reaching zero.
 */

use crate::core::errors::SyncResult;
use crate::sync::engine::{SyncEngine, SyncOps};
use std::time::Duration;

struct LatchOps;

impl SyncOps for LatchOps {
    fn try_acquire_shared(&self, engine: &SyncEngine, _arg: i64) -> SyncResult<i64> {
        Ok(if engine.state() == 0 { 1 } else { -1 })
    }

    fn try_release_shared(&self, engine: &SyncEngine, _arg: i64) -> SyncResult<bool> {
        loop {
            let count = engine.state();
            if count == 0 {
                return Ok(false);
            }
            if engine.cas_state(count, count - 1) {
                return Ok(count == 1);
            }
        }
    }
}

pub struct Latch {
    engine: SyncEngine,
    ops: LatchOps,
}

impl Latch {
    pub fn new(count: u32) -> Self {
        let engine = SyncEngine::new();
        engine.set_state(i64::from(count));
        Self {
            engine,
            ops: LatchOps,
        }
    }

    /// Decrement the count, releasing all waiters when it reaches zero.
    /// Counting down past zero is a no-op.
    pub fn count_down(&self) {
        self.engine
            .release_shared(&self.ops, 1)
            .expect("shared hooks are implemented");
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        self.engine
            .acquire_shared(&self.ops, 1)
            .expect("shared hooks are implemented");
    }

    /// `false` when the timeout elapses before the count reaches zero.
    pub fn wait_timed(&self, timeout: Duration) -> bool {
        self.engine
            .acquire_shared_timed(&self.ops, 1, timeout, None)
            .expect("shared hooks are implemented")
    }

    pub fn count(&self) -> u64 {
        self.engine.state().max(0) as u64
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_latch_releases_all_waiters() {
        let latch = Arc::new(Latch::new(2));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let l = latch.clone();
                thread::spawn(move || l.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(latch.count(), 0);

        // Already-open latch does not block.
        latch.wait();
    }

    #[test]
    fn test_wait_timed() {
        let latch = Latch::new(1);
        assert!(!latch.wait_timed(Duration::from_millis(50)));
        latch.count_down();
        assert!(latch.wait_timed(Duration::from_millis(50)));
    }

    #[test]
    fn test_count_down_past_zero() {
        let latch = Latch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }
}
