/*!
 * Worker Pool Configuration
 */

use crate::core::errors::PoolError;
use crate::core::limits::{DEFAULT_KEEP_ALIVE, MAX_WORKER_COUNT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sizing and timeout policy for a [`WorkerPool`](super::WorkerPool)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Workers kept alive even when idle (unless core timeout is allowed)
    pub core_workers: usize,
    /// Hard ceiling on live workers
    pub max_workers: usize,
    /// Idle time after which workers above the core size exit
    pub keep_alive: Duration,
    /// Let core workers time out and exit when idle
    pub allow_core_timeout: bool,
    /// Worker name prefix
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            core_workers: parallelism,
            max_workers: parallelism,
            keep_alive: DEFAULT_KEEP_ALIVE,
            allow_core_timeout: false,
            name: "synq-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Fixed-size pool: core == max, no idle timeout
    pub fn fixed(workers: usize) -> Self {
        Self {
            core_workers: workers,
            max_workers: workers,
            ..Self::default()
        }
    }

    /// Elastic pool: spawns up to `max` under load, shrinks back to `core`
    pub fn elastic(core: usize, max: usize, keep_alive: Duration) -> Self {
        Self {
            core_workers: core,
            max_workers: max,
            keep_alive,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.core_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "core_workers ({}) exceeds max_workers ({})",
                self.core_workers, self.max_workers
            )));
        }
        if self.max_workers as u64 > MAX_WORKER_COUNT {
            return Err(PoolError::InvalidConfig(format!(
                "max_workers ({}) exceeds the representable worker count",
                self.max_workers
            )));
        }
        Ok(())
    }
}
