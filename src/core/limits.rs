/*!
 * Limits and Constants
 *
 * Centralized location for the crate's tunable limits and thresholds.
 * All values include rationale comments explaining WHY they exist.
 */

use std::time::Duration;

// =============================================================================
// SYNCHRONIZER
// =============================================================================

/// Ceiling for the pre-emptive retry budget after an unpark.
/// The budget doubles on every park/unpark round trip ((n << 1) | 1) and
/// saturates here, so a chronically contended waiter spins at most 255 times
/// before suspending again. [PERF]
pub const SPIN_RETRY_CAP: u32 = 0xFF;

/// Default ceiling on enqueued wait nodes per synchronizer.
/// At the ceiling, new waiters degrade to backoff polling instead of
/// enqueueing, so queue invariants survive resource exhaustion.
pub const MAX_QUEUED_NODES: usize = 1 << 20;

/// Backoff polling: sleep cap for the exponential phase (1ms).
/// Doubling past this point only adds wakeup latency without reducing CPU.
pub const POLL_BACKOFF_CAP_NANOS: u64 = 1_000_000;

/// Backoff polling: iterations of tight spinning before yielding.
pub const POLL_SPIN_PHASE: u32 = 10;

/// Backoff polling: iterations of yielding before sleeping.
pub const POLL_YIELD_PHASE: u32 = 50;

// =============================================================================
// WORKER POOL
// =============================================================================

/// Bits of the pool control word holding the live worker count.
pub const WORKER_COUNT_BITS: u32 = 32;

/// Maximum representable live worker count.
pub const MAX_WORKER_COUNT: u64 = (1 << WORKER_COUNT_BITS) - 1;

/// Default keep-alive for workers above the core size.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
