/*!
 * Synchronization Primitives
 * Concrete locks built on the engine, one per hook mode it supports
 */

mod condvar;
mod latch;
mod mutex;
mod semaphore;

pub use condvar::Condvar;
pub use latch::Latch;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
