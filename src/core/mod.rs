/*!
 * Core Module
 * Shared types, limits, and error handling
 */

pub mod ctx;
pub mod errors;
pub mod limits;

pub use ctx::{current_context, CancelToken};
pub use errors::{PoolError, PoolResult, SyncError, SyncResult};
