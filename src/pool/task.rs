/*!
 * Task
 *
 * A unit of work with a stable id, so boxed closures keep a removal identity
 * once they are sitting in a queue.
 */

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// One submitted unit of work
pub struct Task {
    id: u64,
    body: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Task {
    pub fn new(body: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            body: Some(Box::new(body)),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run the task body. Running twice is a no-op.
    pub fn run(&mut self) {
        if let Some(body) = self.body.take() {
            body();
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("pending", &self.body.is_some())
            .finish()
    }
}
