//! Deferred destruction of GPU resources.
//!
//! A [`DeletionQueue`] collects cleanup closures while a frame is recorded and
//! runs them once the frame's completion fence has been observed. Closures run
//! in reverse registration order, so resources registered in dependency order
//! are torn down dependents first.

use tracing::{debug, warn};

type Deletor = Box<dyn FnOnce() + Send>;

/// Ordered list of deferred cleanup actions.
///
/// The queue does not know about fences. Callers must only [`flush`] it once
/// the GPU work that referenced the captured resources has completed.
///
/// [`flush`]: DeletionQueue::flush
#[derive(Default)]
pub struct DeletionQueue {
    deletors: Vec<Deletor>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action to run on the next [`DeletionQueue::flush`].
    pub fn push<F>(&mut self, deletor: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deletors.push(Box::new(deletor));
    }

    /// Runs every pending action, newest first, and empties the queue.
    pub fn flush(&mut self) {
        if self.deletors.is_empty() {
            return;
        }

        let count = self.deletors.len();
        while let Some(deletor) = self.deletors.pop() {
            deletor();
        }
        debug!("Flushed {} deferred deletion(s)", count);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.deletors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.deletors.is_empty()
    }
}

impl std::fmt::Debug for DeletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionQueue")
            .field("pending", &self.deletors.len())
            .finish()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        if !self.deletors.is_empty() {
            warn!(
                "DeletionQueue dropped with {} pending action(s); they will not run",
                self.deletors.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    #[test]
    fn test_flush_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeletionQueue::new();

        for i in 0..3 {
            let order = order.clone();
            queue.push(move || order.lock().push(i));
        }
        assert_eq!(queue.len(), 3);

        queue.flush();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_runs_each_action_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut queue = DeletionQueue::new();
        {
            let runs = runs.clone();
            queue.push(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        queue.flush();
        queue.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let mut queue = DeletionQueue::new();
        queue.flush();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_is_reusable_after_flush() {
        let mut queue = DeletionQueue::new();
        queue.push(|| {});
        queue.flush();

        queue.push(|| {});
        assert_eq!(queue.len(), 1);
        queue.flush();
    }
}
