//! Chunked multi-producer multi-consumer FIFO queues.
//!
//! Worklists are the only structures that cross thread boundaries inside a
//! round: the two item worklists that alternate between rounds, the queue of
//! freshly pushed work drained between outer rounds, and the source queue of
//! the dependency-graph fast path. All of them share one shape, a thin
//! wrapper over [`crossbeam_deque::Injector`], which stores items in chunked
//! blocks and hands them out in FIFO order.

use crossbeam_deque::{Injector, Steal};

/// A chunked MPMC FIFO queue.
pub(crate) struct ChunkQueue<T> {
    inner: Injector<T>,
}

impl<T> ChunkQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Injector::new(),
        }
    }

    /// Push a value onto the back of the queue.
    pub(crate) fn push(&self, value: T) {
        self.inner.push(value);
    }

    /// Pop a value from the front of the queue.
    ///
    /// Retries internally on contention; `None` means the queue was observed
    /// empty.
    pub(crate) fn pop(&self) -> Option<T> {
        loop {
            match self.inner.steal() {
                Steal::Success(value) => return Some(value),
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Default for ChunkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_returns_items_in_push_order() {
        let q = ChunkQueue::new();
        for i in 0..100 {
            q.push(i);
        }
        for i in 0..100 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn is_empty_tracks_contents() {
        let q = ChunkQueue::new();
        assert!(q.is_empty());
        q.push(1);
        assert!(!q.is_empty());
        q.pop();
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        let q = Arc::new(ChunkQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for t in 0..4 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    q.push(t * 1000 + i);
                }
            }));
        }
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || loop {
                if q.pop().is_some() {
                    if popped.fetch_add(1, Ordering::Relaxed) + 1 == 4000 {
                        return;
                    }
                } else if popped.load(Ordering::Relaxed) >= 4000 {
                    return;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(popped.load(Ordering::Relaxed), 4000);
        assert!(q.is_empty());
    }
}
