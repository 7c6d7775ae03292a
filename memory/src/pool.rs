use std::collections::HashMap;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use parking_lot::Mutex;

use core_types::BufferId;

struct BufferEntry<B> {
    buffer: Arc<B>,
    size: usize,
}

/// thread-safe pool of buffers, keyed by `BufferId`
pub struct BufferPool<B> {
    label: &'static str,
    next_id: AtomicU64,
    entries: Mutex<HashMap<BufferId, BufferEntry<B>>>,
}

impl<B> BufferPool<B> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            next_id: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Take ownership of a freshly allocated buffer of `size_bytes` and hand out its id
    pub fn insert(&self, buffer: B, size_bytes: usize) -> (BufferId, Arc<B>) {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(buffer);

        self.entries.lock().insert(id, BufferEntry {
            buffer: handle.clone(),
            size: size_bytes,
        });
        tracing::trace!(pool = self.label, %id, size_bytes, "buffer allocated");
        (id, handle)
    }

    /// Retrieve a clonable handle to the buffer for a given ID
    pub fn get(&self, id: BufferId) -> Option<Arc<B>> {
        self.entries.lock().get(&id).map(|e| e.buffer.clone())
    }

    pub fn get_buffer_size(&self, id: BufferId) -> Option<usize> {
        self.entries.lock().get(&id).map(|e| e.size)
    }

    /// Explicitly release a buffer by its ID
    pub fn release_buffer(&self, id: BufferId) -> bool {
        let removed = self.entries.lock().remove(&id).is_some();
        if removed {
            tracing::trace!(pool = self.label, %id, "buffer released");
        }
        removed
    }

    /// Number of buffers currently held by the pool
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_allocation() {
        let pool: BufferPool<Vec<u32>> = BufferPool::new("test");

        let (id, handle) = pool.insert(vec![0; 256], 1024);
        assert!(pool.get(id).is_some(), "Buffer should be allocated");
        assert_eq!(handle.len(), 256);
        assert_eq!(pool.get_buffer_size(id), Some(1024));

        assert!(pool.release_buffer(id));
        assert!(pool.get(id).is_none(), "Buffer should be released");
        assert!(!pool.release_buffer(id), "double release is a no-op");
    }

    #[test]
    fn ids_are_unique() {
        let pool: BufferPool<Vec<u32>> = BufferPool::new("test");
        let (a, _) = pool.insert(vec![], 0);
        let (b, _) = pool.insert(vec![], 0);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }
}
