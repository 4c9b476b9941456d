//! Handle registry — the set of all live handles for one pool.
//!
//! Copy-on-write: writers serialize on a small mutex and publish a fresh
//! vector; readers load the current vector without taking any lock, so an
//! iteration in progress keeps its view while handles are added or removed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::handle::Handle;

pub struct HandleRegistry {
    handles: ArcSwap<Vec<Arc<Handle>>>,
    write_lock: Mutex<()>,
    /// Round-robin cursor for reuse scans; persists across calls.
    cursor: AtomicUsize,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            handles: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, handle: Arc<Handle>) {
        let _guard = self.write_lock.lock();
        let mut next = Vec::clone(&self.handles.load());
        next.push(handle);
        self.handles.store(Arc::new(next));
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Handle>> {
        let _guard = self.write_lock.lock();
        let current = self.handles.load();
        let index = current.iter().position(|h| h.id() == id)?;
        let mut next = Vec::clone(&current);
        let removed = next.remove(index);
        self.handles.store(Arc::new(next));
        Some(removed)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Handle>> {
        self.handles.load().iter().find(|h| h.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handles.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current handle set. Stays valid while the registry changes.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Handle>>> {
        self.handles.load_full()
    }

    /// Next scan index for a set of `len` handles, wrapping past the end.
    pub fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(idx % len)
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_core::RawConnection;

    #[derive(Debug)]
    struct NullConnection;

    impl RawConnection for NullConnection {
        fn execute(&mut self, _command: &str) -> Result<u64, String> {
            Ok(0)
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn close(&mut self) {}
    }

    fn handle(id: u64) -> Arc<Handle> {
        Arc::new(Handle::new(id, Box::new(NullConnection)))
    }

    #[test]
    fn insert_get_remove() {
        let registry = HandleRegistry::new();
        assert!(registry.is_empty());
        registry.insert(handle(1));
        registry.insert(handle(2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(2).map(|h| h.id()), Some(2));

        assert_eq!(registry.remove(1).map(|h| h.id()), Some(1));
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_survives_removal() {
        let registry = HandleRegistry::new();
        for id in 1..=3 {
            registry.insert(handle(id));
        }
        let snapshot = registry.snapshot();
        registry.remove(2);
        registry.remove(3);

        let ids: Vec<u64> = snapshot.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cursor_wraps_and_persists() {
        let registry = HandleRegistry::new();
        assert_eq!(registry.next_index(0), None);
        assert_eq!(registry.next_index(3), Some(0));
        assert_eq!(registry.next_index(3), Some(1));
        assert_eq!(registry.next_index(3), Some(2));
        assert_eq!(registry.next_index(3), Some(0));
        // Registry shrank; the cursor keeps going and wraps into range.
        assert_eq!(registry.next_index(2), Some(0));
        assert_eq!(registry.next_index(2), Some(1));
    }

    #[test]
    fn concurrent_inserts_are_not_lost() {
        let registry = Arc::new(HandleRegistry::new());
        let threads: Vec<_> = (0..4u64)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        registry.insert(handle(t * 100 + i));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.len(), 200);
    }
}
