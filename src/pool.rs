use parking_lot::RwLock;

use crate::data::DataGen;

/// Identifiers produced by earlier operations, shared by every virtual user of a run.
///
/// This is the one piece of state virtual users share besides the collector. Appends
/// take a short write lock, random reads a read lock. With a capacity set, the pool
/// behaves as a ring and the oldest entries are overwritten.
#[derive(Debug)]
pub struct SharedPool<T> {
    inner: RwLock<Ring<T>>,
}

#[derive(Debug)]
struct Ring<T> {
    items: Vec<T>,
    capacity: Option<usize>,
    next: usize,
}

impl<T: Clone> Default for SharedPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SharedPool<T> {
    /// Unbounded pool.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Ring {
                items: Vec::new(),
                capacity: None,
                next: 0,
            }),
        }
    }

    /// Pool keeping at most `capacity` entries. A capacity of 0 is treated as 1.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(Ring {
                items: Vec::with_capacity(capacity),
                capacity: Some(capacity),
                next: 0,
            }),
        }
    }

    pub fn push(&self, item: T) {
        let mut ring = self.inner.write();
        match ring.capacity {
            Some(cap) if ring.items.len() >= cap => {
                let slot = ring.next;
                ring.items[slot] = item;
                ring.next = (slot + 1) % cap;
            }
            _ => ring.items.push(item),
        }
    }

    /// A uniformly random entry, `None` while the pool is empty.
    pub fn random(&self, data: &DataGen) -> Option<T> {
        let ring = self.inner.read();
        data.choose(&ring.items).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn random_from_empty_pool_is_none() {
        let pool: SharedPool<String> = SharedPool::new();
        assert_eq!(pool.random(&DataGen::seeded(1)), None);
    }

    #[test]
    fn ring_overwrites_oldest() {
        let pool = SharedPool::with_capacity(2);
        pool.push(1);
        pool.push(2);
        pool.push(3);
        assert_eq!(pool.len(), 2);

        let data = DataGen::seeded(5);
        for _ in 0..50 {
            let v = pool.random(&data).unwrap();
            assert!(v == 2 || v == 3);
        }
    }

    #[test]
    fn concurrent_appends_are_kept() {
        let pool = Arc::new(SharedPool::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let data = DataGen::seeded(t);
                    for i in 0..500 {
                        pool.push(format!("{t}-{i}"));
                        let _ = pool.random(&data);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(pool.len(), 8 * 500);
    }
}
