use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A fixed memory budget that allocations reserve from.
#[derive(Debug)]
pub struct Heap {
    name: &'static str,
    capacity: u64,
    used: AtomicU64,
}

impl Heap {
    pub fn new(name: &'static str, capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            capacity,
            used: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Reserves `size` bytes, or returns `None` if that would exceed the capacity.
    pub fn try_reserve(self: &Arc<Self>, size: u64) -> Option<Reservation> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let new_used = used.checked_add(size)?;
            if new_used > self.capacity {
                return None;
            }
            match self.used.compare_exchange_weak(
                used,
                new_used,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        heap: self.clone(),
                        size,
                    })
                }
                Err(current) => used = current,
            }
        }
    }
}

/// Bytes held in a [`Heap`] until dropped.
#[derive(Debug)]
pub struct Reservation {
    heap: Arc<Heap>,
    size: u64,
}

impl Reservation {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.heap.used.fetch_sub(self.size, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_release_on_drop() {
        let heap = Heap::new("staging", 100);
        let a = heap.try_reserve(60).unwrap();
        assert!(heap.try_reserve(50).is_none());
        assert_eq!(heap.used(), 60);
        drop(a);
        assert_eq!(heap.used(), 0);
        assert!(heap.try_reserve(100).is_some());
        assert!(heap.try_reserve(u64::MAX).is_none());
    }
}
