use std::{any::Any, sync::Mutex};

/// Retirement ring with one free list per frame in flight.
///
/// Values deferred while slot `f` is current are released the next time slot `f` begins,
/// which is after the GPU finished every frame that could still reference them.
pub struct DropQueue {
    slots: Mutex<Vec<Vec<Box<dyn Any + Send>>>>,
}

impl DropQueue {
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count > 0);
        Self {
            slots: Mutex::new((0..frame_count).map(|_| Vec::new()).collect()),
        }
    }

    pub fn defer(&self, frame: usize, value: Box<dyn Any + Send>) {
        let mut slots = self.slots.lock().unwrap();
        let index = frame % slots.len();
        slots[index].push(value);
    }

    /// Releases everything deferred in `frame`'s slot.
    pub fn retire(&self, frame: usize) {
        let retired = {
            let mut slots = self.slots.lock().unwrap();
            let index = frame % slots.len();
            std::mem::take(&mut slots[index])
        };
        // Dropped outside the lock, destructors may defer again.
        drop(retired);
    }

    pub fn retire_all(&self) {
        let retired: Vec<_> = {
            let mut slots = self.slots.lock().unwrap();
            slots.iter_mut().map(std::mem::take).collect()
        };
        drop(retired);
    }

    pub fn pending(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn retires_after_full_ring() {
        let queue = DropQueue::new(2);
        let resource = Arc::new(());

        queue.defer(0, Box::new(resource.clone()));
        assert_eq!(Arc::strong_count(&resource), 2);

        // Frame 1 begins, frame 0 may still be in flight.
        queue.retire(1);
        assert_eq!(Arc::strong_count(&resource), 2);

        // Frame 2 reuses slot 0.
        queue.retire(2);
        assert_eq!(Arc::strong_count(&resource), 1);
        assert_eq!(queue.pending(), 0);
    }
}
