//! Small helpers over the tokio runtime for the upload pipeline.

use std::future::Future;

use tokio::{runtime::Handle, task::JoinHandle};

/// Moves `work` onto a blocking worker and waits for it.
pub async fn suspend<F, R>(work: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    join(tokio::task::spawn_blocking(work)).await
}

/// Awaits a task, resuming its panic on the caller.
pub async fn join<T>(handle: JoinHandle<T>) -> T {
    match handle.await {
        Ok(value) => value,
        Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
        Err(error) => panic!("Task was cancelled: {error}"),
    }
}

/// Blocks the current thread until `future` completes.
///
/// Works both from plain threads and from worker threads of a multi threaded runtime.
pub fn block_on<F: Future>(handle: &Handle, future: F) -> F::Output {
    if Handle::try_current().is_ok() {
        tokio::task::block_in_place(|| handle.block_on(future))
    } else {
        handle.block_on(future)
    }
}

/// A fixed capacity set of in flight tasks.
///
/// Tasks may finish in any order but [`BoundedTasks::drain`] yields their results in the
/// order they were spawned.
pub struct BoundedTasks<T> {
    tasks: Vec<JoinHandle<T>>,
    capacity: usize,
}

impl<T: Send + 'static> BoundedTasks<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            tasks: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn spawn_blocking<F>(&mut self, work: F)
    where
        F: FnOnce() -> T + Send + 'static,
    {
        debug_assert!(!self.is_full());
        self.tasks.push(tokio::task::spawn_blocking(work));
    }

    /// Adds an already finished value, used for placeholders of skipped uploads.
    pub fn ready(&mut self, value: T) {
        debug_assert!(!self.is_full());
        self.tasks.push(tokio::spawn(async move { value }));
    }

    pub fn is_full(&self) -> bool {
        self.tasks.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn drain(&mut self) -> Vec<T> {
        let mut results = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            results.push(join(task).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drain_keeps_submission_order() {
        let mut tasks = BoundedTasks::new(3);
        for i in 0..3u64 {
            tasks.spawn_blocking(move || {
                thread::sleep(Duration::from_millis(30 - i * 10));
                i
            });
        }
        assert!(tasks.is_full());
        assert_eq!(tasks.drain().await, vec![0, 1, 2]);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn ready_values_take_a_slot() {
        let mut tasks = BoundedTasks::new(1);
        tasks.ready("skipped");
        assert!(tasks.is_full());
        assert_eq!(tasks.drain().await, vec!["skipped"]);
    }

    #[tokio::test]
    async fn zero_capacity_still_makes_progress() {
        let tasks = BoundedTasks::<()>::new(0);
        assert_eq!(tasks.capacity(), 1);
    }

    #[test]
    fn block_on_from_plain_thread() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let value = block_on(runtime.handle(), suspend(|| 7));
        assert_eq!(value, 7);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn panics_propagate() {
        suspend(|| panic!("boom")).await
    }
}
