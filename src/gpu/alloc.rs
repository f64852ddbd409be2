/// Outcome of reserving GPU memory.
///
/// Exhaustion of either heap is recoverable, so it is a value instead of an error.
#[must_use]
#[derive(Debug)]
pub enum Alloc<T> {
    Success(T),
    StagingFull,
    DeviceFull,
}

impl<T> Alloc<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Alloc<U> {
        match self {
            Alloc::Success(value) => Alloc::Success(f(value)),
            Alloc::StagingFull => Alloc::StagingFull,
            Alloc::DeviceFull => Alloc::DeviceFull,
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Alloc<U>) -> Alloc<U> {
        match self {
            Alloc::Success(value) => f(value),
            Alloc::StagingFull => Alloc::StagingFull,
            Alloc::DeviceFull => Alloc::DeviceFull,
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Alloc::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Alloc::Success(_))
    }

    /// Logs which heap ran out. Returns true on exhaustion.
    pub fn out_of_memory(&self) -> bool {
        match self {
            Alloc::Success(_) => false,
            Alloc::StagingFull => {
                log::warn!("Out of staging memory, draining tasks...");
                true
            }
            Alloc::DeviceFull => {
                log::warn!("Out of device memory, draining tasks...");
                true
            }
        }
    }
}

/// Unwraps an [`Alloc::Success`] or returns the exhaustion from the enclosing function.
#[macro_export]
macro_rules! try_alloc {
    ($alloc:expr) => {
        match $alloc {
            $crate::gpu::Alloc::Success(value) => value,
            $crate::gpu::Alloc::StagingFull => return $crate::gpu::Alloc::StagingFull,
            $crate::gpu::Alloc::DeviceFull => return $crate::gpu::Alloc::DeviceFull,
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both(a: Alloc<u32>, b: Alloc<u32>) -> Alloc<u32> {
        let a = try_alloc!(a);
        let b = try_alloc!(b);
        Alloc::Success(a + b)
    }

    #[test]
    fn try_alloc_propagates_first_failure() {
        assert!(matches!(
            both(Alloc::Success(1), Alloc::Success(2)),
            Alloc::Success(3)
        ));
        assert!(matches!(
            both(Alloc::StagingFull, Alloc::DeviceFull),
            Alloc::StagingFull
        ));
        assert!(matches!(
            both(Alloc::Success(1), Alloc::DeviceFull),
            Alloc::DeviceFull
        ));
    }
}
