use std::time::{Duration, Instant};

/// Wall clock timer for phase and frame diagnostics.
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Stopwatch {
        Stopwatch {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the elapsed milliseconds and starts over.
    pub fn lap(&mut self) -> f64 {
        let ms = self.ms();
        self.start = Instant::now();
        ms
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}
