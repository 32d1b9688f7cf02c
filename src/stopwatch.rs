//! Millisecond stopwatch on the tokio clock.

use tokio::time::Instant;

/// Measures elapsed milliseconds since the last [`mark_start`](Stopwatch::mark_start).
///
/// Uses `tokio::time::Instant`, so it follows a paused test clock. Before the first
/// `mark_start` the stopwatch counts from its creation.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopwatch {
    /// New stopwatch, started now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Records the current instant as the reference point.
    pub fn mark_start(&mut self) {
        self.started = Instant::now();
    }

    /// Milliseconds since the last `mark_start`. Never negative.
    pub fn mark_elapsed(&self) -> u64 {
        let elapsed = self.started.elapsed().as_millis();
        u64::try_from(elapsed).unwrap_or(u64::MAX)
    }
}
