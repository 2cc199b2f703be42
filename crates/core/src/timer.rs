//! Frame timing for the render loop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of frames the rolling average covers.
const AVERAGE_WINDOW: usize = 120;

/// Measures per-frame delta time and keeps a rolling average.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_tick: Instant,
    frame_count: u64,
    history: VecDeque<Duration>,
}

impl FrameTimer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frame_count: 0,
            history: VecDeque::with_capacity(AVERAGE_WINDOW),
        }
    }

    /// Get the total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the end of a frame and return the time since the previous one.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.push_sample(delta);
        delta
    }

    fn push_sample(&mut self, delta: Duration) {
        if self.history.len() == AVERAGE_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(delta);
        self.frame_count += 1;
    }

    /// Number of frames ticked since creation or the last reset.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Mean frame time over the last [`AVERAGE_WINDOW`] frames.
    pub fn average_frame_time(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.history.iter().sum();
        total / self.history.len() as u32
    }

    /// Whether the current frame count closes an averaging window.
    pub fn window_elapsed(&self) -> bool {
        self.frame_count > 0 && self.frame_count % AVERAGE_WINDOW as u64 == 0
    }

    /// Reset the timer to the current time.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
        self.frame_count = 0;
        self.history.clear();
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_of_empty_timer_is_zero() {
        let timer = FrameTimer::new();
        assert_eq!(timer.average_frame_time(), Duration::ZERO);
        assert_eq!(timer.frame_count(), 0);
    }

    #[test]
    fn test_average_uses_rolling_window() {
        let mut timer = FrameTimer::new();
        for _ in 0..AVERAGE_WINDOW {
            timer.push_sample(Duration::from_millis(10));
        }
        for _ in 0..AVERAGE_WINDOW {
            timer.push_sample(Duration::from_millis(20));
        }
        assert_eq!(timer.average_frame_time(), Duration::from_millis(20));
        assert_eq!(timer.frame_count(), 2 * AVERAGE_WINDOW as u64);
        assert!(timer.window_elapsed());
    }

    #[test]
    fn test_reset_clears_history() {
        let mut timer = FrameTimer::new();
        timer.tick();
        timer.reset();
        assert_eq!(timer.frame_count(), 0);
        assert!(!timer.window_elapsed());
    }
}
