use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Length of the trailing window used for the frame rate.
pub const FPS_WINDOW: Duration = Duration::from_millis(3000);

/// Sliding-window frame rate estimator.
#[derive(Debug, Clone)]
pub struct FrameRateMonitor {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl Default for FrameRateMonitor {
    fn default() -> Self {
        Self::new(FPS_WINDOW)
    }
}

impl FrameRateMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stamps: VecDeque::new(),
        }
    }

    /// Record a tick at `now` and return the current rate.
    ///
    /// Stamps `window` or more before `now` are evicted, so a steady stream
    /// at N Hz settles at exactly N.
    pub fn tick_at(&mut self, now: Instant) -> f32 {
        self.stamps.push_back(now);
        while let Some(&front) = self.stamps.front() {
            if now.saturating_duration_since(front) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        self.fps()
    }

    pub fn fps(&self) -> f32 {
        self.stamps.len() as f32 / self.window.as_secs_f32()
    }

    pub fn reset(&mut self) {
        self.stamps.clear();
    }
}
