use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Shortest and longest allowed switch interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Rotates through a list of background images on a fixed interval.
#[derive(Debug, Clone)]
pub struct Carousel {
    images: Vec<PathBuf>,
    interval: Duration,
    index: usize,
    last_switch: Instant,
}

impl Carousel {
    /// `None` if there is nothing to rotate through.
    pub fn new(images: Vec<PathBuf>, interval: Duration, now: Instant) -> Option<Self> {
        if images.is_empty() {
            return None;
        }
        Some(Self {
            images,
            interval: interval.clamp(MIN_INTERVAL, MAX_INTERVAL),
            index: 0,
            last_switch: now,
        })
    }

    pub fn current(&self) -> &Path {
        &self.images[self.index]
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Advance when the interval has elapsed, returning the new image.
    pub fn poll(&mut self, now: Instant) -> Option<&Path> {
        if now.saturating_duration_since(self.last_switch) < self.interval {
            return None;
        }
        self.last_switch = now;
        self.index = (self.index + 1) % self.images.len();
        Some(&self.images[self.index])
    }
}
