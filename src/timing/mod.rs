//! Capture timestamps
//!
//! One monotonic timebase is shared by the audio and video paths so their
//! presentation times line up in the merged file.

use std::sync::Arc;
use std::time::Instant;

/// Monotonic microsecond clock shared between streams.
///
/// Cloning shares the start instant.
#[derive(Debug, Clone)]
pub struct CaptureClock {
    start: Arc<Instant>,
}

impl CaptureClock {
    pub fn new() -> Self {
        Self {
            start: Arc::new(Instant::now()),
        }
    }

    /// Create a clock from an existing start instant
    pub fn from_instant(start: Instant) -> Self {
        Self {
            start: Arc::new(start),
        }
    }

    /// Microseconds elapsed since the clock started
    #[inline]
    pub fn now_us(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }

    /// Microseconds between the clock start and `instant`
    ///
    /// Instants before the start clamp to zero.
    #[inline]
    pub fn us_at(&self, instant: Instant) -> i64 {
        instant
            .checked_duration_since(*self.start)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }

    pub fn start_instant(&self) -> Instant {
        *self.start
    }

    /// A per-stream stamper over this clock
    pub fn stream(&self) -> StreamStamper {
        StreamStamper {
            clock: self.clone(),
            last_us: None,
        }
    }
}

impl Default for CaptureClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out strictly increasing timestamps for one stream.
///
/// Two reads within the same microsecond get distinct values; the later one
/// is bumped by one.
#[derive(Debug, Clone)]
pub struct StreamStamper {
    clock: CaptureClock,
    last_us: Option<i64>,
}

impl StreamStamper {
    pub fn next_us(&mut self) -> i64 {
        let now = self.clock.now_us();
        let stamp = match self.last_us {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        self.last_us = Some(stamp);
        stamp
    }

    pub fn last_us(&self) -> Option<i64> {
        self.last_us
    }
}
