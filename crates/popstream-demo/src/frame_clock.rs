//! Paced frame clock feeding the scheduler its time and delta.
//!
//! Frames are paced to a target frame time. Long frames are clamped so a
//! stall (a debugger break, a slow disk) shows up as a short pause in the
//! blend timeline rather than a jump across it.

use std::time::{Duration, Instant};
use tracing::warn;

/// Longest delta handed to the scheduler, in milliseconds.
pub const MAX_FRAME_TIME_MS: f64 = 250.0;

/// Time of one frame, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameTime {
    pub index: u64,
    pub time: f64,
    pub delta: f32,
}

pub struct FrameClock {
    target_frame_ms: f64,
    previous: Instant,
    time: f64,
    frame_count: u64,
    clamped_frames: u64,
}

impl FrameClock {
    pub fn new(target_frame_ms: f32) -> Self {
        Self {
            target_frame_ms: f64::from(target_frame_ms.max(0.0)),
            previous: Instant::now(),
            time: 0.0,
            frame_count: 0,
            clamped_frames: 0,
        }
    }

    /// Sleep out the rest of the current frame, then advance by the
    /// measured wall time.
    pub fn wait_next(&mut self) -> FrameTime {
        let target = Duration::from_secs_f64(self.target_frame_ms / 1000.0);
        let spent = self.previous.elapsed();
        if spent < target {
            std::thread::sleep(target - spent);
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.previous).as_secs_f64() * 1000.0;
        self.previous = now;
        self.advance(elapsed)
    }

    /// Advance by an explicit elapsed time.
    pub fn advance(&mut self, elapsed_ms: f64) -> FrameTime {
        let mut elapsed = elapsed_ms.max(0.0);
        if elapsed > MAX_FRAME_TIME_MS {
            warn!(
                "Frame time {:.1}ms exceeds maximum, clamping to {:.1}ms",
                elapsed, MAX_FRAME_TIME_MS
            );
            elapsed = MAX_FRAME_TIME_MS;
            self.clamped_frames += 1;
        }
        self.time += elapsed;
        let frame = FrameTime {
            index: self.frame_count,
            time: self.time,
            delta: elapsed as f32,
        };
        self.frame_count += 1;
        frame
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Total clock time in milliseconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn clamped_frames(&self) -> u64 {
        self.clamped_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_accumulates_time() {
        let mut clock = FrameClock::new(16.0);
        let first = clock.advance(16.0);
        let second = clock.advance(20.0);
        assert_eq!(first.index, 0);
        assert_eq!(first.time, 16.0);
        assert_eq!(second.index, 1);
        assert_eq!(second.time, 36.0);
        assert_eq!(second.delta, 20.0);
        assert_eq!(clock.frame_count(), 2);
    }

    #[test]
    fn test_long_frame_is_clamped() {
        let mut clock = FrameClock::new(16.0);
        let frame = clock.advance(2_000.0);
        assert_eq!(frame.delta as f64, MAX_FRAME_TIME_MS);
        assert_eq!(clock.time(), MAX_FRAME_TIME_MS);
        assert_eq!(clock.clamped_frames(), 1);

        clock.advance(MAX_FRAME_TIME_MS);
        assert_eq!(clock.clamped_frames(), 1);
    }

    #[test]
    fn test_negative_elapsed_is_zero() {
        let mut clock = FrameClock::new(16.0);
        let frame = clock.advance(-5.0);
        assert_eq!(frame.delta, 0.0);
        assert_eq!(clock.time(), 0.0);
    }

    #[test]
    fn test_wait_next_paces_frames() {
        let mut clock = FrameClock::new(5.0);
        let start = Instant::now();
        let a = clock.wait_next();
        let b = clock.wait_next();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(b.time > a.time);
        assert!(a.delta >= 5.0 && b.delta >= 5.0);
    }
}
