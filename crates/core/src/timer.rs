//! Frame timer.

use std::time::{Duration, Instant};

/// Measures frame deltas and a rolling frames-per-second figure.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    frames: u64,
    window_start: Instant,
    window_frames: u32,
    fps: f32,
}

impl Timer {
    /// Length of the window over which `fps()` is averaged.
    const FPS_WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frames: 0,
            window_start: now,
            window_frames: 0,
            fps: 0.0,
        }
    }

    /// Total time since the timer was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed().as_secs_f32()
    }

    /// Mark the end of a frame and return the time since the previous one.
    ///
    /// Returns `Some(fps)` once per averaging window so callers can log it
    /// without flooding the output.
    pub fn tick(&mut self) -> (Duration, Option<f32>) {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.frames += 1;
        self.window_frames += 1;

        let window = now - self.window_start;
        if window >= Self::FPS_WINDOW {
            self.fps = self.window_frames as f32 / window.as_secs_f32();
            self.window_frames = 0;
            self.window_start = now;
            return (delta, Some(self.fps));
        }
        (delta, None)
    }

    /// Frames ticked since creation.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Most recently completed fps measurement.
    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_counts_frames() {
        let mut timer = Timer::new();
        timer.tick();
        timer.tick();
        assert_eq!(timer.frames(), 2);
        timer.reset();
        assert_eq!(timer.frames(), 0);
    }
}
