//! LOD blending: time-based transition between two displayed detail levels.

/// A single LOD transition in progress.
///
/// `from` is fractional so a transition that supersedes an unfinished one
/// starts exactly where the previous blend was, keeping the displayed level
/// continuous.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlendState {
    from: f32,
    to: u8,
    start_time: f64,
    /// Duration in milliseconds.
    duration: f32,
    progress: f32,
}

impl BlendState {
    /// Start a transition at `start_time` (ms) lasting `duration` ms.
    pub fn new(from: f32, to: u8, start_time: f64, duration: f32) -> Self {
        Self {
            from,
            to,
            start_time,
            duration,
            progress: 0.0,
        }
    }

    /// Advance the transition by `delta_time` milliseconds.
    ///
    /// Progress never decreases and is clamped to `1.0`. Returns `true` once
    /// the transition is complete.
    pub fn advance(&mut self, delta_time: f32) -> bool {
        if self.duration <= 0.0 {
            self.progress = 1.0;
        } else if delta_time > 0.0 {
            self.progress = (self.progress + delta_time / self.duration).min(1.0);
        }
        self.is_complete()
    }

    /// Returns `true` once progress has reached `1.0`.
    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }

    /// Transition progress in `[0.0, 1.0]`.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    /// The (possibly fractional) level the transition started from.
    pub fn from(&self) -> f32 {
        self.from
    }

    /// The level being blended in.
    pub fn to(&self) -> u8 {
        self.to
    }

    /// Time (ms) at which the transition started.
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Duration of the transition in milliseconds.
    pub fn duration(&self) -> f32 {
        self.duration
    }

    /// The level currently shown, interpolated between `from` and `to`.
    pub fn blended_lod(&self) -> f32 {
        self.from + (f32::from(self.to) - self.from) * self.progress
    }

    /// Alpha values `(outgoing, incoming)` for a crossfade, both in `[0, 1]`.
    pub fn crossfade_alphas(&self) -> (f32, f32) {
        let t = smooth_step(self.progress);
        (1.0 - t, t)
    }
}

/// Hermite smooth step for natural-looking transitions.
pub fn smooth_step(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}
