//! Per-stream LOD bookkeeping: which levels are available, which one is
//! displayed, the active blend, and the status of the outstanding request.

use crate::range::LodRange;
use crate::transition::BlendState;

/// Cap on the exponential fetch retry backoff (2^6 times the base delay).
const MAX_BACKOFF_SHIFT: u32 = 6;

/// What [`LodState::update_display`] did this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayChange {
    /// Displayed level and blend are unchanged.
    None,
    /// A blend towards the given level started.
    BlendStarted(u8),
    /// The displayed level was swapped without blending.
    Swapped(u8),
}

/// LOD state of one streamed geometry instance.
#[derive(Clone, Debug)]
pub struct LodState {
    finest_lod: u8,
    /// Highest level whose data is applied; levels below it are all applied.
    available: Option<u8>,
    displayed: Option<u8>,
    required: u8,
    blend: Option<BlendState>,
    pending: Option<LodRange>,
    frozen: bool,
    /// `(available, required)` pair the range policy last rejected.
    rejected: Option<(Option<u8>, u8)>,
    fetch_failures: u32,
    retry_at: f64,
}

impl LodState {
    /// Create the state for a stream whose finest encoded level is `finest_lod`.
    pub fn new(finest_lod: u8) -> Self {
        Self {
            finest_lod,
            available: None,
            displayed: None,
            required: 0,
            blend: None,
            pending: None,
            frozen: false,
            rejected: None,
            fetch_failures: 0,
            retry_at: f64::NEG_INFINITY,
        }
    }

    pub fn finest_lod(&self) -> u8 {
        self.finest_lod
    }

    pub fn available(&self) -> Option<u8> {
        self.available
    }

    /// The fully blended-in level, `None` until level 0 arrives.
    pub fn displayed(&self) -> Option<u8> {
        self.displayed
    }

    pub fn required(&self) -> u8 {
        self.required
    }

    pub fn blend(&self) -> Option<&BlendState> {
        self.blend.as_ref()
    }

    pub fn pending(&self) -> Option<LodRange> {
        self.pending
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Set the level the view requires, clamped to the finest encoded level.
    pub fn set_required(&mut self, lod: u8) {
        self.required = lod.min(self.finest_lod);
    }

    /// The level the display should converge to: the required level, limited
    /// by what is available.
    pub fn target(&self) -> Option<u8> {
        self.available.map(|a| a.min(self.required))
    }

    /// The level shown right now, including a partial blend.
    pub fn blended_lod(&self) -> Option<f32> {
        match (&self.blend, self.displayed) {
            (Some(blend), _) => Some(blend.blended_lod()),
            (None, Some(lod)) => Some(f32::from(lod)),
            (None, None) => None,
        }
    }

    /// Returns `true` if the displayed level matches the requirement and no
    /// blend is running.
    pub fn is_settled(&self) -> bool {
        self.blend.is_none() && self.displayed == Some(self.required)
    }

    /// Returns `true` if a new fetch should be planned at `now` (ms).
    ///
    /// Retreating (required below available) never fetches; fetched data is
    /// kept for a later approach.
    pub fn needs_fetch(&self, now: f64) -> bool {
        !self.frozen
            && self.pending.is_none()
            && now >= self.retry_at
            && self.available.is_none_or(|a| a < self.required)
            && self.rejected != Some((self.available, self.required))
    }

    pub fn on_request_issued(&mut self, range: LodRange) {
        self.pending = Some(range);
        self.rejected = None;
    }

    /// Remember that the policy rejected the current gap so it is not retried
    /// until either side of the gap changes.
    pub fn on_policy_rejected(&mut self) {
        self.rejected = Some((self.available, self.required));
    }

    /// Record that `lod` has been applied. Levels arrive in increasing order.
    pub fn on_lod_applied(&mut self, lod: u8) {
        if self.available.is_none_or(|a| lod > a) {
            self.available = Some(lod.min(self.finest_lod));
        }
    }

    /// The outstanding request has been fully applied.
    pub fn on_request_completed(&mut self, range: LodRange) {
        if self.pending == Some(range) {
            self.pending = None;
        }
        self.fetch_failures = 0;
    }

    /// The outstanding request failed to fetch; schedule a retry with
    /// exponential backoff starting at `base_delay` ms.
    pub fn on_fetch_failed(&mut self, now: f64, base_delay: f32) {
        self.pending = None;
        let shift = self.fetch_failures.min(MAX_BACKOFF_SHIFT);
        self.fetch_failures += 1;
        self.retry_at = now + f64::from(base_delay) * f64::from(1u32 << shift);
    }

    /// Decoding failed: stay at the last good level and stop requesting.
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.pending = None;
    }

    /// Allow requests again after a decode failure.
    pub fn unfreeze(&mut self) {
        self.frozen = false;
        self.rejected = None;
    }

    /// Start, supersede or skip a transition towards [`target`](Self::target).
    ///
    /// `blending_period` is `None` when blending is disabled, in which case
    /// the swap is applied immediately.
    pub fn update_display(&mut self, now: f64, blending_period: Option<f32>) -> DisplayChange {
        let Some(target) = self.target() else {
            return DisplayChange::None;
        };
        let Some(displayed) = self.displayed else {
            // Nothing on screen yet: show the first level directly.
            self.displayed = Some(target);
            return DisplayChange::Swapped(target);
        };

        let heading_to = self.blend.map_or(displayed, |b| b.to());
        if heading_to == target {
            return DisplayChange::None;
        }

        match blending_period {
            Some(period) if period > 0.0 => {
                let from = self
                    .blend
                    .map_or(f32::from(displayed), |b| b.blended_lod());
                self.blend = Some(BlendState::new(from, target, now, period));
                DisplayChange::BlendStarted(target)
            }
            _ => {
                self.blend = None;
                self.displayed = Some(target);
                DisplayChange::Swapped(target)
            }
        }
    }

    /// Advance the active blend by `delta_time` ms. Returns the newly
    /// displayed level when the blend completes.
    pub fn advance_blend(&mut self, delta_time: f32) -> Option<u8> {
        let blend = self.blend.as_mut()?;
        if blend.advance(delta_time) {
            let lod = blend.to();
            self.blend = None;
            self.displayed = Some(lod);
            return Some(lod);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Option<f32> = Some(100.0);

    fn state_with(available: u8, required: u8) -> LodState {
        let mut state = LodState::new(6);
        state.set_required(required);
        for lod in 0..=available {
            state.on_lod_applied(lod);
        }
        state
    }

    #[test]
    fn test_first_level_is_shown_without_blending() {
        let mut state = LodState::new(4);
        state.on_lod_applied(0);
        assert_eq!(state.update_display(0.0, PERIOD), DisplayChange::Swapped(0));
        assert_eq!(state.displayed(), Some(0));
        assert!(state.blend().is_none());
    }

    #[test]
    fn test_new_level_starts_blend() {
        let mut state = state_with(0, 3);
        state.update_display(0.0, PERIOD);
        state.on_lod_applied(1);

        assert_eq!(state.update_display(16.0, PERIOD), DisplayChange::BlendStarted(1));
        assert_eq!(state.displayed(), Some(0));

        assert_eq!(state.advance_blend(60.0), None);
        assert_eq!(state.advance_blend(60.0), Some(1));
        assert_eq!(state.displayed(), Some(1));
        assert!(state.blend().is_none());
    }

    /// Without blending the swap happens within the same update.
    #[test]
    fn test_swap_is_atomic_without_blending() {
        let mut state = state_with(0, 3);
        state.update_display(0.0, None);
        state.on_lod_applied(1);
        state.on_lod_applied(2);

        assert_eq!(state.update_display(16.0, None), DisplayChange::Swapped(2));
        assert_eq!(state.displayed(), Some(2));
        assert!(state.blend().is_none());
    }

    /// A newer level supersedes the running blend from its current position.
    #[test]
    fn test_superseding_blend_is_continuous() {
        let mut state = state_with(0, 4);
        state.update_display(0.0, PERIOD);
        state.on_lod_applied(1);
        state.update_display(0.0, PERIOD);
        state.advance_blend(50.0);
        let before = state.blended_lod().unwrap();

        state.on_lod_applied(2);
        assert_eq!(state.update_display(50.0, PERIOD), DisplayChange::BlendStarted(2));
        let after = state.blended_lod().unwrap();
        assert!((before - after).abs() < 1e-5, "{before} != {after}");
        assert_eq!(state.blend().unwrap().progress(), 0.0);
    }

    /// Retreating lowers the display but never requests data.
    #[test]
    fn test_retreat_degrades_without_fetching() {
        let mut state = state_with(3, 3);
        state.update_display(0.0, None);
        assert_eq!(state.displayed(), Some(3));

        state.set_required(1);
        assert!(!state.needs_fetch(0.0));
        assert_eq!(state.update_display(0.0, PERIOD), DisplayChange::BlendStarted(1));
        state.advance_blend(100.0);
        assert_eq!(state.displayed(), Some(1));
        assert_eq!(state.available(), Some(3), "fetched data must be retained");

        // Re-approaching uses the retained data.
        state.set_required(3);
        assert!(!state.needs_fetch(0.0));
        assert_eq!(state.update_display(0.0, PERIOD), DisplayChange::BlendStarted(3));
    }

    #[test]
    fn test_needs_fetch_respects_pending_request() {
        let mut state = state_with(0, 2);
        assert!(state.needs_fetch(0.0));
        state.on_request_issued(LodRange::single(1));
        assert!(!state.needs_fetch(0.0));
        state.on_lod_applied(1);
        state.on_request_completed(LodRange::single(1));
        assert!(state.needs_fetch(0.0));
    }

    #[test]
    fn test_fetch_failure_backs_off_exponentially() {
        let mut state = state_with(0, 2);
        state.on_request_issued(LodRange::single(1));
        state.on_fetch_failed(1000.0, 100.0);
        assert!(!state.needs_fetch(1050.0));
        assert!(state.needs_fetch(1100.0));

        state.on_request_issued(LodRange::single(1));
        state.on_fetch_failed(2000.0, 100.0);
        assert!(!state.needs_fetch(2150.0));
        assert!(state.needs_fetch(2200.0));
    }

    #[test]
    fn test_frozen_stream_stops_fetching() {
        let mut state = state_with(1, 4);
        state.on_request_issued(LodRange::single(2));
        state.freeze();
        assert!(state.pending().is_none());
        assert!(!state.needs_fetch(0.0));
        state.unfreeze();
        assert!(state.needs_fetch(0.0));
    }

    #[test]
    fn test_rejected_gap_is_not_retried_until_it_changes() {
        let mut state = state_with(0, 2);
        state.on_policy_rejected();
        assert!(!state.needs_fetch(0.0));
        state.set_required(3);
        assert!(state.needs_fetch(0.0));
    }

    /// Displayed level never decreases while the camera keeps approaching.
    #[test]
    fn test_displayed_lod_monotonic_during_approach() {
        let mut state = LodState::new(6);
        let mut last_displayed = None;
        let mut time = 0.0;

        for step in 0..400u32 {
            state.set_required((step / 40) as u8);
            if step % 13 == 0 {
                let next = state.available().map_or(0, |a| a + 1);
                if next <= state.finest_lod() {
                    state.on_lod_applied(next);
                }
            }
            state.update_display(time, PERIOD);
            state.advance_blend(16.0);
            time += 16.0;

            let displayed = state.displayed();
            assert!(displayed >= last_displayed, "{last_displayed:?} -> {displayed:?}");
            last_displayed = displayed;
        }
        assert_eq!(state.displayed(), Some(6));
    }

    #[test]
    fn test_required_is_clamped_to_finest() {
        let mut state = LodState::new(3);
        state.set_required(200);
        assert_eq!(state.required(), 3);
    }
}
