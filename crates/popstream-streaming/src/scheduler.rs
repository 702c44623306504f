//! Master LOD scheduler.
//!
//! Once per rendered frame [`MasterLodScheduler::tick`] collects finished
//! fetches and decodes, works out which level every registered surface needs
//! from its projected screen-space error, asks the range policy how much to
//! fetch, and advances the blends that hide LOD transitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use glam::Mat4;
use popstream_lod::{
    BlendState, BoundingSphere, DisplayChange, ErrorToleranceSelector, LodState, PolicyError,
    ViewParams, resolve_range,
};
use popstream_parser::{PopDecoder, StreamId};
use tracing::{debug, trace, warn};

use crate::error::StreamingError;
use crate::extension::{ExtensionEvent, RequestOutcome, StreamingExtension};
use crate::geometry::PopGeometry;
use crate::loader::Loader;
use crate::notification::StreamNotification;
use crate::options::StreamingOptions;

/// Cap on the exponential header retry backoff (2^6 times the base delay).
const MAX_HEADER_BACKOFF_SHIFT: u32 = 6;

/// What the renderer needs to draw one surface this frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayState {
    /// Fully blended-in level, `None` until level 0 has arrived.
    pub lod: Option<u8>,
    /// Level shown right now, fractional while blending.
    pub blended_lod: Option<f32>,
    /// The running transition, if any.
    pub blend: Option<BlendState>,
    /// Crossfade alphas `(outgoing, incoming)`; `(1.0, 0.0)` when idle.
    pub alphas: (f32, f32),
}

/// Coarse lifecycle state of a surface's stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    /// Waiting for the header-only load.
    LoadingHeader,
    /// Fetching, decoding or blending towards the required level.
    Streaming,
    /// Displaying the best level the view needs (or the data allows).
    Idle,
    /// Stopped after a decode error; see [`MasterLodScheduler::retry`].
    Frozen,
}

/// Per-tick counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub streams: usize,
    pub visible: usize,
    pub culled: usize,
    pub requests_issued: usize,
    pub requests_deferred: usize,
    pub requests_duplicate: usize,
    pub policy_rejections: usize,
    pub lods_applied: usize,
    pub display_changes: usize,
    pub blends_active: usize,
    pub outstanding_fetches: usize,
    pub active_decodes: usize,
    pub peak_decodes: usize,
}

/// LOD data of a surface whose header has arrived.
struct StreamLod {
    state: LodState,
    bounds: BoundingSphere,
    level_errors: Vec<f32>,
    block_lengths: Vec<u64>,
}

struct Surface {
    transform: Mat4,
    lod: Option<StreamLod>,
    header_failures: u32,
    header_retry_at: Option<f64>,
    header_frozen: bool,
}

impl Surface {
    fn new(transform: Mat4) -> Self {
        Self {
            transform,
            lod: None,
            header_failures: 0,
            header_retry_at: None,
            header_frozen: false,
        }
    }
}

/// Drives LOD selection, fetching and blending for every registered surface.
pub struct MasterLodScheduler {
    extension: StreamingExtension,
    options: Arc<StreamingOptions>,
    selector: ErrorToleranceSelector,
    surfaces: BTreeMap<StreamId, Surface>,
    view: Option<ViewParams>,
    notify_tx: Sender<StreamNotification>,
    notify_rx: Receiver<StreamNotification>,
    time: f64,
    stats: TickStats,
}

impl MasterLodScheduler {
    pub fn new(extension: StreamingExtension) -> Self {
        let options = Arc::clone(extension.options());
        let selector = ErrorToleranceSelector::new(options.error_tolerance_threshold());
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        Self {
            extension,
            options,
            selector,
            surfaces: BTreeMap::new(),
            view: None,
            notify_tx,
            notify_rx,
            time: 0.0,
            stats: TickStats::default(),
        }
    }

    /// Build the extension and the scheduler in one step.
    pub fn create(
        options: StreamingOptions,
        loader: Arc<dyn Loader>,
        decoder: Arc<dyn PopDecoder>,
    ) -> Result<Self, StreamingError> {
        let extension = StreamingExtension::new(Arc::new(options), loader, decoder)?;
        Ok(Self::new(extension))
    }

    /// Register a surface and start loading its header.
    pub fn add_surface(&mut self, resource: impl Into<String>, transform: Mat4) -> StreamId {
        let id = self.extension.open_stream(resource, self.time);
        self.surfaces.insert(id, Surface::new(transform));
        id
    }

    /// Unregister a surface. In-flight work for it is discarded.
    pub fn remove_surface(&mut self, id: StreamId) -> bool {
        let removed = self.surfaces.remove(&id).is_some();
        self.extension.close_stream(id);
        removed
    }

    pub fn set_transform(&mut self, id: StreamId, transform: Mat4) -> Result<(), StreamingError> {
        let surface = self
            .surfaces
            .get_mut(&id)
            .ok_or(StreamingError::UnknownStream(id))?;
        surface.transform = transform;
        Ok(())
    }

    /// Camera used by the next ticks.
    pub fn set_view(&mut self, view: ViewParams) {
        self.view = Some(view);
    }

    pub fn view(&self) -> Option<&ViewParams> {
        self.view.as_ref()
    }

    /// Receiver of notifications. All receivers share one queue.
    pub fn notifications(&self) -> Receiver<StreamNotification> {
        self.notify_rx.clone()
    }

    /// Counters of the last tick.
    pub fn stats(&self) -> TickStats {
        self.stats
    }

    pub fn extension(&self) -> &StreamingExtension {
        &self.extension
    }

    /// Direct access to the extension, e.g. to prefetch ranges ahead of need.
    pub fn extension_mut(&mut self) -> &mut StreamingExtension {
        &mut self.extension
    }

    pub fn surface_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.surfaces.keys().copied()
    }

    pub fn geometry(&self, id: StreamId) -> Option<&PopGeometry> {
        self.extension.geometry(id)
    }

    pub fn lod_state(&self, id: StreamId) -> Option<&LodState> {
        self.surfaces.get(&id)?.lod.as_ref().map(|l| &l.state)
    }

    pub fn display_state(&self, id: StreamId) -> Option<DisplayState> {
        let state = &self.surfaces.get(&id)?.lod.as_ref()?.state;
        let blend = state.blend().copied();
        Some(DisplayState {
            lod: state.displayed(),
            blended_lod: state.blended_lod(),
            blend,
            alphas: blend.map_or((1.0, 0.0), |b| b.crossfade_alphas()),
        })
    }

    pub fn stream_status(&self, id: StreamId) -> Option<StreamStatus> {
        let surface = self.surfaces.get(&id)?;
        let Some(lod) = &surface.lod else {
            return Some(if surface.header_frozen {
                StreamStatus::Frozen
            } else {
                StreamStatus::LoadingHeader
            });
        };
        let state = &lod.state;
        let status = if state.is_frozen() {
            StreamStatus::Frozen
        } else if state.pending().is_some()
            || state.blend().is_some()
            || state.available().is_none_or(|a| a < state.required())
            || state.displayed() != state.target()
        {
            StreamStatus::Streaming
        } else {
            StreamStatus::Idle
        };
        Some(status)
    }

    /// Resume a stream stopped by a decode error.
    pub fn retry(&mut self, id: StreamId) -> Result<(), StreamingError> {
        let surface = self
            .surfaces
            .get_mut(&id)
            .ok_or(StreamingError::UnknownStream(id))?;
        match &mut surface.lod {
            Some(lod) => lod.state.unfreeze(),
            None => {
                surface.header_frozen = false;
                surface.header_failures = 0;
                surface.header_retry_at = None;
                self.extension.requeue_header(id, self.time)?;
            }
        }
        debug!("{id}: retry requested");
        Ok(())
    }

    /// Run one frame. `time` and `delta_time` are in milliseconds.
    pub fn tick(&mut self, time: f64, delta_time: f32) {
        self.time = time;
        let mut stats = TickStats::default();

        for event in self.extension.poll(time) {
            self.handle_event(event, time, &mut stats);
        }
        self.retry_headers(time);

        let Self {
            extension,
            options,
            selector,
            surfaces,
            view,
            notify_tx,
            ..
        } = self;
        let frustum = view.as_ref().map(|v| v.frustum());
        let blending_period = options.effective_blending_period();
        let policy = options.range_policy();

        for (&id, surface) in surfaces.iter_mut() {
            let transform = surface.transform;
            let Some(lod) = surface.lod.as_mut() else {
                continue;
            };

            // Required level from projected error; culled surfaces keep theirs.
            let visible = match (view.as_ref(), frustum.as_ref()) {
                (Some(view), Some(frustum)) => {
                    let sphere = lod.bounds.transformed(&transform);
                    match selector.required_lod(view, frustum, &sphere, &lod.level_errors) {
                        Some(required) => {
                            lod.state.set_required(required);
                            true
                        }
                        None => false,
                    }
                }
                _ => true,
            };
            if visible {
                stats.visible += 1;
            } else {
                stats.culled += 1;
            }

            if visible && lod.state.needs_fetch(time) {
                let available = lod.state.available();
                let required = lod.state.required();
                let decision = policy.decide_range(available, required);
                let outcome = resolve_range(available, required, &decision, &lod.block_lengths)
                    .map_err(StreamingError::from)
                    .and_then(|range| extension.request(id, range, time));

                match outcome {
                    Ok(RequestOutcome::Issued { range, .. }) => {
                        debug!(
                            "{id}: requested {range} (available {available:?}, required {required})"
                        );
                        lod.state.on_request_issued(range);
                        stats.requests_issued += 1;
                    }
                    Ok(RequestOutcome::Deferred) => stats.requests_deferred += 1,
                    Ok(RequestOutcome::Duplicate) => {
                        // Adopt the in-flight request that covers the gap so
                        // it is not planned again every tick.
                        let covering = extension.outstanding(id).and_then(|outstanding| {
                            outstanding
                                .iter()
                                .find(|o| available.is_none_or(|a| o.contains(a.saturating_add(1))))
                                .or_else(|| outstanding.first())
                                .copied()
                        });
                        if let Some(range) = covering {
                            trace!("{id}: gap already covered by {range}");
                            lod.state.on_request_issued(range);
                        }
                        stats.requests_duplicate += 1;
                    }
                    Err(StreamingError::Policy(error)) => {
                        reject(id, &mut lod.state, error, notify_tx);
                        stats.policy_rejections += 1;
                    }
                    Err(error) => warn!("{id}: request failed: {error}"),
                }
            }

            let displayed_before = lod.state.displayed();
            match lod.state.update_display(time, blending_period) {
                DisplayChange::None => {}
                DisplayChange::BlendStarted(to) => {
                    // Cumulative levels: the finer of the two covers both.
                    let draw = displayed_before.map_or(to, |d| d.max(to));
                    extension.set_display_lod(id, draw);
                }
                DisplayChange::Swapped(lod_level) => {
                    extension.set_display_lod(id, lod_level);
                    let _ = notify_tx.send(StreamNotification::LodDisplayed {
                        stream: id,
                        lod: lod_level,
                    });
                    stats.display_changes += 1;
                }
            }

            if let Some(lod_level) = lod.state.advance_blend(delta_time) {
                extension.set_display_lod(id, lod_level);
                let _ = notify_tx.send(StreamNotification::LodDisplayed {
                    stream: id,
                    lod: lod_level,
                });
                stats.display_changes += 1;
            }
            if lod.state.blend().is_some() {
                stats.blends_active += 1;
            }
        }

        extension.dispatch();

        stats.streams = surfaces.len();
        stats.outstanding_fetches = extension.outstanding_fetches();
        stats.active_decodes = extension.active_decodes();
        stats.peak_decodes = extension.peak_decodes();
        self.stats = stats;
    }

    fn handle_event(&mut self, event: ExtensionEvent, time: f64, stats: &mut TickStats) {
        match event {
            ExtensionEvent::HeaderReady { stream, finest_lod } => {
                let Some(header) = self.extension.header(stream) else {
                    return;
                };
                let lod = StreamLod {
                    state: LodState::new(finest_lod),
                    bounds: header.bounds,
                    level_errors: header.level_errors(),
                    block_lengths: header.block_lengths(),
                };
                if let Some(surface) = self.surfaces.get_mut(&stream) {
                    surface.lod = Some(lod);
                    surface.header_failures = 0;
                    self.notify(StreamNotification::HeaderLoaded { stream, finest_lod });
                }
            }
            ExtensionEvent::LodApplied { stream, lod } => {
                if let Some(state) = self.state_mut(stream) {
                    state.on_lod_applied(lod);
                    stats.lods_applied += 1;
                }
            }
            ExtensionEvent::RequestCompleted { stream, range } => {
                if let Some(state) = self.state_mut(stream) {
                    state.on_request_completed(range);
                }
            }
            ExtensionEvent::FetchFailed {
                stream,
                range,
                error,
            } => {
                let base_delay = self.options.fetch_retry_delay();
                let Some(surface) = self.surfaces.get_mut(&stream) else {
                    return;
                };
                match &mut surface.lod {
                    Some(lod) => lod.state.on_fetch_failed(time, base_delay),
                    None => {
                        let shift = surface.header_failures.min(MAX_HEADER_BACKOFF_SHIFT);
                        surface.header_failures += 1;
                        surface.header_retry_at =
                            Some(time + f64::from(base_delay) * f64::from(1u32 << shift));
                    }
                }
                self.notify(StreamNotification::FetchFailed {
                    stream,
                    range,
                    error,
                });
            }
            ExtensionEvent::DecodeFailed {
                stream,
                range,
                error,
            } => {
                let Some(surface) = self.surfaces.get_mut(&stream) else {
                    return;
                };
                match &mut surface.lod {
                    Some(lod) => lod.state.freeze(),
                    None => surface.header_frozen = true,
                }
                warn!("{stream}: frozen after decode error");
                self.notify(StreamNotification::DecodeFailed {
                    stream,
                    range,
                    error,
                });
            }
        }
    }

    /// Re-queue header loads whose backoff has elapsed.
    fn retry_headers(&mut self, time: f64) {
        let due: Vec<StreamId> = self
            .surfaces
            .iter_mut()
            .filter(|(_, s)| s.lod.is_none() && !s.header_frozen)
            .filter_map(|(&id, s)| match s.header_retry_at {
                Some(at) if at <= time => {
                    s.header_retry_at = None;
                    Some(id)
                }
                _ => None,
            })
            .collect();
        for id in due {
            if let Err(e) = self.extension.requeue_header(id, time) {
                warn!("{id}: failed to re-queue header: {e}");
            }
        }
    }

    fn state_mut(&mut self, id: StreamId) -> Option<&mut LodState> {
        self.surfaces
            .get_mut(&id)?
            .lod
            .as_mut()
            .map(|l| &mut l.state)
    }

    fn notify(&self, notification: StreamNotification) {
        let _ = self.notify_tx.send(notification);
    }
}

fn reject(
    id: StreamId,
    state: &mut LodState,
    error: PolicyError,
    notify_tx: &Sender<StreamNotification>,
) {
    warn!("{id}: range policy rejected: {error}");
    state.on_policy_rejected();
    let _ = notify_tx.send(StreamNotification::PolicyRejected { stream: id, error });
}
