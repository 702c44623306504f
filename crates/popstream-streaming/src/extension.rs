//! Glue between the loader, the parser pool and the per-stream geometry.
//!
//! The extension owns every open stream. It issues byte-range fetches,
//! routes fetched bytes to the [`ParserPool`], and applies decoded deltas in
//! strict level order. It never decides *what* to fetch; that is the
//! scheduler's job.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use popstream_lod::LodRange;
use popstream_parser::{
    DecodeError, GeometryDelta, ParseJob, ParseKind, ParseResult, ParsedPayload, ParserPool,
    PopDecoder, StreamHeader, StreamId, Ticket,
};
use tracing::{debug, trace, warn};

use crate::error::{FetchError, StreamingError};
use crate::geometry::PopGeometry;
use crate::loader::{LoadEvent, LoadHandle, LoadOptions, LoadSink, Loader};
use crate::options::StreamingOptions;

/// Result of [`StreamingExtension::request`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The fetch was queued on the loader.
    Issued { range: LodRange, handle: LoadHandle },
    /// Too many fetches are outstanding; ask again on a later tick.
    Deferred,
    /// The range overlaps data that is already fetched or in flight.
    Duplicate,
}

/// Something that happened to a stream during [`StreamingExtension::poll`].
#[derive(Clone, Debug, PartialEq)]
pub enum ExtensionEvent {
    /// The header arrived; LOD requests may be issued.
    HeaderReady { stream: StreamId, finest_lod: u8 },
    /// A level was appended to the stream's geometry.
    LodApplied { stream: StreamId, lod: u8 },
    /// Every level of a request has been applied.
    RequestCompleted { stream: StreamId, range: LodRange },
    /// A fetch failed. `range` is `None` for the header load.
    FetchFailed {
        stream: StreamId,
        range: Option<LodRange>,
        error: FetchError,
    },
    /// Decoding failed. `range` is `None` for the header.
    DecodeFailed {
        stream: StreamId,
        range: Option<LodRange>,
        error: DecodeError,
    },
}

/// What a fetch or decode job carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Header,
    Levels(LodRange),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Header => f.write_str("header"),
            Target::Levels(range) => write!(f, "levels {range}"),
        }
    }
}

impl Target {
    fn range(self) -> Option<LodRange> {
        match self {
            Target::Header => None,
            Target::Levels(range) => Some(range),
        }
    }
}

/// A fetch queued on the loader and not answered yet.
#[derive(Clone, Debug)]
struct PendingFetch {
    stream: StreamId,
    target: Target,
    bytes: Range<u64>,
    issued_at: f64,
}

struct StreamEntry {
    resource: String,
    header: Option<Arc<StreamHeader>>,
    geometry: PopGeometry,
    /// Ranges whose levels have all been applied.
    fetched: Vec<LodRange>,
    /// Ranges being fetched, decoded or waiting in the reorder buffer.
    outstanding: Vec<LodRange>,
    /// Decoded deltas waiting for their predecessors.
    reorder: BTreeMap<u8, GeometryDelta>,
}

impl StreamEntry {
    fn new(resource: String) -> Self {
        Self {
            resource,
            header: None,
            geometry: PopGeometry::new(),
            fetched: Vec::new(),
            outstanding: Vec::new(),
            reorder: BTreeMap::new(),
        }
    }
}

/// Streams POP geometry through a [`Loader`] and a [`ParserPool`].
pub struct StreamingExtension {
    options: Arc<StreamingOptions>,
    loader: Arc<dyn Loader>,
    decoder: Arc<dyn PopDecoder>,
    pool: ParserPool,
    streams: HashMap<StreamId, StreamEntry>,
    fetches: HashMap<LoadHandle, PendingFetch>,
    decoding: HashMap<Ticket, (StreamId, Target)>,
    load_sender: Sender<LoadEvent>,
    load_receiver: Receiver<LoadEvent>,
    next_stream: u64,
    next_handle: u64,
    next_ticket: u64,
    /// Loads were queued since the last [`dispatch`](Self::dispatch).
    loads_queued: bool,
}

impl StreamingExtension {
    /// Start the parser pool and wire it to `loader`.
    pub fn new(
        options: Arc<StreamingOptions>,
        loader: Arc<dyn Loader>,
        decoder: Arc<dyn PopDecoder>,
    ) -> Result<Self, StreamingError> {
        let pool = ParserPool::new(options.max_active_parsers(), Arc::clone(&decoder))
            .map_err(StreamingError::PoolStart)?;
        let (load_sender, load_receiver) = crossbeam_channel::unbounded();
        debug!(
            "Streaming extension started with {} parsers",
            pool.capacity()
        );
        Ok(Self {
            options,
            loader,
            decoder,
            pool,
            streams: HashMap::new(),
            fetches: HashMap::new(),
            decoding: HashMap::new(),
            load_sender,
            load_receiver,
            next_stream: 1,
            next_handle: 1,
            next_ticket: 1,
            loads_queued: false,
        })
    }

    pub fn options(&self) -> &Arc<StreamingOptions> {
        &self.options
    }

    /// Open a stream and queue its header-only load.
    pub fn open_stream(&mut self, resource: impl Into<String>, now: f64) -> StreamId {
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        let resource = resource.into();
        debug!("Opening {id} for '{resource}'");
        self.streams.insert(id, StreamEntry::new(resource));
        self.queue_fetch(id, Target::Header, 0..self.decoder.header_length(), now);
        id
    }

    /// Close a stream. In-flight work for it is cancelled or discarded.
    pub fn close_stream(&mut self, id: StreamId) -> bool {
        if self.streams.remove(&id).is_none() {
            return false;
        }
        self.fetches.retain(|_, fetch| fetch.stream != id);
        self.decoding.retain(|_, (stream, _)| *stream != id);
        let cancelled = self.pool.cancel_stream(id);
        debug!("Closed {id}, cancelled {cancelled} decode jobs");
        true
    }

    /// Queue the header load again, after a failed fetch or decode.
    pub fn requeue_header(&mut self, id: StreamId, now: f64) -> Result<(), StreamingError> {
        let entry = self
            .streams
            .get(&id)
            .ok_or(StreamingError::UnknownStream(id))?;
        let header_in_flight = self
            .fetches
            .values()
            .any(|f| f.stream == id && f.target == Target::Header)
            || self
                .decoding
                .values()
                .any(|(s, t)| *s == id && *t == Target::Header);
        if entry.header.is_none() && !header_in_flight {
            self.queue_fetch(id, Target::Header, 0..self.decoder.header_length(), now);
        }
        Ok(())
    }

    /// Request the levels of `range` for `id`.
    pub fn request(
        &mut self,
        id: StreamId,
        range: LodRange,
        now: f64,
    ) -> Result<RequestOutcome, StreamingError> {
        let entry = self
            .streams
            .get(&id)
            .ok_or(StreamingError::UnknownStream(id))?;
        let header = entry
            .header
            .as_ref()
            .ok_or(StreamingError::HeaderPending(id))?;
        let bytes = header.byte_range(range)?;

        let applied = entry.geometry.applied_lod();
        if applied.is_some_and(|a| range.max <= a)
            || entry.outstanding.iter().any(|o| o.overlaps(&range))
        {
            trace!("{id}: range {range} already fetched or in flight");
            return Ok(RequestOutcome::Duplicate);
        }
        if self.outstanding_fetches() >= self.options.max_active_parsers() {
            return Ok(RequestOutcome::Deferred);
        }

        if let Some(entry) = self.streams.get_mut(&id) {
            entry.outstanding.push(range);
        }
        let handle = self.queue_fetch(id, Target::Levels(range), bytes, now);
        Ok(RequestOutcome::Issued { range, handle })
    }

    /// Hand everything queued since the last call to the loader.
    pub fn dispatch(&mut self) {
        if std::mem::take(&mut self.loads_queued) {
            self.loader.load();
        }
    }

    /// Collect loader completions and decode results. Call once per tick,
    /// before planning new requests.
    pub fn poll(&mut self, now: f64) -> Vec<ExtensionEvent> {
        let mut events = Vec::new();

        let loads: Vec<LoadEvent> = self.load_receiver.try_iter().collect();
        for event in loads {
            self.handle_load_event(event, &mut events);
        }
        self.reissue_timed_out(now);

        for result in self.pool.drain_results() {
            self.handle_parse_result(result, &mut events);
        }
        events
    }

    /// Select the level drawn for `id`.
    pub fn set_display_lod(&mut self, id: StreamId, lod: u8) {
        if let Some(entry) = self.streams.get_mut(&id) {
            entry.geometry.set_active_lod(lod);
        }
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.keys().copied()
    }

    pub fn resource(&self, id: StreamId) -> Option<&str> {
        self.streams.get(&id).map(|e| e.resource.as_str())
    }

    pub fn header(&self, id: StreamId) -> Option<&StreamHeader> {
        self.streams.get(&id)?.header.as_deref()
    }

    pub fn geometry(&self, id: StreamId) -> Option<&PopGeometry> {
        self.streams.get(&id).map(|e| &e.geometry)
    }

    /// Ranges of `id` whose levels have all been applied, in completion order.
    pub fn fetched_ranges(&self, id: StreamId) -> Option<&[LodRange]> {
        self.streams.get(&id).map(|e| e.fetched.as_slice())
    }

    /// Ranges of `id` requested but not yet applied.
    pub fn outstanding(&self, id: StreamId) -> Option<&[LodRange]> {
        self.streams.get(&id).map(|e| e.outstanding.as_slice())
    }

    /// LOD requests not yet applied, across all streams.
    pub fn outstanding_fetches(&self) -> usize {
        self.streams.values().map(|e| e.outstanding.len()).sum()
    }

    /// Loads queued on the loader and not answered yet.
    pub fn in_flight_loads(&self) -> usize {
        self.fetches.len()
    }

    pub fn active_decodes(&self) -> usize {
        self.pool.active_count()
    }

    pub fn queued_decodes(&self) -> usize {
        self.pool.queued_count()
    }

    pub fn peak_decodes(&self) -> usize {
        self.pool.peak_active()
    }

    pub fn parser_capacity(&self) -> usize {
        self.pool.capacity()
    }

    fn queue_fetch(
        &mut self,
        stream: StreamId,
        target: Target,
        bytes: Range<u64>,
        now: f64,
    ) -> LoadHandle {
        let handle = LoadHandle(self.next_handle);
        self.next_handle += 1;

        let Some(entry) = self.streams.get(&stream) else {
            return handle;
        };
        let options = LoadOptions::new()
            .seek_offset(bytes.start)
            .seeked_length(bytes.end.saturating_sub(bytes.start));
        debug!(
            "{stream}: fetching {target} bytes {}..{} (handle {})",
            bytes.start, bytes.end, handle.0
        );
        self.loader.queue(
            handle,
            &entry.resource,
            options,
            LoadSink::new(self.load_sender.clone()),
        );
        self.fetches.insert(
            handle,
            PendingFetch {
                stream,
                target,
                bytes,
                issued_at: now,
            },
        );
        self.loads_queued = true;
        handle
    }

    fn handle_load_event(&mut self, event: LoadEvent, events: &mut Vec<ExtensionEvent>) {
        let (handle, outcome) = match event {
            LoadEvent::Complete { handle, bytes } => (handle, Ok(bytes)),
            LoadEvent::Failed { handle, error } => (handle, Err(error)),
        };
        // Unknown handles belong to closed streams or superseded fetches.
        let Some(fetch) = self.fetches.remove(&handle) else {
            trace!("Ignoring completion of stale handle {}", handle.0);
            return;
        };
        if !self.streams.contains_key(&fetch.stream) {
            return;
        }

        let expected = fetch.bytes.end.saturating_sub(fetch.bytes.start);
        let outcome = outcome.and_then(|bytes| {
            if bytes.len() as u64 == expected {
                Ok(bytes)
            } else {
                Err(FetchError::ShortRead {
                    expected,
                    actual: bytes.len() as u64,
                })
            }
        });

        match outcome {
            Ok(bytes) => self.submit_decode(fetch.stream, fetch.target, bytes, events),
            Err(error) => {
                warn!("{}: fetch of {} failed: {error}", fetch.stream, fetch.target);
                self.forget_outstanding(fetch.stream, fetch.target);
                events.push(ExtensionEvent::FetchFailed {
                    stream: fetch.stream,
                    range: fetch.target.range(),
                    error,
                });
            }
        }
    }

    fn submit_decode(
        &mut self,
        stream: StreamId,
        target: Target,
        bytes: Vec<u8>,
        events: &mut Vec<ExtensionEvent>,
    ) {
        let kind = match target {
            Target::Header => ParseKind::Header,
            Target::Levels(range) => {
                let Some(header) = self.streams.get(&stream).and_then(|e| e.header.clone()) else {
                    return;
                };
                ParseKind::Levels { header, range }
            }
        };
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        let job = ParseJob {
            ticket,
            stream,
            kind,
            bytes,
        };
        match self.pool.submit(job) {
            Ok(()) => {
                self.decoding.insert(ticket, (stream, target));
            }
            Err(_) => {
                warn!("{stream}: parser pool is shut down, dropping {target}");
                self.forget_outstanding(stream, target);
                events.push(ExtensionEvent::FetchFailed {
                    stream,
                    range: target.range(),
                    error: FetchError::Io("parser pool is shut down".into()),
                });
            }
        }
    }

    /// Re-issue fetches older than the configured timeout with the same
    /// range. Completions of the replaced handles are ignored.
    fn reissue_timed_out(&mut self, now: f64) {
        let Some(timeout) = self.options.fetch_timeout() else {
            return;
        };
        let expired: Vec<LoadHandle> = self
            .fetches
            .iter()
            .filter(|(_, f)| now - f.issued_at >= f64::from(timeout))
            .map(|(handle, _)| *handle)
            .collect();

        for handle in expired {
            let Some(fetch) = self.fetches.remove(&handle) else {
                continue;
            };
            debug!(
                "{}: fetch {} of {} timed out, re-issuing",
                fetch.stream, handle.0, fetch.target
            );
            self.queue_fetch(fetch.stream, fetch.target, fetch.bytes, now);
        }
    }

    fn handle_parse_result(&mut self, result: ParseResult, events: &mut Vec<ExtensionEvent>) {
        let Some((stream, target)) = self.decoding.remove(&result.ticket) else {
            return;
        };
        if !self.streams.contains_key(&stream) {
            return;
        }
        trace!("{stream}: decoded {target} in {} us", result.decode_time_us);

        let outcome = result.outcome.and_then(|payload| match (target, payload) {
            (Target::Header, ParsedPayload::Header(header)) => Ok(Payload::Header(header)),
            (Target::Levels(range), ParsedPayload::Levels(deltas)) => {
                check_levels(range, &deltas).map(|()| Payload::Levels(deltas))
            }
            _ => Err(DecodeError::Inconsistent {
                lod: target.range().map_or(0, |r| r.min),
                reason: "decoder returned the wrong payload kind".into(),
            }),
        });

        match outcome {
            Ok(Payload::Header(header)) => {
                let finest_lod = header.finest_lod();
                if let Some(entry) = self.streams.get_mut(&stream) {
                    entry.header = Some(Arc::new(header));
                }
                debug!("{stream}: header ready, finest level {finest_lod}");
                events.push(ExtensionEvent::HeaderReady { stream, finest_lod });
            }
            Ok(Payload::Levels(deltas)) => self.apply_levels(stream, deltas, events),
            Err(error) => self.fail_decode(stream, target, error, events),
        }
    }

    /// Buffer `deltas` and apply every level that is now contiguous.
    fn apply_levels(
        &mut self,
        stream: StreamId,
        deltas: Vec<GeometryDelta>,
        events: &mut Vec<ExtensionEvent>,
    ) {
        let Some(entry) = self.streams.get_mut(&stream) else {
            return;
        };
        for delta in deltas {
            if delta.lod >= entry.geometry.next_lod() {
                entry.reorder.insert(delta.lod, delta);
            }
        }

        let mut failure = None;
        while let Some(delta) = entry.reorder.remove(&entry.geometry.next_lod()) {
            match entry.geometry.apply(delta) {
                Ok(lod) => events.push(ExtensionEvent::LodApplied { stream, lod }),
                Err(e) => {
                    let lod = entry.geometry.next_lod();
                    let range = entry
                        .outstanding
                        .iter()
                        .find(|range| range.contains(lod))
                        .copied()
                        .unwrap_or(LodRange::single(lod));
                    let error = DecodeError::Inconsistent {
                        lod,
                        reason: e.to_string(),
                    };
                    failure = Some((range, error));
                    break;
                }
            }
        }

        if let Some(applied) = entry.geometry.applied_lod() {
            let (done, waiting): (Vec<LodRange>, Vec<LodRange>) =
                std::mem::take(&mut entry.outstanding)
                    .into_iter()
                    .partition(|range| range.max <= applied);
            entry.outstanding = waiting;
            for range in done {
                entry.fetched.push(range);
                events.push(ExtensionEvent::RequestCompleted { stream, range });
            }
        }

        if let Some((range, error)) = failure {
            self.fail_decode(stream, Target::Levels(range), error, events);
        }
    }

    /// Drop everything in flight for `stream`; it stays at its last good level.
    fn fail_decode(
        &mut self,
        stream: StreamId,
        target: Target,
        error: DecodeError,
        events: &mut Vec<ExtensionEvent>,
    ) {
        warn!("{stream}: decoding {target} failed: {error}");
        self.fetches.retain(|_, f| f.stream != stream);
        self.decoding.retain(|_, (s, _)| *s != stream);
        self.pool.cancel_stream(stream);
        if let Some(entry) = self.streams.get_mut(&stream) {
            entry.outstanding.clear();
            entry.reorder.clear();
        }
        events.push(ExtensionEvent::DecodeFailed {
            stream,
            range: target.range(),
            error,
        });
    }

    fn forget_outstanding(&mut self, stream: StreamId, target: Target) {
        if let (Target::Levels(range), Some(entry)) = (target, self.streams.get_mut(&stream)) {
            entry.outstanding.retain(|r| *r != range);
        }
    }
}

enum Payload {
    Header(StreamHeader),
    Levels(Vec<GeometryDelta>),
}

/// Decoded deltas must cover `range` exactly, one per level.
fn check_levels(range: LodRange, deltas: &[GeometryDelta]) -> Result<(), DecodeError> {
    let covers = deltas.len() == range.level_count()
        && deltas.iter().zip(range.iter()).all(|(d, lod)| d.lod == lod);
    if covers {
        Ok(())
    } else {
        Err(DecodeError::Inconsistent {
            lod: range.min,
            reason: format!("decoded {} deltas for range {range}", deltas.len()),
        })
    }
}
