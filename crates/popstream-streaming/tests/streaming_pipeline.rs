//! End-to-end tests of the scheduler, extension, loader and parser pool.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec3};
use popstream_lod::{BoundedGapPolicy, LodRange, ViewParams};
use popstream_parser::synthetic::{
    SyntheticDecoder, SyntheticMesh, corrupt_level, overwrite_level_offset,
};
use popstream_parser::{DecodeError, GeometryDelta, PopDecoder, StreamHeader};
use popstream_streaming::{
    ExtensionEvent, FetchError, LoadHandle, MasterLodScheduler, MemoryLoader, RequestOutcome,
    StreamNotification, StreamStatus, StreamingExtension, StreamingOptions,
};

const FRAME: f32 = 16.0;

fn view_from(distance: f32) -> ViewParams {
    ViewParams::perspective(0.8, 1280.0, 720.0, 0.1, 10_000.0).looking_at(
        Vec3::new(0.0, 0.0, distance),
        Vec3::ZERO,
        Vec3::Y,
    )
}

fn mesh_loader(levels: u8, manual: bool) -> Arc<MemoryLoader> {
    let loader = if manual { MemoryLoader::manual() } else { MemoryLoader::new() };
    loader.insert("sphere", SyntheticMesh::sphere(levels, 1.0).encode());
    Arc::new(loader)
}

fn scheduler(options: StreamingOptions, loader: Arc<MemoryLoader>) -> MasterLodScheduler {
    MasterLodScheduler::create(options, loader, Arc::new(SyntheticDecoder)).unwrap()
}

/// Simulated frame clock; sleeps a little per frame so workers can run.
struct Clock {
    time: f64,
    started: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            time: 0.0,
            started: Instant::now(),
        }
    }

    fn tick(&mut self, scheduler: &mut MasterLodScheduler) {
        assert!(
            self.started.elapsed() < Duration::from_secs(20),
            "test timed out at t={} ms",
            self.time
        );
        self.time += f64::from(FRAME);
        scheduler.tick(self.time, FRAME);
        thread::sleep(Duration::from_millis(1));
    }

    fn run_until(
        &mut self,
        scheduler: &mut MasterLodScheduler,
        mut pred: impl FnMut(&MasterLodScheduler) -> bool,
    ) {
        while !pred(scheduler) {
            self.tick(scheduler);
        }
    }
}

/// While the camera approaches, the displayed level never goes down and
/// blend progress stays within [0, 1], never decreasing within one blend.
#[test]
fn test_displayed_lod_is_monotonic_on_approach() {
    let options = StreamingOptions::builder()
        .error_tolerance_threshold(1.0)
        .lod_blending_period(100.0)
        .build()
        .unwrap();
    let mut scheduler = scheduler(options, mesh_loader(6, false));
    let id = scheduler.add_surface("sphere", Mat4::IDENTITY);
    let mut clock = Clock::new();

    let mut distance = 2000.0f32;
    let mut last_lod = None;
    let mut last_blend: Option<(f64, f32)> = None;

    while scheduler.display_state(id).and_then(|d| d.lod) != Some(5) {
        scheduler.set_view(view_from(distance));
        clock.tick(&mut scheduler);
        distance = (distance * 0.97).max(2.0);

        let Some(display) = scheduler.display_state(id) else {
            continue;
        };
        assert!(display.lod >= last_lod, "{last_lod:?} -> {:?}", display.lod);
        last_lod = display.lod;

        if let Some(blend) = display.blend {
            let progress = blend.progress();
            assert!((0.0..=1.0).contains(&progress));
            if let Some((start, previous)) = last_blend
                && start == blend.start_time()
            {
                assert!(progress >= previous, "blend went backwards");
            }
            last_blend = Some((blend.start_time(), progress));
        }
    }
}

/// Concurrent decodes and outstanding fetches never exceed the parser count.
#[test]
fn test_decodes_bounded_by_parser_count() {
    let loader = Arc::new(MemoryLoader::new());
    for i in 0..12 {
        loader.insert(format!("mesh-{i}"), SyntheticMesh::sphere(5, 1.0).encode());
    }
    let options = StreamingOptions::builder()
        .error_tolerance_threshold(0.0)
        .max_active_parsers(2)
        .build()
        .unwrap();
    let mut scheduler = scheduler(options, loader);
    let ids: Vec<_> = (0..12)
        .map(|i| {
            let transform = Mat4::from_translation(Vec3::new(i as f32 * 3.0 - 18.0, 0.0, 0.0));
            scheduler.add_surface(format!("mesh-{i}"), transform)
        })
        .collect();
    scheduler.set_view(view_from(60.0));
    let mut clock = Clock::new();

    let mut saw_deferred = false;
    while !ids
        .iter()
        .all(|&id| scheduler.stream_status(id) == Some(StreamStatus::Idle))
    {
        clock.tick(&mut scheduler);
        let stats = scheduler.stats();
        assert!(stats.outstanding_fetches <= 2, "{stats:?}");
        assert!(stats.active_decodes <= 2, "{stats:?}");
        saw_deferred |= stats.requests_deferred > 0;
    }
    assert!(scheduler.extension().peak_decodes() <= 2);
    assert!(saw_deferred, "12 streams on 2 parsers must defer some requests");
    assert!(ids.iter().all(|&id| scheduler.display_state(id).unwrap().lod == Some(4)));
}

/// With blending disabled the display always equals the best available level
/// right after the tick that applied it.
#[test]
fn test_swap_without_blending_is_atomic() {
    let options = StreamingOptions::builder()
        .error_tolerance_threshold(0.0)
        .lod_blending_enabled(false)
        .build()
        .unwrap();
    let mut scheduler = scheduler(options, mesh_loader(5, false));
    scheduler.set_view(view_from(4.0));
    let id = scheduler.add_surface("sphere", Mat4::IDENTITY);
    let mut clock = Clock::new();

    clock.run_until(&mut scheduler, |s| {
        if let Some(state) = s.lod_state(id) {
            assert!(state.blend().is_none());
            assert_eq!(state.displayed(), state.target());
        }
        s.stream_status(id) == Some(StreamStatus::Idle)
    });
    assert_eq!(scheduler.geometry(id).unwrap().active_lod(), Some(4));
}

fn poll_until(
    ext: &mut StreamingExtension,
    mut pred: impl FnMut(&[ExtensionEvent]) -> bool,
) -> Vec<ExtensionEvent> {
    let start = Instant::now();
    let mut events = Vec::new();
    loop {
        ext.dispatch();
        events.extend(ext.poll(0.0));
        if pred(&events) {
            return events;
        }
        assert!(start.elapsed() < Duration::from_secs(10), "timed out: {events:?}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn issued_handle(outcome: RequestOutcome) -> LoadHandle {
    match outcome {
        RequestOutcome::Issued { handle, .. } => handle,
        other => panic!("expected an issued request, got {other:?}"),
    }
}

/// Level 2 decoded before level 1 waits in the reorder buffer.
#[test]
fn test_out_of_order_levels_are_applied_in_order() {
    let loader = mesh_loader(4, true);
    let options = Arc::new(StreamingOptions::builder().max_active_parsers(4).build().unwrap());
    let mut ext =
        StreamingExtension::new(options, loader.clone(), Arc::new(SyntheticDecoder)).unwrap();

    let id = ext.open_stream("sphere", 0.0);
    ext.dispatch();
    loader.flush();
    poll_until(&mut ext, |e| !e.is_empty());

    ext.request(id, LodRange::single(0), 0.0).unwrap();
    ext.dispatch();
    loader.flush();
    poll_until(&mut ext, |e| {
        e.iter().any(|e| matches!(e, ExtensionEvent::RequestCompleted { .. }))
    });

    let first = issued_handle(ext.request(id, LodRange::single(1), 0.0).unwrap());
    let second = issued_handle(ext.request(id, LodRange::single(2), 0.0).unwrap());
    ext.dispatch();

    assert!(loader.release(second));
    let deadline = Instant::now() + Duration::from_millis(100);
    while Instant::now() < deadline {
        let events = ext.poll(0.0);
        assert!(events.is_empty(), "level 2 must wait for level 1: {events:?}");
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(ext.geometry(id).unwrap().applied_lod(), Some(0));

    assert!(loader.release(first));
    let events = poll_until(&mut ext, |e| {
        e.iter()
            .filter(|e| matches!(e, ExtensionEvent::RequestCompleted { .. }))
            .count()
            == 2
    });
    let applied: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ExtensionEvent::LodApplied { lod, .. } => Some(*lod),
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec![1, 2]);
    assert_eq!(ext.geometry(id).unwrap().applied_lod(), Some(2));
}

/// Decoder that takes its time, so a surface can be removed mid-decode.
struct SlowDecoder(Duration);

impl PopDecoder for SlowDecoder {
    fn header_length(&self) -> u64 {
        SyntheticDecoder.header_length()
    }

    fn parse_header(&self, bytes: &[u8]) -> Result<StreamHeader, DecodeError> {
        SyntheticDecoder.parse_header(bytes)
    }

    fn decode(
        &self,
        header: &StreamHeader,
        range: LodRange,
        bytes: &[u8],
    ) -> Result<Vec<GeometryDelta>, DecodeError> {
        thread::sleep(self.0);
        SyntheticDecoder.decode(header, range, bytes)
    }
}

/// Removing a surface while its fetch or decode is in flight is safe and
/// its late results are discarded.
#[test]
fn test_remove_surface_mid_fetch_and_mid_decode() {
    let loader = mesh_loader(5, true);
    let mut scheduler = MasterLodScheduler::create(
        StreamingOptions::builder()
            .error_tolerance_threshold(0.0)
            .build()
            .unwrap(),
        loader.clone(),
        Arc::new(SlowDecoder(Duration::from_millis(40))),
    )
    .unwrap();
    let notifications = scheduler.notifications();
    let mut clock = Clock::new();

    let fetching = scheduler.add_surface("sphere", Mat4::IDENTITY);
    let decoding = scheduler.add_surface("sphere", Mat4::IDENTITY);
    clock.tick(&mut scheduler);
    loader.flush();
    clock.run_until(&mut scheduler, |s| {
        s.lod_state(fetching).is_some_and(|l| l.pending().is_some())
            && s.lod_state(decoding).is_some_and(|l| l.pending().is_some())
    });

    // Release the decoding surface's level 0, then remove both surfaces.
    let handles = loader.pending();
    assert_eq!(handles.len(), 2);
    assert!(loader.release(handles[1]));
    clock.tick(&mut scheduler);
    assert!(scheduler.remove_surface(fetching));
    assert!(scheduler.remove_surface(decoding));
    loader.flush();
    let _ = notifications.try_iter().count();

    for _ in 0..10 {
        clock.tick(&mut scheduler);
        thread::sleep(Duration::from_millis(10));
    }
    assert!(notifications.try_iter().next().is_none());
    assert!(!scheduler.extension().contains(fetching));
    assert!(scheduler.geometry(decoding).is_none());
    assert_eq!(scheduler.surface_ids().count(), 0);
    assert_eq!(scheduler.extension().outstanding_fetches(), 0);
}

/// A corrupt level freezes only its own stream; `retry` resumes it.
#[test]
fn test_decode_error_is_isolated_and_retryable() {
    let mesh = SyntheticMesh::sphere(5, 1.0);
    let good = mesh.encode();
    let mut bad = good.clone();
    corrupt_level(&mut bad, &mesh.header(), 2);

    let loader = Arc::new(MemoryLoader::new());
    loader.insert("good", good.clone());
    loader.insert("bad", bad);
    let options = StreamingOptions::builder()
        .error_tolerance_threshold(0.0)
        .lod_blending_enabled(false)
        .build()
        .unwrap();
    let mut scheduler = scheduler(options, loader.clone());
    let notifications = scheduler.notifications();
    scheduler.set_view(view_from(5.0));
    let good_id = scheduler.add_surface("good", Mat4::IDENTITY);
    let bad_id = scheduler.add_surface("bad", Mat4::from_translation(Vec3::X));
    let mut clock = Clock::new();

    clock.run_until(&mut scheduler, |s| {
        s.stream_status(good_id) == Some(StreamStatus::Idle)
            && s.stream_status(bad_id) == Some(StreamStatus::Frozen)
    });
    assert_eq!(scheduler.display_state(good_id).unwrap().lod, Some(4));
    assert_eq!(scheduler.display_state(bad_id).unwrap().lod, Some(1));

    let failures: Vec<_> = notifications
        .try_iter()
        .filter(|n| n.is_error())
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        StreamNotification::DecodeFailed { stream, range: Some(range), .. }
            if *stream == bad_id && range.contains(2)
    ));

    // Frozen streams stay frozen across ticks.
    for _ in 0..5 {
        clock.tick(&mut scheduler);
    }
    assert_eq!(scheduler.stream_status(bad_id), Some(StreamStatus::Frozen));

    loader.insert("bad", good);
    scheduler.retry(bad_id).unwrap();
    clock.run_until(&mut scheduler, |s| {
        s.stream_status(bad_id) == Some(StreamStatus::Idle)
    });
    assert_eq!(scheduler.display_state(bad_id).unwrap().lod, Some(4));
}

/// A level table with impossible offsets freezes its stream at the header
/// stage instead of breaking the frame.
#[test]
fn test_corrupt_level_table_freezes_stream() {
    let good = SyntheticMesh::sphere(3, 1.0).encode();
    let mut bad = good.clone();
    overwrite_level_offset(&mut bad, 0, u64::MAX - 4);

    let loader = Arc::new(MemoryLoader::new());
    loader.insert("good", good);
    loader.insert("bad", bad);
    let options = StreamingOptions::builder()
        .error_tolerance_threshold(0.0)
        .lod_blending_enabled(false)
        .build()
        .unwrap();
    let mut scheduler = scheduler(options, loader);
    let notifications = scheduler.notifications();
    scheduler.set_view(view_from(5.0));
    let good_id = scheduler.add_surface("good", Mat4::IDENTITY);
    let bad_id = scheduler.add_surface("bad", Mat4::from_translation(Vec3::X));
    let mut clock = Clock::new();

    clock.run_until(&mut scheduler, |s| {
        s.stream_status(good_id) == Some(StreamStatus::Idle)
            && s.stream_status(bad_id) == Some(StreamStatus::Frozen)
    });
    assert_eq!(scheduler.display_state(good_id).unwrap().lod, Some(2));
    assert!(scheduler.lod_state(bad_id).is_none());
    assert!(scheduler.extension().header(bad_id).is_none());

    let failures: Vec<_> = notifications
        .try_iter()
        .filter(|n| n.is_error())
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        StreamNotification::DecodeFailed {
            stream,
            range: None,
            error: DecodeError::InvalidHeader(_),
        } if *stream == bad_id
    ));
}

/// Decoder that panics on level 1 of meshes wider than one unit.
struct PanickyDecoder;

impl PopDecoder for PanickyDecoder {
    fn header_length(&self) -> u64 {
        SyntheticDecoder.header_length()
    }

    fn parse_header(&self, bytes: &[u8]) -> Result<StreamHeader, DecodeError> {
        SyntheticDecoder.parse_header(bytes)
    }

    fn decode(
        &self,
        header: &StreamHeader,
        range: LodRange,
        bytes: &[u8],
    ) -> Result<Vec<GeometryDelta>, DecodeError> {
        if header.bounds.radius > 1.5 && range.contains(1) {
            panic!("cannot decode level 1");
        }
        SyntheticDecoder.decode(header, range, bytes)
    }
}

/// With a single parser, a decoder panic on one stream freezes that stream
/// only; the parser keeps serving the others.
#[test]
fn test_decoder_panic_does_not_stall_other_streams() {
    let loader = Arc::new(MemoryLoader::new());
    loader.insert("wide", SyntheticMesh::sphere(4, 2.0).encode());
    loader.insert("narrow", SyntheticMesh::sphere(4, 1.0).encode());
    let mut scheduler = MasterLodScheduler::create(
        StreamingOptions::builder()
            .error_tolerance_threshold(0.0)
            .lod_blending_enabled(false)
            .max_active_parsers(1)
            .build()
            .unwrap(),
        loader,
        Arc::new(PanickyDecoder),
    )
    .unwrap();
    let notifications = scheduler.notifications();
    scheduler.set_view(view_from(8.0));
    let mut clock = Clock::new();

    let wide = scheduler.add_surface("wide", Mat4::IDENTITY);
    clock.run_until(&mut scheduler, |s| {
        s.stream_status(wide) == Some(StreamStatus::Frozen)
    });
    let narrow = scheduler.add_surface("narrow", Mat4::from_translation(Vec3::X));
    clock.run_until(&mut scheduler, |s| {
        s.stream_status(narrow) == Some(StreamStatus::Idle)
    });

    assert_eq!(scheduler.display_state(wide).unwrap().lod, Some(0));
    assert_eq!(scheduler.display_state(narrow).unwrap().lod, Some(3));
    assert_eq!(scheduler.extension().active_decodes(), 0);
    let failures: Vec<_> = notifications
        .try_iter()
        .filter(|n| n.is_error())
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        StreamNotification::DecodeFailed {
            stream,
            error: DecodeError::DecoderPanicked(_),
            ..
        } if *stream == wide
    ));
}

/// A fetch that never answers is re-issued with the same range; the late
/// answer of the first fetch is ignored.
#[test]
fn test_timed_out_fetch_is_reissued() {
    let loader = mesh_loader(3, true);
    let options = StreamingOptions::builder()
        .fetch_timeout(Some(100.0))
        .build()
        .unwrap();
    let mut scheduler = scheduler(options, loader.clone());
    let id = scheduler.add_surface("sphere", Mat4::IDENTITY);
    let mut clock = Clock::new();

    clock.tick(&mut scheduler);
    loader.flush();
    clock.run_until(&mut scheduler, |s| {
        s.lod_state(id).is_some_and(|l| l.pending().is_some())
    });
    let first = loader.pending();
    assert_eq!(first.len(), 1);

    // Let the request time out without answering it.
    clock.run_until(&mut scheduler, |_| loader.pending().len() == 2);
    let history = loader.history();
    let (original, reissued) = (&history[history.len() - 2], &history[history.len() - 1]);
    assert_eq!(original.options, reissued.options);
    assert_ne!(original.handle, reissued.handle);

    loader.flush();
    clock.run_until(&mut scheduler, |s| {
        s.display_state(id).and_then(|d| d.lod) == Some(0)
    });
    assert_eq!(scheduler.geometry(id).unwrap().applied_lod(), Some(0));
    assert_eq!(
        scheduler.extension().fetched_ranges(id).unwrap(),
        &[LodRange::single(0)]
    );
}

/// A failed fetch is retried after a backoff, not on the next tick.
#[test]
fn test_failed_fetch_retries_after_backoff() {
    let loader = mesh_loader(3, true);
    let options = StreamingOptions::builder()
        .fetch_retry_delay(200.0)
        .build()
        .unwrap();
    let mut scheduler = scheduler(options, loader.clone());
    let notifications = scheduler.notifications();
    let id = scheduler.add_surface("sphere", Mat4::IDENTITY);
    let mut clock = Clock::new();

    clock.tick(&mut scheduler);
    loader.flush();
    clock.run_until(&mut scheduler, |s| {
        s.lod_state(id).is_some_and(|l| l.pending().is_some())
    });
    let handle = loader.pending()[0];
    assert!(loader.fail(handle, FetchError::Io("connection reset".into())));

    clock.run_until(&mut scheduler, |s| {
        s.lod_state(id).is_some_and(|l| l.pending().is_none())
    });
    let failed_at = clock.time;
    assert!(notifications.try_iter().any(|n| matches!(
        n,
        StreamNotification::FetchFailed { range: Some(_), error: FetchError::Io(_), .. }
    )));

    clock.run_until(&mut scheduler, |_| !loader.pending().is_empty());
    assert!(clock.time - failed_at >= 200.0 - f64::from(FRAME));
    loader.flush();
    clock.run_until(&mut scheduler, |s| {
        s.display_state(id).and_then(|d| d.lod) == Some(0)
    });
}

/// A bounded-gap policy fetches several levels per request.
#[test]
fn test_bounded_gap_policy_batches_levels() {
    let options = StreamingOptions::builder()
        .error_tolerance_threshold(0.0)
        .lod_range_policy(BoundedGapPolicy { max_levels: 2 })
        .build()
        .unwrap();
    let mut scheduler = scheduler(options, mesh_loader(5, false));
    scheduler.set_view(view_from(4.0));
    let id = scheduler.add_surface("sphere", Mat4::IDENTITY);
    let mut clock = Clock::new();

    clock.run_until(&mut scheduler, |s| {
        s.stream_status(id) == Some(StreamStatus::Idle)
    });
    assert_eq!(
        scheduler.extension().fetched_ranges(id).unwrap(),
        &[
            LodRange { min: 0, max: 1 },
            LodRange { min: 2, max: 3 },
            LodRange::single(4),
        ]
    );
}
