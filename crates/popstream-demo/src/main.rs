//! Headless POP streaming demo.
//!
//! Scatters synthetic POP meshes over a plane, flies a camera towards them
//! and lets the scheduler stream in detail as they grow on screen.

mod frame_clock;
mod scene;

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::Parser;
use popstream_config::{CliArgs, Config, ConfigError, default_config_dir};
use popstream_parser::synthetic::SyntheticDecoder;
use popstream_streaming::{
    MasterLodScheduler, MemoryLoader, StreamNotification, StreamStatus, StreamingError,
};
use tracing::{debug, error, info, warn};

use frame_clock::FrameClock;
use scene::{DemoScene, OrbitCamera};

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Streaming(#[from] StreamingError),
}

fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    popstream_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    info!(
        "Starting POP streaming demo: {} objects, {} levels, {} frames",
        config.scene.object_count, config.scene.levels, config.scene.frames
    );

    if let Err(e) = run(&config) {
        error!("Demo failed: {e}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<(), DemoError> {
    let options = config.streaming.to_options()?;
    info!(
        "Streaming options: threshold {}px, blending {:?}, {} parsers",
        options.error_tolerance_threshold(),
        options.effective_blending_period(),
        options.max_active_parsers()
    );

    let scene = DemoScene::generate(&config.scene);
    let loader = Arc::new(MemoryLoader::new());
    scene.publish(&loader);

    let mut scheduler = MasterLodScheduler::create(options, loader, Arc::new(SyntheticDecoder))?;
    for object in &scene.objects {
        scheduler.add_surface(object.resource.clone(), object.transform);
    }
    let notifications = scheduler.notifications();

    let camera = OrbitCamera::new(config.camera.clone(), &config.scene);
    let mut clock = FrameClock::new(config.scene.frame_time_ms);
    let frames = config.scene.frames.max(1);
    let stats_interval = config.debug.stats_interval_frames;
    let mut lod_changes = 0usize;
    let mut errors = 0usize;

    for _ in 0..frames {
        let frame = clock.wait_next();
        let progress = frame.index as f32 / (frames - 1).max(1) as f32;
        scheduler.set_view(camera.view_at(progress));
        scheduler.tick(frame.time, frame.delta);

        for notification in notifications.try_iter() {
            match &notification {
                StreamNotification::HeaderLoaded { stream, finest_lod } => {
                    debug!("{stream}: header loaded, finest level {finest_lod}");
                }
                StreamNotification::LodDisplayed { stream, lod } => {
                    lod_changes += 1;
                    debug!("{stream}: displaying level {lod}");
                }
                StreamNotification::PolicyRejected { stream, error } => {
                    errors += 1;
                    warn!("{stream}: range policy rejected: {error}");
                }
                StreamNotification::FetchFailed { stream, error, .. } => {
                    errors += 1;
                    warn!("{stream}: fetch failed: {error}");
                }
                StreamNotification::DecodeFailed { stream, range, error } => {
                    errors += 1;
                    warn!("{stream}: decode of {range:?} failed: {error}, retrying");
                    if let Err(e) = scheduler.retry(*stream) {
                        warn!("{stream}: retry failed: {e}");
                    }
                }
            }
        }

        if stats_interval > 0 && frame.index % stats_interval == 0 {
            let stats = scheduler.stats();
            info!(
                frame = frame.index,
                visible = stats.visible,
                culled = stats.culled,
                issued = stats.requests_issued,
                deferred = stats.requests_deferred,
                blending = stats.blends_active,
                fetches = stats.outstanding_fetches,
                decodes = stats.active_decodes,
                "Frame {} at {:.0}ms",
                frame.index,
                frame.time
            );
        }
    }

    summarize(&scheduler, lod_changes, errors, clock.clamped_frames());
    Ok(())
}

fn summarize(scheduler: &MasterLodScheduler, lod_changes: usize, errors: usize, clamped: u64) {
    let mut by_lod: BTreeMap<Option<u8>, usize> = BTreeMap::new();
    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    for id in scheduler.surface_ids() {
        let lod = scheduler.display_state(id).and_then(|state| state.lod);
        *by_lod.entry(lod).or_default() += 1;
        let status = match scheduler.stream_status(id) {
            Some(StreamStatus::LoadingHeader) => "loading header",
            Some(StreamStatus::Streaming) => "streaming",
            Some(StreamStatus::Idle) => "idle",
            Some(StreamStatus::Frozen) => "frozen",
            None => "unknown",
        };
        *by_status.entry(status).or_default() += 1;
    }

    let stats = scheduler.stats();
    info!(
        "Finished: {} level changes, {} errors, peak {} concurrent decodes, {} clamped frames",
        lod_changes, errors, stats.peak_decodes, clamped
    );
    for (lod, count) in by_lod {
        match lod {
            Some(lod) => info!("  level {lod}: {count} objects"),
            None => info!("  nothing displayed: {count} objects"),
        }
    }
    for (status, count) in by_status {
        info!("  {status}: {count}");
    }
}
