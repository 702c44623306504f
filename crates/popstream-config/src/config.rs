//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use popstream_lod::{BoundedGapPolicy, SingleLodPolicy, WholeGapPolicy};
use popstream_streaming::StreamingOptions;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// LOD streaming settings.
    pub streaming: StreamingConfig,
    /// Camera and viewport settings.
    pub camera: CameraConfig,
    /// Demo scene settings.
    pub scene: SceneConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// How many levels a single fetch request may cover.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RangePolicyKind {
    /// One level per request.
    #[default]
    SingleLod,
    /// The whole gap, at most `max_levels` at once.
    BoundedGap { max_levels: u8 },
    /// The whole gap in one request.
    WholeGap,
}

/// Streaming settings, converted into `StreamingOptions` at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Tolerated screen-space error in pixels (0 = refine to the finest level).
    pub error_tolerance_threshold: f32,
    /// Blend between levels instead of swapping.
    pub lod_blending_enabled: bool,
    /// Duration of one LOD transition in milliseconds.
    pub lod_blending_period_ms: f32,
    /// Range policy used for every stream.
    pub range_policy: RangePolicyKind,
    /// Concurrent decodes (0 = one per core, at most 8).
    pub max_active_parsers: usize,
    /// Re-issue fetches unanswered after this many milliseconds.
    pub fetch_timeout_ms: Option<f32>,
    /// Base delay before retrying a failed fetch, doubled per failure.
    pub fetch_retry_delay_ms: f32,
}

/// Camera configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Vertical field of view in degrees.
    pub fov_y_degrees: f32,
    /// Viewport width in pixels.
    pub width: u32,
    /// Viewport height in pixels.
    pub height: u32,
    /// Near clip distance.
    pub z_near: f32,
    /// Far clip distance.
    pub z_far: f32,
}

/// Demo scene configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SceneConfig {
    /// Number of streamed objects.
    pub object_count: usize,
    /// POP levels per object.
    pub levels: u8,
    /// Half-width of the square the objects are scattered over.
    pub spread: f32,
    /// Seed for object placement.
    pub seed: u64,
    /// Frames to simulate before exiting.
    pub frames: u64,
    /// Fixed frame time in milliseconds.
    pub frame_time_ms: f32,
    /// Camera orbit radius at the start of the run.
    pub orbit_start_radius: f32,
    /// Camera orbit radius at the end of the run.
    pub orbit_end_radius: f32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Log a stats line every this many frames (0 = never).
    pub stats_interval_frames: u64,
}

// --- Default implementations ---

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            error_tolerance_threshold: 1.0,
            lod_blending_enabled: true,
            lod_blending_period_ms: 500.0,
            range_policy: RangePolicyKind::SingleLod,
            max_active_parsers: 0,
            fetch_timeout_ms: None,
            fetch_retry_delay_ms: 250.0,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y_degrees: 45.0,
            width: 1280,
            height: 720,
            z_near: 0.1,
            z_far: 5000.0,
        }
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            object_count: 64,
            levels: 8,
            spread: 60.0,
            seed: 42,
            frames: 900,
            frame_time_ms: 16.0,
            orbit_start_radius: 400.0,
            orbit_end_radius: 20.0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stats_interval_frames: 60,
        }
    }
}

impl StreamingConfig {
    /// Build validated streaming options from these settings.
    pub fn to_options(&self) -> Result<StreamingOptions, ConfigError> {
        let parsers = match self.max_active_parsers {
            0 => StreamingOptions::default_parser_count(),
            n => n,
        };
        let builder = StreamingOptions::builder()
            .error_tolerance_threshold(self.error_tolerance_threshold)
            .lod_blending_enabled(self.lod_blending_enabled)
            .lod_blending_period(self.lod_blending_period_ms)
            .max_active_parsers(parsers)
            .fetch_timeout(self.fetch_timeout_ms)
            .fetch_retry_delay(self.fetch_retry_delay_ms);
        let builder = match self.range_policy {
            RangePolicyKind::SingleLod => builder.lod_range_policy(SingleLodPolicy),
            RangePolicyKind::BoundedGap { max_levels } => {
                builder.lod_range_policy(BoundedGapPolicy { max_levels })
            }
            RangePolicyKind::WholeGap => builder.lod_range_policy(WholeGapPolicy),
        };
        Ok(builder.build()?)
    }
}

/// Default directory for `config.ron`: the platform config dir, or the
/// working directory when there is none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("popstream"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
