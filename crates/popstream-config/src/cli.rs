//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::Config;
use crate::config::RangePolicyKind;

/// Range policy selectable from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Single,
    Bounded,
    Whole,
}

/// POP streaming demo command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "popstream", about = "POP geometry streaming demo")]
pub struct CliArgs {
    /// Tolerated screen-space error in pixels (0 = finest level).
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Enable or disable LOD blending.
    #[arg(long)]
    pub blending: Option<bool>,

    /// LOD blending period in milliseconds.
    #[arg(long)]
    pub blend_period: Option<f32>,

    /// Maximum concurrent decodes.
    #[arg(long)]
    pub parsers: Option<usize>,

    /// Range policy.
    #[arg(long, value_enum)]
    pub policy: Option<PolicyArg>,

    /// Level cap per request for the bounded policy.
    #[arg(long)]
    pub max_levels: Option<u8>,

    /// Fetch timeout in milliseconds.
    #[arg(long)]
    pub fetch_timeout: Option<f32>,

    /// Number of streamed objects.
    #[arg(long)]
    pub objects: Option<usize>,

    /// Frames to simulate.
    #[arg(long)]
    pub frames: Option<u64>,

    /// Placement seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let streaming = &mut self.streaming;
        if let Some(t) = args.threshold {
            streaming.error_tolerance_threshold = t;
        }
        if let Some(b) = args.blending {
            streaming.lod_blending_enabled = b;
        }
        if let Some(p) = args.blend_period {
            streaming.lod_blending_period_ms = p;
        }
        if let Some(n) = args.parsers {
            streaming.max_active_parsers = n;
        }
        if let Some(policy) = args.policy {
            streaming.range_policy = match policy {
                PolicyArg::Single => RangePolicyKind::SingleLod,
                PolicyArg::Bounded => RangePolicyKind::BoundedGap {
                    max_levels: args.max_levels.unwrap_or(2),
                },
                PolicyArg::Whole => RangePolicyKind::WholeGap,
            };
        } else if let (Some(max_levels), RangePolicyKind::BoundedGap { .. }) =
            (args.max_levels, streaming.range_policy)
        {
            streaming.range_policy = RangePolicyKind::BoundedGap { max_levels };
        }
        if let Some(ms) = args.fetch_timeout {
            streaming.fetch_timeout_ms = Some(ms);
        }
        if let Some(n) = args.objects {
            self.scene.object_count = n;
        }
        if let Some(f) = args.frames {
            self.scene.frames = f;
        }
        if let Some(s) = args.seed {
            self.scene.seed = s;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            threshold: Some(0.0),
            parsers: Some(2),
            policy: Some(PolicyArg::Bounded),
            max_levels: Some(4),
            objects: Some(5),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.streaming.error_tolerance_threshold, 0.0);
        assert_eq!(config.streaming.max_active_parsers, 2);
        assert_eq!(
            config.streaming.range_policy,
            RangePolicyKind::BoundedGap { max_levels: 4 }
        );
        assert_eq!(config.scene.object_count, 5);
        // Non-overridden fields retain defaults
        assert!(config.streaming.lod_blending_enabled);
        assert_eq!(config.scene.seed, 42);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_from_command_line() {
        let args = CliArgs::parse_from([
            "popstream",
            "--blending",
            "false",
            "--policy",
            "whole",
            "--fetch-timeout",
            "750",
        ]);
        let mut config = Config::default();
        config.apply_cli_overrides(&args);
        assert!(!config.streaming.lod_blending_enabled);
        assert_eq!(config.streaming.range_policy, RangePolicyKind::WholeGap);
        assert_eq!(config.streaming.fetch_timeout_ms, Some(750.0));
    }
}
