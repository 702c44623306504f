//! Configuration for POP geometry streaming.
//!
//! Settings persist to disk as RON files, can be overridden from the command
//! line via clap, and convert into the immutable `StreamingOptions` the
//! scheduler is built from.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, PolicyArg};
pub use config::{
    CameraConfig, Config, DebugConfig, RangePolicyKind, SceneConfig, StreamingConfig,
    default_config_dir,
};
pub use error::ConfigError;
