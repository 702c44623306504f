//! Streaming of progressively refinable (POP) geometry.
//!
//! [`MasterLodScheduler`] decides per frame which detail levels each surface
//! needs. [`StreamingExtension`] fetches them through a [`Loader`], decodes
//! them on a bounded parser pool and publishes the result as [`PopGeometry`].

mod error;
mod extension;
mod geometry;
mod loader;
mod notification;
mod options;
mod scheduler;

pub use error::{FetchError, OptionsError, StreamingError};
pub use extension::{ExtensionEvent, RequestOutcome, StreamingExtension};
pub use geometry::{ApplyError, PopGeometry};
pub use loader::{LoadEvent, LoadHandle, LoadOptions, LoadRecord, LoadSink, Loader, MemoryLoader};
pub use notification::StreamNotification;
pub use options::{StreamingOptions, StreamingOptionsBuilder};
pub use scheduler::{DisplayState, MasterLodScheduler, StreamStatus, TickStats};
