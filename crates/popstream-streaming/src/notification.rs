//! Notifications published by the scheduler for the application.

use popstream_lod::{LodRange, PolicyError};
use popstream_parser::{DecodeError, StreamId};

use crate::error::FetchError;

/// Something the application may want to react to. Delivered through the
/// receiver returned by `MasterLodScheduler::notifications`.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamNotification {
    /// The stream header arrived and LOD streaming started.
    HeaderLoaded { stream: StreamId, finest_lod: u8 },
    /// The displayed level changed (a blend completed or a swap happened).
    LodDisplayed { stream: StreamId, lod: u8 },
    /// The range policy produced an unusable range; the gap is skipped until
    /// the available or required level changes.
    PolicyRejected { stream: StreamId, error: PolicyError },
    /// A fetch failed and will be retried after a backoff.
    FetchFailed {
        stream: StreamId,
        range: Option<LodRange>,
        error: FetchError,
    },
    /// Decoding failed; the stream stays at its last good level until
    /// retried.
    DecodeFailed {
        stream: StreamId,
        range: Option<LodRange>,
        error: DecodeError,
    },
}

impl StreamNotification {
    pub fn stream(&self) -> StreamId {
        match self {
            Self::HeaderLoaded { stream, .. }
            | Self::LodDisplayed { stream, .. }
            | Self::PolicyRejected { stream, .. }
            | Self::FetchFailed { stream, .. }
            | Self::DecodeFailed { stream, .. } => *stream,
        }
    }

    /// Returns `true` for error notifications.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::PolicyRejected { .. } | Self::FetchFailed { .. } | Self::DecodeFailed { .. }
        )
    }
}
