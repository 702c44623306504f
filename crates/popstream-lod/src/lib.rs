//! Level-of-detail logic for POP geometry streaming: range policies, blend
//! transitions, per-stream LOD state, and screen-space error selection.

mod error_metric;
mod range;
mod state;
mod transition;
mod view;

pub use error_metric::{ErrorToleranceSelector, distance_to_sphere, pop_level_error};
pub use range::{
    BoundedGapPolicy, LodRange, LodRangePolicy, PolicyError, RangeDecision, RangeLimits,
    SingleLodPolicy, WholeGapPolicy, resolve_range,
};
pub use state::{DisplayChange, LodState};
pub use transition::{BlendState, smooth_step};
pub use view::{BoundingSphere, Frustum, ViewParams};
