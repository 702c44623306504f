//! LOD range policies: how many detail levels a single fetch request covers.
//!
//! A policy only states an intent (a number of levels plus size limits).
//! [`resolve_range`] turns that intent into a concrete, representable
//! [`LodRange`] for one stream.

use std::fmt;
use std::ops::RangeInclusive;

/// Errors produced while turning a policy decision into a fetchable range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The policy asked for zero or a negative number of levels.
    #[error("range policy returned a non-positive range ({levels} levels)")]
    NonPositiveRange {
        /// The value returned by the policy.
        levels: i32,
    },

    /// The policy's minimum level count exceeds its maximum.
    #[error("range limits are inverted (min {min} > max {max})")]
    InvertedLimits {
        /// Minimum levels per request.
        min: u8,
        /// Maximum levels per request.
        max: u8,
    },

    /// A range bound is not a level of the stream.
    #[error("range {min}..={max} is not representable (finest level is {finest})")]
    NotRepresentable {
        /// First requested level.
        min: u8,
        /// Last requested level.
        max: u8,
        /// Finest level the stream encodes.
        finest: u8,
    },

    /// Every level up to the required one is already available.
    #[error("nothing to fetch (available {available:?}, required {required})")]
    NothingToFetch {
        /// Highest level already available.
        available: Option<u8>,
        /// Level required by the current view.
        required: u8,
    },
}

/// An inclusive span of LOD levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LodRange {
    /// First level of the span.
    pub min: u8,
    /// Last level of the span (inclusive).
    pub max: u8,
}

impl LodRange {
    /// Create a range, rejecting `min > max`.
    pub fn new(min: u8, max: u8) -> Result<Self, PolicyError> {
        if min > max {
            return Err(PolicyError::NotRepresentable {
                min,
                max,
                finest: max,
            });
        }
        Ok(Self { min, max })
    }

    /// A range covering exactly one level.
    pub fn single(lod: u8) -> Self {
        Self { min: lod, max: lod }
    }

    /// Number of levels in the range.
    pub fn level_count(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    /// Returns `true` if `lod` lies inside the range.
    pub fn contains(&self, lod: u8) -> bool {
        (self.min..=self.max).contains(&lod)
    }

    /// Returns `true` if the two ranges share at least one level.
    pub fn overlaps(&self, other: &LodRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Iterate over the levels in the range.
    pub fn iter(&self) -> RangeInclusive<u8> {
        self.min..=self.max
    }
}

impl fmt::Display for LodRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// Bounds applied to a policy's requested level count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeLimits {
    /// Minimum levels per request.
    pub min_levels: u8,
    /// Maximum levels per request.
    pub max_levels: u8,
    /// Requests smaller than this are widened with further levels, if any.
    pub min_request_bytes: u64,
    /// Requests larger than this are narrowed, but never below one level.
    pub max_request_bytes: u64,
}

impl Default for RangeLimits {
    fn default() -> Self {
        Self {
            min_levels: 1,
            max_levels: u8::MAX,
            min_request_bytes: 0,
            max_request_bytes: u64::MAX,
        }
    }
}

/// What a policy wants fetched next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeDecision {
    /// Number of levels to request. Non-positive values decline the request.
    pub levels: i32,
    /// Limits the requested level count is clamped to.
    pub limits: RangeLimits,
}

impl RangeDecision {
    /// A decision for `levels` levels with default limits.
    pub fn levels(levels: i32) -> Self {
        Self {
            levels,
            limits: RangeLimits::default(),
        }
    }
}

/// Decides how many LOD levels to fetch in one request.
///
/// Implementations must be pure: the same inputs always produce the same
/// decision.
pub trait LodRangePolicy: Send + Sync + fmt::Debug {
    /// `current_lod` is the highest level already available (`None` before
    /// level 0 arrives); `required_lod` is what the view asks for.
    fn decide_range(&self, current_lod: Option<u8>, required_lod: u8) -> RangeDecision;
}

/// Fetches a single level per request regardless of the gap size.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleLodPolicy;

impl LodRangePolicy for SingleLodPolicy {
    fn decide_range(&self, _current_lod: Option<u8>, _required_lod: u8) -> RangeDecision {
        RangeDecision {
            levels: 1,
            limits: RangeLimits {
                min_levels: 1,
                max_levels: 1,
                ..RangeLimits::default()
            },
        }
    }
}

/// Fetches the whole gap, but no more than `max_levels` at once.
#[derive(Clone, Copy, Debug)]
pub struct BoundedGapPolicy {
    /// Upper bound on levels per request.
    pub max_levels: u8,
}

impl LodRangePolicy for BoundedGapPolicy {
    fn decide_range(&self, current_lod: Option<u8>, required_lod: u8) -> RangeDecision {
        RangeDecision {
            levels: gap(current_lod, required_lod),
            limits: RangeLimits {
                min_levels: 1,
                max_levels: self.max_levels.max(1),
                ..RangeLimits::default()
            },
        }
    }
}

/// Fetches every missing level up to the required one in one request.
#[derive(Clone, Copy, Debug, Default)]
pub struct WholeGapPolicy;

impl LodRangePolicy for WholeGapPolicy {
    fn decide_range(&self, current_lod: Option<u8>, required_lod: u8) -> RangeDecision {
        RangeDecision::levels(gap(current_lod, required_lod))
    }
}

fn gap(current_lod: Option<u8>, required_lod: u8) -> i32 {
    let first = current_lod.map_or(0, |c| i32::from(c) + 1);
    i32::from(required_lod) - first + 1
}

/// Turn a policy decision into the concrete range to fetch for one stream.
///
/// `block_lengths[i]` is the encoded byte length of level `i`; its length
/// defines the finest level the stream supports. The range always starts at
/// the first missing level so applied data stays contiguous.
pub fn resolve_range(
    current_lod: Option<u8>,
    required_lod: u8,
    decision: &RangeDecision,
    block_lengths: &[u64],
) -> Result<LodRange, PolicyError> {
    let first = current_lod.map_or(0, |c| u16::from(c) + 1);
    if block_lengths.is_empty() || first > u16::from(required_lod) {
        return Err(PolicyError::NothingToFetch {
            available: current_lod,
            required: required_lod,
        });
    }
    let finest = (block_lengths.len() - 1).min(usize::from(u8::MAX)) as u8;
    if first > u16::from(finest) || required_lod > finest {
        return Err(PolicyError::NotRepresentable {
            min: first.min(u16::from(u8::MAX)) as u8,
            max: required_lod,
            finest,
        });
    }
    let first = first as u8;

    if decision.levels <= 0 {
        return Err(PolicyError::NonPositiveRange {
            levels: decision.levels,
        });
    }
    let limits = decision.limits;
    let min_levels = limits.min_levels.max(1);
    let max_levels = limits.max_levels.max(1);
    if min_levels > max_levels {
        return Err(PolicyError::InvertedLimits {
            min: min_levels,
            max: max_levels,
        });
    }

    let levels = decision
        .levels
        .clamp(i32::from(min_levels), i32::from(max_levels)) as u16;
    let mut last = (u16::from(first) + levels - 1).min(u16::from(finest)) as u8;

    let span_bytes = |last: u8| -> u64 {
        block_lengths[usize::from(first)..=usize::from(last)]
            .iter()
            .fold(0u64, |acc, len| acc.saturating_add(*len))
    };

    while last < finest && span_bytes(last) < limits.min_request_bytes {
        last += 1;
    }
    while last > first && span_bytes(last) > limits.max_request_bytes {
        last -= 1;
    }

    Ok(LodRange { min: first, max: last })
}
