//! Immutable streaming configuration shared by the scheduler and extension.

use std::fmt;
use std::sync::Arc;

use popstream_lod::{LodRangePolicy, SingleLodPolicy};

use crate::error::OptionsError;

/// Streaming configuration. Built once through [`StreamingOptionsBuilder`]
/// and never mutated afterwards.
#[derive(Clone)]
pub struct StreamingOptions {
    error_tolerance_threshold: f32,
    lod_blending_enabled: bool,
    lod_blending_period: f32,
    range_policy: Arc<dyn LodRangePolicy>,
    max_active_parsers: usize,
    fetch_timeout: Option<f32>,
    fetch_retry_delay: f32,
}

impl StreamingOptions {
    pub fn builder() -> StreamingOptionsBuilder {
        StreamingOptionsBuilder::default()
    }

    /// Default parser count: one per core, at most 8.
    pub fn default_parser_count() -> usize {
        num_cpus::get().clamp(1, 8)
    }

    /// Screen-space error in pixels below which no refinement is requested.
    pub fn error_tolerance_threshold(&self) -> f32 {
        self.error_tolerance_threshold
    }

    pub fn lod_blending_enabled(&self) -> bool {
        self.lod_blending_enabled
    }

    /// Duration of one LOD transition in milliseconds.
    pub fn lod_blending_period(&self) -> f32 {
        self.lod_blending_period
    }

    /// Blending period to use for transitions, `None` when blending is off.
    pub fn effective_blending_period(&self) -> Option<f32> {
        (self.lod_blending_enabled && self.lod_blending_period > 0.0)
            .then_some(self.lod_blending_period)
    }

    pub fn range_policy(&self) -> &dyn LodRangePolicy {
        self.range_policy.as_ref()
    }

    /// Decode concurrency cap, also the cap on outstanding LOD fetches.
    pub fn max_active_parsers(&self) -> usize {
        self.max_active_parsers
    }

    /// Milliseconds after which an unanswered fetch is re-issued.
    pub fn fetch_timeout(&self) -> Option<f32> {
        self.fetch_timeout
    }

    /// Base delay in milliseconds before retrying a failed fetch.
    pub fn fetch_retry_delay(&self) -> f32 {
        self.fetch_retry_delay
    }
}

impl fmt::Debug for StreamingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingOptions")
            .field("error_tolerance_threshold", &self.error_tolerance_threshold)
            .field("lod_blending_enabled", &self.lod_blending_enabled)
            .field("lod_blending_period", &self.lod_blending_period)
            .field("range_policy", &self.range_policy)
            .field("max_active_parsers", &self.max_active_parsers)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("fetch_retry_delay", &self.fetch_retry_delay)
            .finish()
    }
}

/// Chained builder for [`StreamingOptions`].
pub struct StreamingOptionsBuilder {
    options: StreamingOptions,
}

impl Default for StreamingOptionsBuilder {
    fn default() -> Self {
        Self {
            options: StreamingOptions {
                error_tolerance_threshold: 1.0,
                lod_blending_enabled: true,
                lod_blending_period: 500.0,
                range_policy: Arc::new(SingleLodPolicy),
                max_active_parsers: StreamingOptions::default_parser_count(),
                fetch_timeout: None,
                fetch_retry_delay: 250.0,
            },
        }
    }
}

impl StreamingOptionsBuilder {
    /// Pixels of tolerated screen-space error; `0` refines maximally.
    pub fn error_tolerance_threshold(mut self, pixels: f32) -> Self {
        self.options.error_tolerance_threshold = pixels;
        self
    }

    pub fn lod_blending_enabled(mut self, enabled: bool) -> Self {
        self.options.lod_blending_enabled = enabled;
        self
    }

    /// Duration of one LOD transition in milliseconds.
    pub fn lod_blending_period(mut self, millis: f32) -> Self {
        self.options.lod_blending_period = millis;
        self
    }

    pub fn lod_range_policy(mut self, policy: impl LodRangePolicy + 'static) -> Self {
        self.options.range_policy = Arc::new(policy);
        self
    }

    pub fn max_active_parsers(mut self, parsers: usize) -> Self {
        self.options.max_active_parsers = parsers;
        self
    }

    pub fn fetch_timeout(mut self, millis: Option<f32>) -> Self {
        self.options.fetch_timeout = millis;
        self
    }

    pub fn fetch_retry_delay(mut self, millis: f32) -> Self {
        self.options.fetch_retry_delay = millis;
        self
    }

    /// Validate and freeze the options.
    pub fn build(self) -> Result<StreamingOptions, OptionsError> {
        let o = &self.options;
        if o.max_active_parsers == 0 {
            return Err(OptionsError::NoParsers);
        }
        if !o.error_tolerance_threshold.is_finite() || o.error_tolerance_threshold < 0.0 {
            return Err(OptionsError::InvalidThreshold(o.error_tolerance_threshold));
        }
        if !o.lod_blending_period.is_finite() || o.lod_blending_period < 0.0 {
            return Err(OptionsError::InvalidBlendingPeriod(o.lod_blending_period));
        }
        if let Some(timeout) = o.fetch_timeout
            && !(timeout.is_finite() && timeout > 0.0)
        {
            return Err(OptionsError::InvalidFetchTimeout(timeout));
        }
        Ok(self.options)
    }
}
