use std::time::Duration;

use crate::error::SubtitleStreamError;

/// Default scheduling cadence for the subtitle tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for the subtitle stream controller.
///
/// All time values that relate to the media timeline are expressed in seconds.
#[derive(Debug, Clone)]
pub struct SubtitleStreamConfig {
    /// Soft cap on how far ahead of the playback position we buffer
    pub max_buffer_length: f64,
    /// Hard cap on forward buffer; the effective cap is the smaller of the two
    pub max_max_buffer_length: f64,
    /// Gaps in the buffered ranges up to this size are treated as contiguous
    pub max_buffer_hole: f64,
    /// Tolerance used when matching a fragment to a timeline position
    pub max_frag_lookup_tolerance: f64,
    /// Period of the scheduling tick
    pub tick_interval: Duration,
    /// Run AES decryption on the blocking thread pool
    pub decryption_offload_enabled: bool,
    /// Capacity of the inbound event channel
    pub event_channel_capacity: usize,
    /// Capacity of the outbound request channel
    pub request_channel_capacity: usize,
}

impl Default for SubtitleStreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_length: 30.0,
            max_max_buffer_length: 600.0,
            max_buffer_hole: 0.1,
            max_frag_lookup_tolerance: 0.25,
            tick_interval: DEFAULT_TICK_INTERVAL,
            decryption_offload_enabled: true,
            event_channel_capacity: 64,
            request_channel_capacity: 16,
        }
    }
}

impl SubtitleStreamConfig {
    pub fn builder() -> SubtitleStreamConfigBuilder {
        SubtitleStreamConfigBuilder::new()
    }

    /// Effective forward-buffer cap.
    pub fn max_buffer_cap(&self) -> f64 {
        self.max_buffer_length.min(self.max_max_buffer_length)
    }

    pub fn validate(&self) -> Result<(), SubtitleStreamError> {
        let non_negative = [
            ("max_buffer_length", self.max_buffer_length),
            ("max_max_buffer_length", self.max_max_buffer_length),
            ("max_buffer_hole", self.max_buffer_hole),
            ("max_frag_lookup_tolerance", self.max_frag_lookup_tolerance),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(SubtitleStreamError::configuration(format!(
                    "{name} must be a finite, non-negative number of seconds (got {value})"
                )));
            }
        }

        if self.tick_interval.is_zero() {
            return Err(SubtitleStreamError::configuration(
                "tick_interval must be greater than zero",
            ));
        }

        if self.event_channel_capacity == 0 || self.request_channel_capacity == 0 {
            return Err(SubtitleStreamError::configuration(
                "channel capacities must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Builder for [`SubtitleStreamConfig`]
#[derive(Debug, Clone, Default)]
pub struct SubtitleStreamConfigBuilder {
    config: SubtitleStreamConfig,
}

impl SubtitleStreamConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_buffer_length(mut self, seconds: f64) -> Self {
        self.config.max_buffer_length = seconds;
        self
    }

    pub fn with_max_max_buffer_length(mut self, seconds: f64) -> Self {
        self.config.max_max_buffer_length = seconds;
        self
    }

    pub fn with_max_buffer_hole(mut self, seconds: f64) -> Self {
        self.config.max_buffer_hole = seconds;
        self
    }

    pub fn with_max_frag_lookup_tolerance(mut self, seconds: f64) -> Self {
        self.config.max_frag_lookup_tolerance = seconds;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn with_decryption_offload(mut self, enabled: bool) -> Self {
        self.config.decryption_offload_enabled = enabled;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    pub fn with_request_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.request_channel_capacity = capacity;
        self
    }

    pub fn build(self) -> SubtitleStreamConfig {
        self.config
    }
}
