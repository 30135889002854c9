//! Interop configuration parameters.

use std::error::Error;
use std::fmt;

/// Configuration shared by handle acquisition and view binding.
///
/// Validated with [`validate`](InteropConfig::validate); all values are
/// plain data and may be copied freely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InteropConfig {
    /// Run the header signature and size sanity checks when a container
    /// view is bound. Default: `true`.
    pub validate_layouts: bool,

    /// Send acquisition sizes of owning handles to the pressure sink.
    /// Default: `true`.
    pub pressure_hints: bool,

    /// Outstanding foreign bytes above which the global pressure counter
    /// logs a collection hint. Default: 256MB.
    pub pressure_log_threshold: usize,

    /// Upper bound on the number of blocks a block-directory walk may visit
    /// before the ring is declared broken. Default: 1 << 20.
    pub max_block_walk: usize,
}

impl InteropConfig {
    /// Default pressure log threshold: 256MB.
    pub const DEFAULT_PRESSURE_LOG_THRESHOLD: usize = 256 * 1024 * 1024;

    /// Default bound on block-directory walks.
    pub const DEFAULT_MAX_BLOCK_WALK: usize = 1 << 20;

    /// Create a config with default values.
    pub const fn new() -> Self {
        Self {
            validate_layouts: true,
            pressure_hints: true,
            pressure_log_threshold: Self::DEFAULT_PRESSURE_LOG_THRESHOLD,
            max_block_walk: Self::DEFAULT_MAX_BLOCK_WALK,
        }
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_block_walk == 0 {
            return Err(ConfigError::ZeroBlockWalk);
        }
        if self.pressure_hints && self.pressure_log_threshold == 0 {
            return Err(ConfigError::ZeroPressureThreshold);
        }
        Ok(())
    }
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors detected by [`InteropConfig::validate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_block_walk` is zero, so no container could ever be walked.
    ZeroBlockWalk,
    /// Pressure hints are enabled with a zero log threshold.
    ZeroPressureThreshold,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroBlockWalk => write!(f, "max_block_walk must be at least 1"),
            Self::ZeroPressureThreshold => {
                write!(f, "pressure_log_threshold must be non-zero when hints are on")
            }
        }
    }
}

impl Error for ConfigError {}
