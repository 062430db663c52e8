//! Error types for accelerator invocations

use thiserror::Error;

/// Result type alias for accelerator operations
pub type Result<T> = std::result::Result<T, AcceleratorError>;

/// Errors that can occur while planning or running an invocation
#[derive(Debug, Error)]
pub enum AcceleratorError {
    /// Device lacks scatter-gather support or enough page-table entries
    #[error("Capability check failed: {reason}")]
    Capability {
        /// Reason for failure
        reason: String,
    },

    /// Invalid invocation configuration, rejected before any register write
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Reason for failure
        reason: String,
    },

    /// Completion poll exceeded its bound
    #[error("Accelerator did not complete within {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Completion poll was cancelled by the caller
    #[error("Invocation cancelled while waiting for completion")]
    Cancelled,

    /// No accelerator with the requested name
    #[error("Accelerator not found: {name}")]
    DeviceNotFound {
        /// Requested device name
        name: String,
    },

    /// No accelerators detected
    #[error("No accelerators detected")]
    NoDevicesFound,

    /// Register or memory transfer failed
    #[error("Transfer failed: {reason}")]
    Transfer {
        /// Reason for failure
        reason: String,
    },

    /// I/O error during device or sysfs access
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Output did not match the expected data
    #[error("Validation failed with {errors} mismatching elements")]
    ValidationMismatch {
        /// Number of mismatching elements
        errors: usize,
    },
}

impl AcceleratorError {
    /// Create a capability error
    pub fn capability(reason: impl Into<String>) -> Self {
        Self::Capability {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transfer error
    pub fn transfer(reason: impl Into<String>) -> Self {
        Self::Transfer {
            reason: reason.into(),
        }
    }

    /// Create a device-not-found error
    pub fn device_not_found(name: impl Into<String>) -> Self {
        Self::DeviceNotFound { name: name.into() }
    }

    /// Whether retrying with identical inputs could succeed.
    ///
    /// Capability and configuration failures need different inputs; the
    /// core never retries on its own either way.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled | Self::Transfer { .. })
    }
}
