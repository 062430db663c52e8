//! Invocation configuration
//!
//! [`ThreadInfo`] is one row of the per-instance configuration table: which
//! device to drive, with which kernel parameters and coherence mode.
//! [`InvokeOptions`] carries the host-side knobs of a single invocation
//! (poll bounds and cancellation) and can be seeded from the environment.

use crate::error::{AcceleratorError, Result};
use crate::kernel::{KernelConfig, MacConfig};
use esp_chip::coherence::CoherenceMode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding the completion timeout (milliseconds).
pub const ENV_POLL_TIMEOUT_MS: &str = "ESP_POLL_TIMEOUT_MS";
/// Environment variable overriding the status poll interval (microseconds).
pub const ENV_POLL_INTERVAL_US: &str = "ESP_POLL_INTERVAL_US";

/// Maximum peer-to-peer source devices per instance.
pub const MAX_P2P_SOURCES: usize = 4;

/// Peer-to-peer chaining request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct P2pConfig {
    /// Store output directly to a consumer accelerator
    pub store: bool,
    /// Producer accelerators to load input from
    pub sources: Vec<String>,
}

impl P2pConfig {
    /// Whether any chaining is requested.
    pub fn is_enabled(&self) -> bool {
        self.store || !self.sources.is_empty()
    }
}

/// One entry of the per-instance configuration table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Whether this entry is executed
    pub run: bool,
    /// Instance name (`mac.0`)
    pub device_name: String,
    /// Kernel parameters, tagged by kind
    pub kernel: KernelConfig,
    /// Coherence mode for this invocation
    pub coherence: CoherenceMode,
    /// Peer-to-peer chaining
    pub p2p: P2pConfig,
}

impl ThreadInfo {
    /// Enabled, non-coherent entry for `device_name`.
    pub fn new(device_name: impl Into<String>, kernel: impl Into<KernelConfig>) -> Self {
        Self {
            run: true,
            device_name: device_name.into(),
            kernel: kernel.into(),
            coherence: CoherenceMode::None,
            p2p: P2pConfig::default(),
        }
    }

    /// Reference MAC problem on `device_name`.
    pub fn reference(device_name: impl Into<String>) -> Self {
        Self::new(device_name, MacConfig::REFERENCE)
    }

    /// Set the coherence mode.
    #[must_use]
    pub fn with_coherence(mut self, coherence: CoherenceMode) -> Self {
        self.coherence = coherence;
        self
    }

    /// Check the entry before any device is touched.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty device name, more than
    /// [`MAX_P2P_SOURCES`] sources, or any chaining request.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.trim().is_empty() {
            return Err(AcceleratorError::configuration("empty device name"));
        }
        if self.p2p.sources.len() > MAX_P2P_SOURCES {
            return Err(AcceleratorError::configuration(format!(
                "{}: {} p2p sources, at most {MAX_P2P_SOURCES}",
                self.device_name,
                self.p2p.sources.len()
            )));
        }
        if self.p2p.is_enabled() {
            return Err(AcceleratorError::configuration(format!(
                "{}: peer-to-peer chaining is not supported",
                self.device_name
            )));
        }
        Ok(())
    }
}

/// Bounds of the completion poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Sleep between status reads; zero spins
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl PollConfig {
    /// Default completion timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default status poll interval.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(100);
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Cooperative cancellation flag shared between threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Host-side options for one invocation.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Poll bounds
    pub poll: PollConfig,
    /// Cancellation
    pub cancel: CancelToken,
}

impl InvokeOptions {
    /// Defaults overridden by `ESP_POLL_TIMEOUT_MS` / `ESP_POLL_INTERVAL_US`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(ms) = parse_var(&lookup, ENV_POLL_TIMEOUT_MS) {
            options.poll.timeout = Duration::from_millis(ms);
        }
        if let Some(us) = parse_var(&lookup, ENV_POLL_INTERVAL_US) {
            options.poll.interval = Duration::from_micros(us);
        }
        options
    }

    /// Replace the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.poll.timeout = timeout;
        self
    }

    /// Replace the poll interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.poll.interval = interval;
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Ignoring {key}={raw:?}: {e}");
            None
        }
    }
}
