//! Runtime configuration.
//!
//! Defaults live in [`defaults`], environment variable names and their
//! parsers in [`env_vars`]. [`RuntimeConfig::from_env`] combines both.

use std::time::Duration;

/// Default bounds
pub mod defaults {
    /// Activation timeout in milliseconds
    pub const ACTIVATION_TIMEOUT_MS: u64 = 30_000;
    /// Dispose/deactivate timeout in milliseconds
    pub const TEARDOWN_TIMEOUT_MS: u64 = 10_000;
    /// Tool and service handler timeout in milliseconds
    pub const HANDLER_TIMEOUT_MS: u64 = 30_000;
    /// Per-listener timeout in milliseconds
    pub const LISTENER_TIMEOUT_MS: u64 = 5_000;
    /// Broadcast tap capacity of the event bus
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}

/// Environment variable names
pub mod env_vars {
    use std::time::Duration;

    pub const ACTIVATION_TIMEOUT_MS: &str = "KINDLING_ACTIVATION_TIMEOUT_MS";
    pub const TEARDOWN_TIMEOUT_MS: &str = "KINDLING_TEARDOWN_TIMEOUT_MS";
    pub const HANDLER_TIMEOUT_MS: &str = "KINDLING_HANDLER_TIMEOUT_MS";
    pub const LISTENER_TIMEOUT_MS: &str = "KINDLING_LISTENER_TIMEOUT_MS";
    pub const EVENT_CAPACITY: &str = "KINDLING_EVENT_CAPACITY";
    pub const DATA_DIR: &str = "KINDLING_DATA_DIR";
    pub const LOG_JSON: &str = "KINDLING_LOG_JSON";

    /// Parse a millisecond bound. `0` disables the bound; unset or unparsable
    /// values fall back to `default_ms`.
    pub fn timeout(name: &str, default_ms: u64) -> Option<Duration> {
        let ms = std::env::var(name)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(default_ms);
        millis_or_none(ms)
    }

    pub fn event_capacity() -> usize {
        std::env::var(EVENT_CAPACITY)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(super::defaults::EVENT_CHANNEL_CAPACITY)
    }

    pub(crate) fn millis_or_none(ms: u64) -> Option<Duration> {
        if ms == 0 {
            None
        } else {
            Some(Duration::from_millis(ms))
        }
    }
}

/// Bounds and sizes used by the registry and event bus.
///
/// `None` means "wait forever".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub activation_timeout: Option<Duration>,
    pub teardown_timeout: Option<Duration>,
    pub handler_timeout: Option<Duration>,
    pub listener_timeout: Option<Duration>,
    pub event_channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            activation_timeout: env_vars::millis_or_none(defaults::ACTIVATION_TIMEOUT_MS),
            teardown_timeout: env_vars::millis_or_none(defaults::TEARDOWN_TIMEOUT_MS),
            handler_timeout: env_vars::millis_or_none(defaults::HANDLER_TIMEOUT_MS),
            listener_timeout: env_vars::millis_or_none(defaults::LISTENER_TIMEOUT_MS),
            event_channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `KINDLING_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            activation_timeout: env_vars::timeout(
                env_vars::ACTIVATION_TIMEOUT_MS,
                defaults::ACTIVATION_TIMEOUT_MS,
            ),
            teardown_timeout: env_vars::timeout(
                env_vars::TEARDOWN_TIMEOUT_MS,
                defaults::TEARDOWN_TIMEOUT_MS,
            ),
            handler_timeout: env_vars::timeout(
                env_vars::HANDLER_TIMEOUT_MS,
                defaults::HANDLER_TIMEOUT_MS,
            ),
            listener_timeout: env_vars::timeout(
                env_vars::LISTENER_TIMEOUT_MS,
                defaults::LISTENER_TIMEOUT_MS,
            ),
            event_channel_capacity: env_vars::event_capacity(),
        }
    }

    /// No timeouts anywhere.
    pub fn unbounded() -> Self {
        Self {
            activation_timeout: None,
            teardown_timeout: None,
            handler_timeout: None,
            listener_timeout: None,
            event_channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_activation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.activation_timeout = timeout;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_listener_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.listener_timeout = timeout;
        self
    }
}
