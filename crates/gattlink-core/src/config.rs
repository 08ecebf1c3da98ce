//! Per-connection configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::reconnect::ReconnectOptions;

/// Default timeout applied by the facade to each request.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the connection event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Default capacity of each per-characteristic notification channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

/// Configuration for a [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Schedule a reconnect after an unexpected link drop or link failure.
    pub auto_reconnect: bool,
    /// Reconnect delay and budget.
    pub reconnect: ReconnectOptions,
    /// Timeout the facade places on each request (None = wait indefinitely).
    pub operation_timeout: Option<Duration>,
    /// Skip discovery when the cache already holds a catalog for the peer.
    pub reuse_cached_catalog: bool,
    /// Always rediscover and compare the result against the cached catalog.
    pub revalidate_catalog: bool,
    /// Capacity of the [`ConnectionEvent`](crate::ConnectionEvent) channel.
    pub event_capacity: usize,
    /// Capacity of each notification channel.
    pub notification_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            reconnect: ReconnectOptions::default(),
            operation_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            reuse_cached_catalog: true,
            revalidate_catalog: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for long-lived connections: reconnect forever with backoff,
    /// and revalidate the cached catalog after each reconnect.
    pub fn resilient() -> Self {
        Self {
            auto_reconnect: true,
            reconnect: ReconnectOptions::unlimited(),
            operation_timeout: Some(Duration::from_secs(30)),
            revalidate_catalog: true,
            ..Default::default()
        }
    }

    /// Preset for short request/response sessions: no reconnect, short timeouts.
    pub fn fast() -> Self {
        Self {
            auto_reconnect: false,
            operation_timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, options: ReconnectOptions) -> Self {
        self.reconnect = options;
        self
    }

    #[must_use]
    pub fn operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn reuse_cached_catalog(mut self, enabled: bool) -> Self {
        self.reuse_cached_catalog = enabled;
        self
    }

    #[must_use]
    pub fn revalidate_catalog(mut self, enabled: bool) -> Self {
        self.revalidate_catalog = enabled;
        self
    }

    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    #[must_use]
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        if self.notification_capacity == 0 {
            return Err(Error::invalid_config("notification_capacity must be > 0"));
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::invalid_config("operation_timeout must be > 0"));
        }
        if self.auto_reconnect {
            self.reconnect.validate()?;
        }
        Ok(())
    }
}
