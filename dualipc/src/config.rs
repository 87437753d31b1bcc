//! Endpoint and transport configuration

use crate::message::PeerId;
use crate::{Error, Result};
use std::time::Duration;

/// Environment variable holding the invocation timeout in milliseconds
pub const INVOKE_TIMEOUT_ENV: &str = "DUALIPC_INVOKE_TIMEOUT_MS";

/// Environment variable holding the number of correlation id redraws
pub const COLLISION_RETRIES_ENV: &str = "DUALIPC_COLLISION_RETRIES";

/// Behaviour knobs for an [`Endpoint`](crate::Endpoint)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Evict unanswered invocations after this long
    ///
    /// `None` keeps an unanswered invocation outstanding forever.
    pub invoke_timeout: Option<Duration>,
    /// How many times to redraw a correlation id that collides with a live one
    pub collision_retries: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: None,
            collision_retries: 8,
        }
    }
}

impl EndpointConfig {
    pub fn builder() -> EndpointConfigBuilder {
        EndpointConfigBuilder::default()
    }

    /// Defaults overridden by `DUALIPC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(INVOKE_TIMEOUT_ENV) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                Error::configuration(
                    format!("expected milliseconds, got {raw:?}"),
                    Some(INVOKE_TIMEOUT_ENV.to_string()),
                )
            })?;
            config.invoke_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(raw) = lookup(COLLISION_RETRIES_ENV) {
            config.collision_retries = raw.trim().parse().map_err(|_| {
                Error::configuration(
                    format!("expected a retry count, got {raw:?}"),
                    Some(COLLISION_RETRIES_ENV.to_string()),
                )
            })?;
        }

        Ok(config)
    }
}

/// Builder for [`EndpointConfig`]
#[derive(Debug, Default)]
pub struct EndpointConfigBuilder {
    config: EndpointConfig,
}

impl EndpointConfigBuilder {
    pub fn invoke_timeout(mut self, timeout: Duration) -> Self {
        self.config.invoke_timeout = Some(timeout);
        self
    }

    pub fn no_invoke_timeout(mut self) -> Self {
        self.config.invoke_timeout = None;
        self
    }

    pub fn collision_retries(mut self, retries: u32) -> Self {
        self.config.collision_retries = retries;
        self
    }

    pub fn build(self) -> EndpointConfig {
        self.config
    }
}

/// Settings for joining an ipmb bus
#[derive(Debug, Clone)]
pub struct IpmbConfig {
    pub bus_name: String,
    /// Label the responder joins under; initiators address it by this label
    pub responder_label: String,
    /// Identity of an initiator; a random one is generated when unset
    pub identity: Option<PeerId>,
    /// How long a single receive waits before re-checking for shutdown
    pub poll_interval: Duration,
}

impl Default for IpmbConfig {
    fn default() -> Self {
        Self {
            bus_name: "com.dualipc.bus".to_string(),
            responder_label: "dualipc.responder".to_string(),
            identity: None,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl IpmbConfig {
    pub fn with_bus_name(mut self, bus_name: impl Into<String>) -> Self {
        self.bus_name = bus_name.into();
        self
    }

    pub fn with_identity(mut self, identity: PeerId) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}
