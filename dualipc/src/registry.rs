//! Registry handing out endpoints by name

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::{
    config::EndpointConfig,
    endpoint::{Endpoint, Role},
    transport::ChannelProvider,
    Error, Result,
};

const MAX_NAME_LEN: usize = 128;

/// Creates each named endpoint once and binds it when its channels appear
pub struct EndpointRegistry {
    provider: Arc<dyn ChannelProvider>,
    role: Role,
    config: EndpointConfig,
    endpoints: DashMap<String, Endpoint>,
}

impl EndpointRegistry {
    pub fn new(provider: Arc<dyn ChannelProvider>, role: Role) -> Self {
        Self::with_config(provider, role, EndpointConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn ChannelProvider>,
        role: Role,
        config: EndpointConfig,
    ) -> Self {
        Self {
            provider,
            role,
            config,
            endpoints: DashMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Return the endpoint for `name`, creating it on first use
    ///
    /// A new endpoint is usable immediately; it binds in the background
    /// once the provider yields its channels. Must be called within a tokio
    /// runtime.
    pub fn get_or_create(&self, name: &str) -> Result<Endpoint> {
        let name = normalize_name(name)?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::runtime("endpoint creation requires a tokio runtime", e))?;

        let endpoint = match self.endpoints.entry(name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => slot
                .insert(Endpoint::with_config(&name, self.role, self.config.clone()))
                .clone(),
        };

        tracing::info!("Created {} endpoint {}", self.role, name);
        let provider = self.provider.clone();
        let binding = endpoint.clone();
        handle.spawn(async move {
            match provider.discover(&name).await {
                Ok(pair) => {
                    if let Err(e) = binding.bind(pair) {
                        tracing::error!("Failed to bind endpoint {}: {}", name, e);
                    }
                }
                Err(e) => tracing::error!("Channel discovery for {} failed: {}", name, e),
            }
        });

        Ok(endpoint)
    }

    /// Look up an existing endpoint without creating it
    pub fn get(&self, name: &str) -> Option<Endpoint> {
        let name = normalize_name(name).ok()?;
        self.endpoints.get(&name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Trim surrounding whitespace and reject names no channel could carry
pub fn normalize_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_NAME_LEN
        || trimmed.chars().any(|c| c.is_control())
    {
        return Err(Error::invalid_endpoint_name(name));
    }
    Ok(trimmed.to_string())
}
