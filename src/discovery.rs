//! Endpoint discovery.
//!
//! An [`EndpointResolver`] turns a resource address into an
//! [`EndpointDescriptor`] ready for registration. [`StaticResolver`] answers
//! from configuration; [`IdnResolver`] connects and asks the instrument who it
//! is with `*IDN?`.

use async_trait::async_trait;
use sonaris_core::EndpointDescriptor;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::driver::{ConnectionSettings, DriverRegistry, InstrumentIo};
use crate::error::{AppResult, SonarisError};

/// Resolves resource addresses to endpoint descriptors.
#[async_trait]
pub trait EndpointResolver: Send + Sync + Debug {
    /// Describe the endpoint at `address`.
    async fn resolve(&self, address: &str) -> AppResult<EndpointDescriptor>;
}

/// Resolves from a fixed table, typically the configured endpoints.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    by_address: HashMap<String, EndpointDescriptor>,
}

impl StaticResolver {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table built from configured endpoints.
    pub fn from_endpoints<'a>(endpoints: impl IntoIterator<Item = &'a EndpointConfig>) -> Self {
        let mut resolver = Self::new();
        for endpoint in endpoints {
            resolver.insert(endpoint.descriptor());
        }
        resolver
    }

    /// Add or replace a descriptor.
    pub fn insert(&mut self, descriptor: EndpointDescriptor) {
        self.by_address.insert(descriptor.address.clone(), descriptor);
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, address: &str) -> AppResult<EndpointDescriptor> {
        self.by_address
            .get(address)
            .cloned()
            .ok_or_else(|| SonarisError::EndpointNotFound(address.to_string()))
    }
}

/// Resolves by opening a connection and reading `*IDN?`.
///
/// The descriptor id is the lower-cased model field of the identity string
/// (`RIGOL TECHNOLOGIES,DG4202,DG4E0000,00.01` gives `dg4202`), and the model
/// becomes the expected identity for later probes.
#[derive(Debug, Clone)]
pub struct IdnResolver {
    registry: DriverRegistry,
    settings: ConnectionSettings,
    timeout: Duration,
}

impl IdnResolver {
    /// Resolver creating drivers from `registry`.
    pub fn new(registry: DriverRegistry, settings: ConnectionSettings, timeout: Duration) -> Self {
        Self {
            registry,
            settings,
            timeout,
        }
    }
}

#[async_trait]
impl EndpointResolver for IdnResolver {
    async fn resolve(&self, address: &str) -> AppResult<EndpointDescriptor> {
        let driver = self.registry.create(address, &self.settings)?;
        let idn = driver.query("*IDN?", self.timeout).await;
        driver.disconnect().await;
        let idn = idn?;
        debug!(address, idn = %idn, "Identity received");

        let descriptor = descriptor_from_idn(address, &idn);
        info!(address, endpoint = %descriptor.id, "Endpoint resolved");
        Ok(descriptor)
    }
}

fn descriptor_from_idn(address: &str, idn: &str) -> EndpointDescriptor {
    let model = idn
        .split(',')
        .nth(1)
        .map(str::trim)
        .filter(|model| !model.is_empty());
    let id = model.map_or_else(|| address.to_string(), str::to_lowercase);
    let descriptor = EndpointDescriptor::new(id, address).with_name(idn.trim());
    match model {
        Some(model) => descriptor.with_expected_idn(model),
        None => descriptor,
    }
}
