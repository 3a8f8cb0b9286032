//! Builder for [`Registry`].

use std::sync::Arc;

use url::Url;

use super::{Registry, RegistryListener};
use crate::config::RegistryConfig;
use crate::error::Result;
use crate::expiration::{Clock, SystemClock};
use crate::transport::{GenaClient, HttpGenaClient, TaskExecutor};

/// Assembles a [`Registry`] from its collaborators.
///
/// Anything not provided falls back to the production default: the system
/// clock, an [`HttpGenaClient`] and a running maintainer.
///
/// # Example
///
/// ```rust,no_run
/// use upnp_registry::{Registry, RegistryConfig};
///
/// # async fn example() -> upnp_registry::Result<()> {
/// let registry = Registry::builder()
///     .with_config(RegistryConfig::low_power())
///     .with_callback_url("http://192.168.1.10:3400/notify".parse().unwrap())
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RegistryBuilder {
    config: RegistryConfig,
    clock: Option<Arc<dyn Clock>>,
    client: Option<Arc<dyn GenaClient>>,
    callback_urls: Vec<Url>,
    listeners: Vec<Arc<dyn RegistryListener>>,
    start_maintainer: bool,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            config: RegistryConfig::default(),
            clock: None,
            client: None,
            callback_urls: Vec::new(),
            listeners: Vec::new(),
            start_maintainer: true,
        }
    }

    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_client(mut self, client: Arc<dyn GenaClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Add a URL handed to publishers for event delivery.
    pub fn with_callback_url(mut self, url: Url) -> Self {
        self.callback_urls.push(url);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn RegistryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build without a background maintainer. Sweeps then only happen
    /// through [`Registry::maintain`] or after [`Registry::resume`].
    pub fn without_maintainer(mut self) -> Self {
        self.start_maintainer = false;
        self
    }

    /// Build the Registry. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Registry> {
        self.config.validate()?;
        let executor = TaskExecutor::current(self.config.executor_concurrency)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let client = match self.client {
            Some(client) => client,
            None => Arc::new(HttpGenaClient::new()?),
        };

        let registry = Registry::from_parts(
            self.config,
            clock,
            client,
            executor,
            self.callback_urls,
            self.listeners,
        );
        if self.start_maintainer {
            registry.resume();
        }
        tracing::debug!(
            maintainer = self.start_maintainer,
            "Registry created"
        );
        Ok(registry)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
