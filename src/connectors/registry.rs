//! Connector registry
//!
//! Process-wide registry mapping connector names to their implementations,
//! initialised once at worker start.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::warn;
use url::Url;

use crate::config::AppConfig;
use crate::connectors::{
    Connector, ConnectorInitData, GenericConnector, GithubConnector, TimeConnector,
};

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("connector '{name}' not found")]
    ConnectorNotFound { name: String },
    #[error("invalid web base URI '{value}'")]
    InvalidBaseUri { value: String },
}

/// Global connector registry instance
static REGISTRY: OnceLock<Arc<RwLock<Registry>>> = OnceLock::new();

#[derive(Clone, Default)]
pub struct Registry {
    connectors: HashMap<&'static str, Arc<dyn Connector>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Get the global registry instance
    pub fn global() -> &'static Arc<RwLock<Registry>> {
        REGISTRY.get_or_init(|| Arc::new(RwLock::new(Self::new())))
    }

    /// Initialize the global registry from configuration and run every
    /// connector's init hook.
    pub async fn initialize(config: &AppConfig) -> Result<(), RegistryError> {
        let web_base_uri =
            Url::parse(&config.web_base_uri).map_err(|_| RegistryError::InvalidBaseUri {
                value: config.web_base_uri.clone(),
            })?;

        let mut connectors: Vec<Arc<dyn Connector>> = vec![
            Arc::new(GenericConnector::new()),
            Arc::new(TimeConnector::new()),
        ];

        match config.github_webhook_key.as_ref() {
            Some(key) => {
                connectors.push(Arc::new(GithubConnector::new(
                    key.clone(),
                    web_base_uri.clone(),
                )));
            }
            None => {
                warn!("github connector not registered: missing webhook key");
            }
        }

        let init_data = ConnectorInitData { web_base_uri };

        {
            let registry = Self::global();
            let mut reg = registry.write().unwrap();
            for connector in &connectors {
                reg.register(connector.clone());
            }
        }

        for connector in &connectors {
            if let Err(err) = connector.init(&init_data).await {
                warn!(
                    connector = connector.name(),
                    error = %err,
                    "connector initialisation failed"
                );
            }
        }

        Ok(())
    }

    /// Run every registered connector's terminate hook.
    pub async fn terminate() {
        let connectors: Vec<Arc<dyn Connector>> = {
            let registry = Self::global();
            let reg = registry.read().unwrap();
            reg.connectors.values().cloned().collect()
        };

        for connector in connectors {
            connector.terminate().await;
        }
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.name(), connector);
    }

    /// Get a connector by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn Connector>, RegistryError> {
        self.connectors
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ConnectorNotFound {
                name: name.to_string(),
            })
    }

    /// Look a connector up in the global registry.
    pub fn lookup(name: &str) -> Result<Arc<dyn Connector>, RegistryError> {
        let registry = Self::global();
        let reg = registry.read().unwrap();
        reg.get(name)
    }

    /// Registered connector names, sorted for stable ordering.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.connectors.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
