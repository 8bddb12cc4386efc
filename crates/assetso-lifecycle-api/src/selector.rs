use std::path::PathBuf;

use assetso_lifecycle_core::{EngineError, EngineKind, StorageEngine};
use assetso_lifecycle_store_rest::{RestConfig, RestEngine};
use assetso_lifecycle_store_sqlite::{DirectEngine, ModelRegistry, OrmEngine};

use crate::config::EngineConfig;
use crate::LifecycleError;

/// Knows how to open one engine. Connections live only as long as the operation using them.
pub trait EngineConnector: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// # Errors
    /// Returns the adapter's classified error when the engine cannot be reached.
    fn connect(&self) -> Result<Box<dyn StorageEngine>, EngineError>;
}

struct DirectConnector {
    path: PathBuf,
}

impl EngineConnector for DirectConnector {
    fn kind(&self) -> EngineKind {
        EngineKind::Direct
    }

    fn connect(&self) -> Result<Box<dyn StorageEngine>, EngineError> {
        Ok(Box::new(DirectEngine::open(&self.path)?))
    }
}

struct OrmConnector {
    path: PathBuf,
}

impl EngineConnector for OrmConnector {
    fn kind(&self) -> EngineKind {
        EngineKind::Orm
    }

    fn connect(&self) -> Result<Box<dyn StorageEngine>, EngineError> {
        Ok(Box::new(OrmEngine::open(&self.path, ModelRegistry::from_catalog())?))
    }
}

struct RestConnector {
    config: RestConfig,
}

impl EngineConnector for RestConnector {
    fn kind(&self) -> EngineKind {
        EngineKind::Rest
    }

    fn connect(&self) -> Result<Box<dyn StorageEngine>, EngineError> {
        Ok(Box::new(RestEngine::connect(&self.config)?))
    }
}

/// Ranked set of engines built from one [`EngineConfig`].
pub struct EngineSelector {
    connectors: Vec<Box<dyn EngineConnector>>,
}

impl EngineSelector {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut connectors: Vec<Box<dyn EngineConnector>> = Vec::new();
        for kind in config.ranked() {
            match kind {
                EngineKind::Direct => {
                    if let Some(path) = config.local_path(kind) {
                        connectors.push(Box::new(DirectConnector { path }));
                    }
                }
                EngineKind::Orm => {
                    if let Some(path) = config.local_path(kind) {
                        connectors.push(Box::new(OrmConnector { path }));
                    }
                }
                EngineKind::Rest => {
                    if let Some(rest) = &config.rest {
                        connectors.push(Box::new(RestConnector { config: rest.clone() }));
                    }
                }
            }
        }
        Self { connectors }
    }

    #[must_use]
    pub fn from_connectors(connectors: Vec<Box<dyn EngineConnector>>) -> Self {
        Self { connectors }
    }

    #[must_use]
    pub fn ranked(&self) -> Vec<EngineKind> {
        self.connectors.iter().map(|connector| connector.kind()).collect()
    }

    fn ensure_configured(&self) -> Result<(), LifecycleError> {
        if self.connectors.is_empty() {
            return Err(LifecycleError::Configuration(
                "no storage engine is configured; set DATABASE_URL or REST_URL and REST_SERVICE_KEY"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Connect the highest-ranked configured engine.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Configuration`] when nothing is configured, or
    /// [`LifecycleError::Engine`] when that engine cannot be reached.
    pub fn select(&self) -> Result<Box<dyn StorageEngine>, LifecycleError> {
        self.ensure_configured()?;
        let Some(connector) = self.connectors.first() else {
            return Err(LifecycleError::Configuration("no storage engine is configured".to_string()));
        };
        let engine = connector.connect().map_err(|err| LifecycleError::engine(connector.kind(), err))?;
        tracing::info!(engine = %connector.kind(), "selected engine");
        Ok(engine)
    }

    /// Run `operation` on each configured engine in rank order until one succeeds.
    ///
    /// Only connection failures and errors for which [`LifecycleError::is_engine_failure`] holds
    /// move on to the next engine; anything else is returned immediately.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Configuration`] when nothing is configured, the first
    /// non-engine error, or [`LifecycleError::AllEnginesFailed`].
    pub fn attempt_in_order<T, F>(&self, mut operation: F) -> Result<T, LifecycleError>
    where
        F: FnMut(&dyn StorageEngine) -> Result<T, LifecycleError>,
    {
        self.ensure_configured()?;
        let mut attempts = 0_usize;
        let mut last = None;

        for connector in &self.connectors {
            attempts += 1;
            let kind = connector.kind();
            let engine = match connector.connect() {
                Ok(engine) => engine,
                Err(err) => {
                    tracing::warn!(engine = %kind, error = %err, "engine connection failed");
                    last = Some(LifecycleError::engine(kind, err));
                    continue;
                }
            };

            tracing::info!(engine = %kind, attempt = attempts, "attempting operation");
            match operation(engine.as_ref()) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_engine_failure() => {
                    tracing::warn!(engine = %kind, error = %err, "engine failed; trying next");
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let last = last.unwrap_or_else(|| {
            LifecycleError::Configuration("no storage engine is configured".to_string())
        });
        Err(LifecycleError::AllEnginesFailed { attempts, last: Box::new(last) })
    }
}
