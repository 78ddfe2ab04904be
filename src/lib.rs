// Quarry - federated queries over databases, REST APIs and a model service
// Core library

pub mod config;
pub mod engine;
pub mod metrics;
pub mod model_rpc;
pub mod observability;
pub mod pushdown;

use std::sync::Arc;

use tokio::time::Instant;

pub use quarry_core;
use quarry_core::FederationResult;

use config::FederationConfig;
use engine::{HandlerManager, HandlerRegistry};
use model_rpc::{ModelController, ModelRpcClient};

/// Process-level wiring: configuration, the handler registry and the live
/// handler instances.
pub struct Federation {
    pub config: FederationConfig,
    pub registry: Arc<HandlerRegistry>,
    pub handlers: Arc<HandlerManager>,
}

impl Federation {
    pub fn new(config: FederationConfig) -> FederationResult<Self> {
        config.validate()?;
        let registry = Arc::new(HandlerRegistry::with_builtin_handlers());
        let handlers = Arc::new(HandlerManager::new(Arc::clone(&registry), config.clone()));
        Ok(Self {
            config,
            registry,
            handlers,
        })
    }

    /// Connects a model client using the configured transport.
    pub async fn model_client(
        &self,
        controller: Option<Arc<dyn ModelController>>,
        deadline: Option<Instant>,
    ) -> FederationResult<ModelRpcClient> {
        ModelRpcClient::from_config(&self.config.rpc, controller, deadline).await
    }

    /// Disconnects every handler.
    pub async fn shutdown(&self) {
        self.handlers.disconnect_all().await;
    }
}
