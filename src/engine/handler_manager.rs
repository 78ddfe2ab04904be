// SPDX-License-Identifier: Apache-2.0

//! Handler Manager
//!
//! Owns the named handler instances of a process. Lookups hand out
//! `Arc<dyn Handler>` so queries never hold the map lock while they run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use quarry_core::{FederationError, FederationResult, HandlerResponse, SelectQuery, StatusResponse};

use crate::config::FederationConfig;
use crate::engine::args::ConnectionArgs;
use crate::engine::connection::ConnectionState;
use crate::engine::predictors::{PredictorHandler, PREDICTORS_HANDLER};
use crate::engine::registry::{HandlerRegistry, HandlerSpec};
use crate::engine::traits::Handler;
use crate::metrics;
use crate::model_rpc::ModelInterface;

#[derive(Debug, Clone, Serialize)]
pub struct HandlerSummary {
    pub name: String,
    pub engine: String,
    pub state: ConnectionState,
}

pub struct HandlerManager {
    registry: Arc<HandlerRegistry>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    predictors: RwLock<Option<Arc<PredictorHandler>>>,
    config: FederationConfig,
}

impl HandlerManager {
    pub fn new(registry: Arc<HandlerRegistry>, config: FederationConfig) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            predictors: RwLock::new(None),
            config,
        }
    }

    /// Builds and registers a handler. The connection is opened lazily.
    #[instrument(skip(self, args), fields(engine = %engine, name = %name))]
    pub async fn create(
        &self,
        engine: &str,
        name: &str,
        args: ConnectionArgs,
    ) -> FederationResult<Arc<dyn Handler>> {
        debug!(args = ?args, "Building handler");
        let handler = self.registry.build(
            engine,
            HandlerSpec {
                name: name.to_string(),
                args,
                pushdown: self.config.pushdown.clone(),
            },
        )?;
        self.insert(Arc::clone(&handler)).await?;
        info!("Handler registered");
        Ok(handler)
    }

    /// Registers an already-built handler under its own name.
    pub async fn insert(&self, handler: Arc<dyn Handler>) -> FederationResult<()> {
        let mut handlers = self.handlers.write().await;
        let name = handler.name().to_string();
        if handlers.contains_key(&name) {
            return Err(FederationError::validation(format!(
                "handler '{name}' already exists"
            )));
        }
        handlers.insert(name, handler);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> FederationResult<Arc<dyn Handler>> {
        self.handlers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| FederationError::handler_not_found(name))
    }

    /// Removes a handler and closes its connection.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> FederationResult<()> {
        let handler = self
            .handlers
            .write()
            .await
            .remove(name)
            .ok_or_else(|| FederationError::handler_not_found(name))?;
        handler.disconnect().await;
        if name == PREDICTORS_HANDLER {
            self.predictors.write().await.take();
        }
        info!("Handler removed");
        Ok(())
    }

    /// Serves models from `models` as tables of the `predictors` handler.
    pub async fn attach_model_client(&self, models: Arc<dyn ModelInterface>) -> FederationResult<()> {
        let mut slot = self.predictors.write().await;
        if slot.is_some() {
            return Err(FederationError::validation("a model client is already attached"));
        }
        let handler = Arc::new(PredictorHandler::new(PREDICTORS_HANDLER, models));
        self.insert(Arc::clone(&handler) as Arc<dyn Handler>).await?;
        *slot = Some(handler);
        info!("Model client attached");
        Ok(())
    }

    /// Makes each described model queryable; returns how many were added.
    #[instrument(skip(self, model_data), fields(count = model_data.len()))]
    pub async fn register_predictors(&self, model_data: &[serde_json::Value]) -> FederationResult<usize> {
        self.predictor_handler().await?.register(model_data).await
    }

    /// Returns whether the predictor was registered.
    #[instrument(skip(self))]
    pub async fn unregister_predictor(&self, name: &str) -> FederationResult<bool> {
        Ok(self.predictor_handler().await?.unregister(name).await)
    }

    async fn predictor_handler(&self) -> FederationResult<Arc<PredictorHandler>> {
        self.predictors
            .read()
            .await
            .clone()
            .ok_or_else(|| FederationError::configuration("no model client attached"))
    }

    pub async fn list(&self) -> Vec<HandlerSummary> {
        let handlers: Vec<Arc<dyn Handler>> = self.handlers.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handlers.len());
        for handler in handlers {
            summaries.push(HandlerSummary {
                name: handler.name().to_string(),
                engine: handler.handler_type().to_string(),
                state: handler.connection_state().await,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    #[instrument(skip(self, text), fields(handler = %name))]
    pub async fn native_query(
        &self,
        name: &str,
        text: &str,
        limit: Option<Duration>,
    ) -> FederationResult<HandlerResponse> {
        let handler = self.get(name).await?;
        self.timed(limit, handler.native_query(text)).await
    }

    #[instrument(skip(self, query), fields(handler = %name))]
    pub async fn query(
        &self,
        name: &str,
        query: &SelectQuery,
        limit: Option<Duration>,
    ) -> FederationResult<HandlerResponse> {
        let handler = self.get(name).await?;
        self.timed(limit, handler.query(query)).await
    }

    /// Health sweep over every registered handler, run concurrently.
    pub async fn check_connections(&self) -> Vec<(String, StatusResponse)> {
        let handlers: Vec<Arc<dyn Handler>> = self.handlers.read().await.values().cloned().collect();
        let checks = handlers.iter().map(|handler| async move {
            let status = handler.check_connection().await;
            if !status.success {
                warn!(handler = handler.name(), error = ?status.error_message, "Health check failed");
            }
            (handler.name().to_string(), status)
        });
        let mut results = join_all(checks).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Disconnects every handler; instances stay registered.
    pub async fn disconnect_all(&self) {
        let handlers: Vec<Arc<dyn Handler>> = self.handlers.read().await.values().cloned().collect();
        join_all(handlers.iter().map(|h| h.disconnect())).await;
    }

    async fn timed<F>(&self, limit: Option<Duration>, fut: F) -> FederationResult<HandlerResponse>
    where
        F: std::future::Future<Output = FederationResult<HandlerResponse>>,
    {
        let limit = limit.unwrap_or_else(|| self.config.query_timeout());
        let start = Instant::now();
        let outcome = timeout(limit, fut).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => {
                let success = matches!(&result, Ok(response) if !response.is_error());
                metrics::record_query(elapsed_ms, success);
                result
            }
            Err(_) => {
                let err = FederationError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                };
                warn!(timeout_ms = limit.as_millis() as u64, "Query timed out");
                metrics::record_query(elapsed_ms, false);
                metrics::record_query_timeout();
                Ok(HandlerResponse::from(err))
            }
        }
    }
}
